// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: writers on an in-memory hub with a fixed interface list.

#![allow(dead_code)]

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dynamo_staging::transport::{InProcHub, InProcLibrary};
use dynamo_staging::{Params, ProcessGroup, StagingWriter, StaticInterfaces};

pub const HOST_IP: &str = "10.0.0.5";

pub fn host_ip() -> IpAddr {
    HOST_IP.parse().unwrap()
}

pub fn interfaces() -> StaticInterfaces {
    StaticInterfaces::none()
        .with("lo", "127.0.0.1".parse().unwrap())
        .with("eth0", host_ip())
}

pub fn handshake_path(dir: &Path) -> PathBuf {
    dir.join(".StagingHandshake")
}

/// Parameters for an in-process writer whose artifact lands in `dir`.
pub fn inproc_params(dir: &Path) -> Params {
    Params::from([
        ("Library", "inproc".to_string()),
        ("HandshakeFile", handshake_path(dir).display().to_string()),
    ])
}

pub fn inproc_writer(name: &str, hub: &InProcHub, group: Arc<dyn ProcessGroup>) -> StagingWriter {
    StagingWriter::builder(name)
        .group(group)
        .resolver(Arc::new(interfaces()))
        .library(Arc::new(InProcLibrary::new(hub.clone())))
        .build()
        .unwrap()
}
