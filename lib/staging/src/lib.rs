// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Streaming staging writer.
//!
//! A [`StagingWriter`] publishes a named stream of steps from a group of
//! cooperating processes. Each step's variables are serialized per rank; the
//! per-rank metadata is gathered to rank 0 and published on a metadata
//! channel, while the data packs stay on their ranks and are served on
//! request over point-to-point data channels.
//!
//! # Open
//!
//! Opening is collective and runs in two phases:
//! 1. **Prepare**: resolve [`Params`] into [`EngineSettings`] and pick this
//!    rank's network address, deriving its ports from the base port.
//! 2. **Resources**: rank 0 publishes the discovery artifact and binds the
//!    metadata channel; every rank binds its data channel. The ranks then
//!    exchange their endpoints into an [`EndpointTable`], checking each
//!    against the layout derived from the base port.
//!
//! The group agrees on the outcome after each phase, so a failure on any rank
//! fails the open on every rank and leaves nothing bound.
//!
//! # Transports
//!
//! Channels come from a [`transport::TransportLibrary`] selected by the
//! `Library` parameter. `zmq` (the default) binds real sockets; `inproc`
//! routes through an in-memory [`transport::InProcHub`].

pub mod engine;
pub mod error;
pub mod group;
pub mod handshake;
pub mod logging;
pub mod params;
pub mod serializer;
pub mod step;
pub mod transport;

pub use engine::{StagingWriter, StagingWriterBuilder};
pub use error::{Result, StagingError};
pub use group::{LocalGroup, ProcessGroup, SoloGroup};
pub use handshake::{
    DEFAULT_HANDSHAKE_FILE, DiscoveryArtifact, InterfaceResolver, InterfaceSelector,
    NetworkInterface, StaticInterfaces, SystemInterfaces,
};
pub use params::{EngineSettings, EngineSettingsBuilder, Params, Verbosity};
pub use serializer::{
    AggregatedMetadata, AggregatedMetadataPack, LocalDataPack, MsgpackSerializer, PackQueue,
    StepSerializer, VariableEntry,
};
pub use step::{PutMode, StepMode, StepState, StepStatus};

pub use dynamo_staging_common::{
    ChannelKind, ChannelRole, DEFAULT_BASE_PORT, Element, ElementType, EndpointError,
    EndpointRecord, EndpointTable, JOINED_DIM, LibraryKey, ShapeKind, VariableDescriptor,
};
