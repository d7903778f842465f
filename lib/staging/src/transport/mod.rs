// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channels and the libraries that open them.
//!
//! The [`TransportManager`](manager::TransportManager) owns every open
//! channel; a [`TransportLibrary`] supplies only the socket mechanics for one
//! family of channels (`zmq`, `inproc`).

pub mod inproc;
pub mod manager;
pub mod zmq;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dynamo_staging_common::{ChannelKind, ChannelRole, LibraryKey, format_socket_addr};

use crate::error::{Result, StagingError};
use crate::params::{DEFAULT_LIBRARY, Params};

pub use inproc::{InProcHub, InProcLibrary};
pub use manager::{ChannelProfile, TransportManager};
pub use zmq::ZmqLibrary;

/// Answers point-to-point requests arriving on a data channel.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the reply for one request. An empty reply means "nothing here".
    fn handle(&self, request: Bytes) -> Bytes;
}

/// Access mode a channel set is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Producer side: publish and point-to-point channels.
    #[default]
    Write,
    /// Producer side, continuing an existing stream.
    Append,
    /// Consumer side: subscribe channels.
    Read,
}

impl OpenMode {
    /// Whether channels of `role` may be opened in this mode.
    pub fn allows(self, role: ChannelRole) -> bool {
        match self {
            OpenMode::Write | OpenMode::Append => role != ChannelRole::Subscribe,
            OpenMode::Read => role == ChannelRole::Subscribe,
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::Write => write!(f, "write"),
            OpenMode::Append => write!(f, "append"),
            OpenMode::Read => write!(f, "read"),
        }
    }
}

/// Everything needed to open one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// What the channel carries.
    pub kind: ChannelKind,
    /// How its socket participates.
    pub role: ChannelRole,
    /// Address to bind (publish, point-to-point) or connect to (subscribe).
    pub ip: IpAddr,
    #[allow(missing_docs)]
    pub port: u16,
    /// Library that opens the socket.
    pub library: LibraryKey,
    /// Free-form name for logs.
    pub name: String,
}

impl ChannelSpec {
    /// Resolve `{IPAddress, Port, Library, Name, Kind}` from one parameter set.
    ///
    /// `IPAddress` and `Port` are required. `Kind` defaults to metadata for
    /// publish/subscribe and data for point-to-point.
    pub fn from_params(params: &Params, role: ChannelRole) -> Result<Self> {
        let ip = params
            .get("IPAddress")
            .ok_or_else(|| StagingError::invalid_configuration("IPAddress", "required"))?;
        let ip: IpAddr = ip.trim().parse().map_err(|_| {
            StagingError::invalid_configuration("IPAddress", format!("'{ip}' is not an IP address"))
        })?;

        let port = params
            .get_int("Port")
            .ok_or_else(|| StagingError::invalid_configuration("Port", "required integer"))?;
        let port = u16::try_from(port).map_err(|_| {
            StagingError::invalid_configuration("Port", format!("must be in [0, 65535], got {port}"))
        })?;

        let kind = match params.get("Kind") {
            Some(kind) => ChannelKind::from_str(kind)
                .map_err(|e| StagingError::invalid_configuration("Kind", e.to_string()))?,
            None if role == ChannelRole::PointToPoint => ChannelKind::Data,
            None => ChannelKind::Metadata,
        };

        Ok(Self {
            kind,
            role,
            ip,
            port,
            library: LibraryKey::from(params.get("Library").unwrap_or(DEFAULT_LIBRARY)),
            name: params.get_string("Name").unwrap_or_else(|| kind.to_string()),
        })
    }

    /// `host:port`, IPv6 hosts bracketed.
    pub fn addr(&self) -> String {
        format_socket_addr(&self.ip.to_string(), self.port)
    }

    #[allow(missing_docs)]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}://{}",
            self.kind,
            self.role,
            self.library,
            self.addr()
        )
    }
}

/// One open socket.
#[async_trait]
pub trait Channel: Send {
    /// Send bytes; publish channels broadcast them to every subscriber.
    async fn write(&mut self, bytes: Bytes) -> Result<()>;

    /// Receive the next message, `None` when `timeout` elapses first.
    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Push out anything the library batches internally.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the socket. Called once by the manager.
    async fn close(&mut self) -> Result<()>;
}

/// Opens channels of one family.
#[async_trait]
pub trait TransportLibrary: Send + Sync {
    /// Key selected by the `Library` parameter.
    fn key(&self) -> LibraryKey;

    /// Open a channel. Point-to-point channels serve `handler`.
    async fn open(
        &self,
        spec: &ChannelSpec,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Box<dyn Channel>>;

    /// One synchronous request/reply exchange with the point-to-point
    /// channel bound at `addr`.
    async fn request(&self, addr: SocketAddr, request: Bytes, timeout: Duration) -> Result<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_params() {
        let params = Params::from([
            ("IPAddress", "10.0.0.5"),
            ("Port", "12306"),
            ("Library", "InProc"),
        ]);
        let spec = ChannelSpec::from_params(&params, ChannelRole::Publish).unwrap();
        assert_eq!(spec.kind, ChannelKind::Metadata);
        assert_eq!(spec.library.as_str(), "inproc");
        assert_eq!(spec.addr(), "10.0.0.5:12306");
        assert_eq!(spec.to_string(), "metadata publish inproc://10.0.0.5:12306");

        let spec = ChannelSpec::from_params(&params, ChannelRole::PointToPoint).unwrap();
        assert_eq!(spec.kind, ChannelKind::Data);
    }

    #[test]
    fn test_spec_requires_address_and_port() {
        let missing_ip = Params::from([("Port", "1")]);
        assert!(ChannelSpec::from_params(&missing_ip, ChannelRole::Publish).is_err());

        let bad_port = Params::from([("IPAddress", "10.0.0.5"), ("Port", "99999")]);
        assert!(ChannelSpec::from_params(&bad_port, ChannelRole::Publish).is_err());

        let bad_kind = Params::from([("IPAddress", "10.0.0.5"), ("Port", "1"), ("Kind", "ctl")]);
        assert!(ChannelSpec::from_params(&bad_kind, ChannelRole::Publish).is_err());
    }

    #[test]
    fn test_open_mode_roles() {
        assert!(OpenMode::Write.allows(ChannelRole::Publish));
        assert!(OpenMode::Append.allows(ChannelRole::PointToPoint));
        assert!(!OpenMode::Write.allows(ChannelRole::Subscribe));
        assert!(OpenMode::Read.allows(ChannelRole::Subscribe));
        assert!(!OpenMode::Read.allows(ChannelRole::Publish));
    }
}
