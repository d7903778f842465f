// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint handshake.
//!
//! Each rank picks a local address with an [`InterfaceSelector`] and derives
//! its ports from `(base_port, rank, group_size)`. Rank 0 then publishes its
//! address through a [`DiscoveryArtifact`], the only rendezvous between the
//! writer group and a reader.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dynamo_staging_common::EndpointRecord;
use tokio::time::Instant;

use crate::error::{Result, StagingError};

/// Default location of the discovery artifact, relative to the working directory.
pub const DEFAULT_HANDSHAKE_FILE: &str = ".StagingHandshake";

/// One enumerated interface address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// OS interface name, e.g. `eth0`.
    pub name: String,
    /// Address bound to the interface.
    pub ip: IpAddr,
}

impl NetworkInterface {
    #[allow(missing_docs)]
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }
}

/// Source of local interface addresses.
pub trait InterfaceResolver: Send + Sync {
    /// Interfaces in enumeration order. An empty list is not an error here.
    fn interfaces(&self) -> Result<Vec<NetworkInterface>>;
}

/// Interfaces reported by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceResolver for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>> {
        match local_ip_address::list_afinet_netifas() {
            Ok(list) => Ok(list
                .into_iter()
                .map(|(name, ip)| NetworkInterface { name, ip })
                .collect()),
            Err(local_ip_address::Error::LocalIpAddressNotFound) => Ok(Vec::new()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to enumerate network interfaces");
                Ok(Vec::new())
            }
        }
    }
}

/// A fixed interface list, for tests and for embedders that already know
/// their fabric.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    interfaces: Vec<NetworkInterface>,
}

impl StaticInterfaces {
    #[allow(missing_docs)]
    pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
        Self { interfaces }
    }

    /// A host with no usable interfaces.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, name: impl Into<String>, ip: IpAddr) -> Self {
        self.interfaces.push(NetworkInterface::new(name, ip));
        self
    }
}

impl InterfaceResolver for StaticInterfaces {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>> {
        Ok(self.interfaces.clone())
    }
}

/// How the session address is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InterfaceSelector {
    /// First non-loopback address in enumeration order.
    #[default]
    First,
    /// First address of the interface with this name.
    Named(String),
    /// This exact address, which must belong to a local interface.
    Address(IpAddr),
}

impl fmt::Display for InterfaceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceSelector::First => write!(f, "first non-loopback interface"),
            InterfaceSelector::Named(name) => write!(f, "interface {name}"),
            InterfaceSelector::Address(ip) => write!(f, "address {ip}"),
        }
    }
}

impl InterfaceSelector {
    /// Pick the session address from `interfaces`.
    ///
    /// An empty list fails with [`StagingError::NoNetworkInterface`] whatever
    /// the selector.
    pub fn select(&self, interfaces: &[NetworkInterface]) -> Result<IpAddr> {
        if interfaces.is_empty() {
            return Err(StagingError::NoNetworkInterface);
        }
        match self {
            InterfaceSelector::Address(ip) => interfaces
                .iter()
                .find(|i| i.ip == *ip)
                .map(|i| i.ip)
                .ok_or_else(|| self.not_found()),
            InterfaceSelector::First => interfaces
                .iter()
                .find(|i| !i.ip.is_loopback() && !i.ip.is_unspecified())
                .map(|i| i.ip)
                .ok_or(StagingError::NoNetworkInterface),
            InterfaceSelector::Named(name) => interfaces
                .iter()
                .find(|i| &i.name == name)
                .map(|i| i.ip)
                .ok_or_else(|| self.not_found()),
        }
    }

    fn not_found(&self) -> StagingError {
        StagingError::InterfaceNotFound {
            selector: self.to_string(),
        }
    }
}

/// Resolve this rank's endpoint: pick an address, derive the ports.
///
/// Runs before any artifact is written, so a failure here leaves nothing
/// behind.
pub fn resolve_endpoint(
    resolver: &dyn InterfaceResolver,
    selector: &InterfaceSelector,
    base_port: u16,
    rank: usize,
    group_size: usize,
) -> Result<EndpointRecord> {
    let interfaces = resolver.interfaces()?;
    tracing::debug!(rank, count = interfaces.len(), %selector, "Enumerated network interfaces");
    let ip = selector.select(&interfaces)?;
    Ok(EndpointRecord::derive(ip, base_port, rank, group_size)?)
}

/// Shared file carrying rank 0's address as raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryArtifact {
    path: PathBuf,
}

impl DiscoveryArtifact {
    #[allow(missing_docs)]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[allow(missing_docs)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `ip` atomically: temp file in the same directory, then rename.
    pub async fn publish(&self, ip: IpAddr) -> Result<()> {
        let temp_name = format!(
            "{}.tmp.{}",
            self.path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy(),
            uuid::Uuid::new_v4()
        );
        let temp_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.error(e))?;
                parent.join(&temp_name)
            }
            _ => PathBuf::from(&temp_name),
        };

        tokio::fs::write(&temp_path, ip.to_string())
            .await
            .map_err(|e| self.error(e))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(self.error(e));
        }

        tracing::debug!(path = %self.path.display(), %ip, "Published discovery artifact");
        Ok(())
    }

    /// Read and parse the published address.
    pub async fn read(&self) -> Result<IpAddr> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.error(e))?;
        raw.trim().parse().map_err(|e| {
            self.error(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("'{}' is not an IP address: {e}", raw.trim()),
            ))
        })
    }

    /// Retry [`read`](Self::read) every `interval` until it succeeds or
    /// `timeout` elapses.
    pub async fn poll(&self, timeout: Duration, interval: Duration) -> Result<IpAddr> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read().await {
                Ok(ip) => return Ok(ip),
                Err(e) if Instant::now() + interval > deadline => return Err(e),
                Err(_) => tokio::time::sleep(interval).await,
            }
        }
    }

    /// Remove the artifact. A missing artifact is not an error.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }

    #[allow(missing_docs)]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn error(&self, source: io::Error) -> StagingError {
        StagingError::Discovery {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn host() -> StaticInterfaces {
        StaticInterfaces::none()
            .with("lo", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with("eth0", ip("10.0.0.5"))
            .with("ib0", ip("192.168.10.5"))
    }

    #[test]
    fn test_first_skips_loopback() {
        let interfaces = host().interfaces().unwrap();
        assert_eq!(
            InterfaceSelector::First.select(&interfaces).unwrap(),
            ip("10.0.0.5")
        );
    }

    #[test]
    fn test_no_interfaces() {
        let err = InterfaceSelector::First.select(&[]).unwrap_err();
        assert!(matches!(err, StagingError::NoNetworkInterface));

        let loopback_only = StaticInterfaces::none()
            .with("lo", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .interfaces()
            .unwrap();
        assert!(matches!(
            InterfaceSelector::First.select(&loopback_only),
            Err(StagingError::NoNetworkInterface)
        ));
    }

    #[test]
    fn test_named_and_address_selection() {
        let interfaces = host().interfaces().unwrap();
        assert_eq!(
            InterfaceSelector::Named("ib0".into())
                .select(&interfaces)
                .unwrap(),
            ip("192.168.10.5")
        );
        assert!(matches!(
            InterfaceSelector::Named("ib1".into()).select(&interfaces),
            Err(StagingError::InterfaceNotFound { .. })
        ));
        assert_eq!(
            InterfaceSelector::Address(ip("127.0.0.1"))
                .select(&interfaces)
                .unwrap(),
            ip("127.0.0.1")
        );
        assert!(matches!(
            InterfaceSelector::Address(ip("10.9.9.9")).select(&interfaces),
            Err(StagingError::InterfaceNotFound { .. })
        ));
    }

    #[test]
    fn test_no_interfaces_fails_every_selector() {
        for selector in [
            InterfaceSelector::First,
            InterfaceSelector::Named("eth0".into()),
            InterfaceSelector::Address(ip("10.9.9.9")),
        ] {
            assert!(
                matches!(selector.select(&[]), Err(StagingError::NoNetworkInterface)),
                "{selector}"
            );
        }
    }

    #[test]
    fn test_resolve_endpoint_derives_ports() {
        let record =
            resolve_endpoint(&host(), &InterfaceSelector::First, 12306, 1, 4).unwrap();
        assert_eq!(record.ip(), ip("10.0.0.5"));
        assert_eq!(record.metadata_port(), 12307);
        assert_eq!(record.data_port(), 12311);
    }

    #[tokio::test]
    async fn test_artifact_publish_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = DiscoveryArtifact::new(dir.path().join("nested").join(".StagingHandshake"));
        assert!(!artifact.exists());

        artifact.publish(ip("10.0.0.5")).await.unwrap();
        assert!(artifact.exists());
        assert_eq!(artifact.read().await.unwrap(), ip("10.0.0.5"));

        let raw = std::fs::read_to_string(artifact.path()).unwrap();
        assert_eq!(raw, "10.0.0.5");

        // no temp files left behind
        let entries = std::fs::read_dir(artifact.path().parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(entries, 1);

        artifact.remove().await.unwrap();
        assert!(!artifact.exists());
        artifact.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_artifact_read_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = DiscoveryArtifact::new(dir.path().join("handshake"));
        std::fs::write(artifact.path(), "not-an-ip").unwrap();
        assert!(matches!(
            artifact.read().await,
            Err(StagingError::Discovery { .. })
        ));
    }

    #[tokio::test]
    async fn test_artifact_poll() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = DiscoveryArtifact::new(dir.path().join("handshake"));

        let missing = artifact
            .poll(Duration::from_millis(50), Duration::from_millis(10))
            .await;
        assert!(missing.is_err());

        let writer = artifact.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.publish(ip("10.0.0.7")).await.unwrap();
        });

        let found = artifact
            .poll(Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(found, ip("10.0.0.7"));
        handle.await.unwrap();
    }
}
