// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport manager.
//!
//! Channels are addressed by the index returned from
//! [`TransportManager::open_transports`]. Indices are never reused; a closed
//! channel leaves an empty slot so later indices stay stable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dynamo_staging_common::{ChannelKind, ChannelRole, LibraryKey};
use futures::future::BoxFuture;

use super::{
    Channel, ChannelSpec, InProcLibrary, OpenMode, RequestHandler, TransportLibrary, ZmqLibrary,
};
use crate::error::{Result, StagingError};
use crate::params::Params;

/// Default timeout for [`TransportManager::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Write counters of a profiled channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelProfile {
    /// Completed writes.
    pub writes: u64,
    /// Bytes handed to the transport.
    pub bytes: u64,
    /// Cumulative time spent in writes.
    pub write_time: Duration,
}

struct OpenChannel {
    spec: ChannelSpec,
    channel: Box<dyn Channel>,
    profile: Option<ChannelProfile>,
}

/// Owns every open channel of a session.
pub struct TransportManager {
    libraries: HashMap<LibraryKey, Arc<dyn TransportLibrary>>,
    channels: Vec<Option<OpenChannel>>,
    handler: Option<Arc<dyn RequestHandler>>,
    request_timeout: Duration,
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open: Vec<String> = self.open_channels().map(|(_, spec)| spec.to_string()).collect();
        f.debug_struct("TransportManager")
            .field("libraries", &self.libraries.keys().collect::<Vec<_>>())
            .field("open", &open)
            .finish()
    }
}

impl TransportManager {
    /// A manager with the `zmq` library and a private `inproc` hub registered.
    pub fn new() -> Self {
        let mut manager = Self {
            libraries: HashMap::new(),
            channels: Vec::new(),
            handler: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        manager.register_library(Arc::new(ZmqLibrary));
        manager.register_library(Arc::new(InProcLibrary::default()));
        manager
    }

    /// Register (or replace) a library under its own key.
    pub fn register_library(
        &mut self,
        library: Arc<dyn TransportLibrary>,
    ) -> Option<Arc<dyn TransportLibrary>> {
        self.libraries.insert(library.key(), library)
    }

    /// Builder-style [`register_library`](Self::register_library).
    pub fn with_library(mut self, library: Arc<dyn TransportLibrary>) -> Self {
        self.register_library(library);
        self
    }

    /// Handler served by point-to-point channels opened after this call.
    pub fn set_request_handler(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handler = Some(handler);
    }

    #[allow(missing_docs)]
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    fn library(&self, key: &LibraryKey) -> Result<Arc<dyn TransportLibrary>> {
        self.libraries
            .get(key)
            .cloned()
            .ok_or_else(|| StagingError::UnknownLibrary(key.clone()))
    }

    /// Open one channel of `role` per parameter set.
    ///
    /// Each set resolves `{IPAddress, Port, Library, Name, Kind}`. With
    /// `profile` set, every write is counted. If any channel fails to open,
    /// the ones opened by this call are closed again before returning.
    pub async fn open_transports(
        &mut self,
        params_list: &[Params],
        mode: OpenMode,
        role: ChannelRole,
        profile: bool,
    ) -> Result<Vec<usize>> {
        if !mode.allows(role) {
            return Err(StagingError::invalid_configuration(
                "mode",
                format!("{role} channels cannot be opened in {mode} mode"),
            ));
        }

        let mut opened = Vec::with_capacity(params_list.len());
        for params in params_list {
            match self.open_one(params, role, profile).await {
                Ok(index) => opened.push(index),
                Err(e) => {
                    for index in opened {
                        if let Err(close_err) = self.close(Some(index)).await {
                            tracing::warn!(index, error = %close_err, "Failed to release channel while unwinding");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(opened)
    }

    async fn open_one(&mut self, params: &Params, role: ChannelRole, profile: bool) -> Result<usize> {
        let spec = ChannelSpec::from_params(params, role)?;
        let library = self.library(&spec.library)?;
        let handler = match role {
            ChannelRole::PointToPoint => self.handler.clone(),
            _ => None,
        };
        let channel = library.open(&spec, handler).await?;

        let index = self.channels.len();
        tracing::debug!(index, channel = %spec, name = %spec.name, "Opened channel");
        self.channels.push(Some(OpenChannel {
            spec,
            channel,
            profile: profile.then(ChannelProfile::default),
        }));
        Ok(index)
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut OpenChannel> {
        self.channels
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(StagingError::ChannelNotFound { index })
    }

    /// Hand `bytes` to channel `index`. Writes to one channel are FIFO.
    pub async fn write(&mut self, index: usize, bytes: Bytes) -> Result<()> {
        let slot = self.slot_mut(index)?;
        let len = bytes.len() as u64;
        let started = Instant::now();
        slot.channel.write(bytes).await?;
        if let Some(profile) = slot.profile.as_mut() {
            profile.writes += 1;
            profile.bytes += len;
            profile.write_time += started.elapsed();
        }
        tracing::trace!(index, bytes = len, "Wrote to channel");
        Ok(())
    }

    /// Next message on subscribe channel `index`, `None` on timeout.
    pub async fn read(&mut self, index: usize, timeout: Duration) -> Result<Option<Bytes>> {
        self.slot_mut(index)?.channel.read(timeout).await
    }

    /// Synchronous request/reply with the point-to-point channel at `addr`.
    ///
    /// The returned future does not borrow the manager.
    pub fn request(
        &self,
        library: &LibraryKey,
        addr: SocketAddr,
        request: Bytes,
    ) -> BoxFuture<'static, Result<Bytes>> {
        let library = self.library(library);
        let timeout = self.request_timeout;
        Box::pin(async move { library?.request(addr, request, timeout).await })
    }

    /// Flush one channel, or every open channel with `None`.
    pub async fn flush(&mut self, index: Option<usize>) -> Result<()> {
        match index {
            Some(index) => self.slot_mut(index)?.channel.flush().await,
            None => {
                for slot in self.channels.iter_mut().flatten() {
                    slot.channel.flush().await?;
                }
                Ok(())
            }
        }
    }

    /// Close one channel, or all with `None`. Closing a closed or unknown
    /// channel is a no-op. Every selected channel is released even if an
    /// earlier one fails; the first failure is returned.
    pub async fn close(&mut self, index: Option<usize>) -> Result<()> {
        let selected: Vec<usize> = match index {
            Some(index) => vec![index],
            None => (0..self.channels.len()).collect(),
        };

        let mut first_error = None;
        for index in selected {
            let Some(mut slot) = self.channels.get_mut(index).and_then(Option::take) else {
                continue;
            };
            match slot.channel.close().await {
                Ok(()) => tracing::debug!(index, channel = %slot.spec, "Closed channel"),
                Err(e) => {
                    tracing::warn!(index, channel = %slot.spec, error = %e, "Failed to close channel");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Open channels carrying `kind`.
    pub fn channel_count(&self, kind: ChannelKind) -> usize {
        self.open_channels()
            .filter(|(_, spec)| spec.kind == kind)
            .count()
    }

    /// Index of the first open channel with this kind and role.
    pub fn find(&self, kind: ChannelKind, role: ChannelRole) -> Option<usize> {
        self.open_channels()
            .find(|(_, spec)| spec.kind == kind && spec.role == role)
            .map(|(index, _)| index)
    }

    /// Open channels with their indices.
    pub fn open_channels(&self) -> impl Iterator<Item = (usize, &ChannelSpec)> {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (index, &slot.spec)))
    }

    #[allow(missing_docs)]
    pub fn spec(&self, index: usize) -> Option<&ChannelSpec> {
        self.channels.get(index)?.as_ref().map(|slot| &slot.spec)
    }

    /// Counters of a profiled channel.
    pub fn profile(&self, index: usize) -> Option<ChannelProfile> {
        self.channels.get(index)?.as_ref()?.profile
    }

    /// No channel is open.
    pub fn is_empty(&self) -> bool {
        self.open_channels().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcHub;

    fn channel_params(port: u16) -> Params {
        Params::from([
            ("IPAddress", "10.0.0.5".to_string()),
            ("Port", port.to_string()),
            ("Library", "inproc".to_string()),
        ])
    }

    fn manager(hub: &InProcHub) -> TransportManager {
        TransportManager::new().with_library(Arc::new(InProcLibrary::new(hub.clone())))
    }

    struct Fixed(&'static [u8]);

    impl RequestHandler for Fixed {
        fn handle(&self, _request: Bytes) -> Bytes {
            Bytes::from_static(self.0)
        }
    }

    #[tokio::test]
    async fn test_open_write_profile_close() {
        let hub = InProcHub::new();
        let mut transports = manager(&hub);

        let indices = transports
            .open_transports(&[channel_params(7000)], OpenMode::Write, ChannelRole::Publish, true)
            .await
            .unwrap();
        assert_eq!(indices, vec![0]);
        assert_eq!(transports.channel_count(ChannelKind::Metadata), 1);
        assert_eq!(
            transports.find(ChannelKind::Metadata, ChannelRole::Publish),
            Some(0)
        );

        transports.write(0, Bytes::from_static(b"abc")).await.unwrap();
        transports.write(0, Bytes::from_static(b"de")).await.unwrap();
        let profile = transports.profile(0).unwrap();
        assert_eq!(profile.writes, 2);
        assert_eq!(profile.bytes, 5);
        assert_eq!(hub.published("10.0.0.5:7000").len(), 2);

        transports.close(None).await.unwrap();
        assert!(transports.is_empty());
        assert!(!hub.is_bound("10.0.0.5:7000"));

        transports.close(None).await.unwrap();
        transports.close(Some(0)).await.unwrap();
        transports.close(Some(42)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unprofiled_channel_has_no_counters() {
        let hub = InProcHub::new();
        let mut transports = manager(&hub);
        transports
            .open_transports(&[channel_params(7100)], OpenMode::Write, ChannelRole::Publish, false)
            .await
            .unwrap();
        transports.write(0, Bytes::from_static(b"x")).await.unwrap();
        assert!(transports.profile(0).is_none());
    }

    #[tokio::test]
    async fn test_failed_open_releases_earlier_channels() {
        let hub = InProcHub::new();
        let mut transports = manager(&hub);

        // second set collides with the first
        let err = transports
            .open_transports(
                &[channel_params(7200), channel_params(7200)],
                OpenMode::Write,
                ChannelRole::Publish,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::TransportFailure { .. }));
        assert!(transports.is_empty());
        assert_eq!(hub.bound_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_library() {
        let mut transports = TransportManager::new();
        let params = channel_params(7300).with("Library", "ucx");
        let err = transports
            .open_transports(&[params], OpenMode::Write, ChannelRole::Publish, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::UnknownLibrary(key) if key.as_str() == "ucx"));
    }

    #[tokio::test]
    async fn test_mode_must_allow_role() {
        let mut transports = TransportManager::new();
        let err = transports
            .open_transports(&[channel_params(7400)], OpenMode::Read, ChannelRole::Publish, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let hub = InProcHub::new();
        let mut transports = manager(&hub);
        transports.set_request_handler(Arc::new(Fixed(b"pong")));
        transports
            .open_transports(
                &[channel_params(7500)],
                OpenMode::Write,
                ChannelRole::PointToPoint,
                false,
            )
            .await
            .unwrap();
        assert_eq!(transports.channel_count(ChannelKind::Data), 1);

        let reply = transports
            .request(
                &LibraryKey::from("inproc"),
                "10.0.0.5:7500".parse().unwrap(),
                Bytes::from_static(b"ping"),
            )
            .await
            .unwrap();
        assert_eq!(reply, "pong");
    }

    #[tokio::test]
    async fn test_write_to_missing_channel() {
        let mut transports = TransportManager::new();
        let err = transports
            .write(3, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::ChannelNotFound { index: 3 }));
        assert!(transports.flush(Some(3)).await.is_err());
        transports.flush(None).await.unwrap();
    }
}
