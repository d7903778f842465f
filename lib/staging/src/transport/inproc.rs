// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory transport library.
//!
//! Channels on the same [`InProcHub`] see each other by `host:port`. Binds are
//! exclusive per address, just like sockets, and the most recent published
//! messages are kept in a bounded per-address log so tests can inspect what
//! went out.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dynamo_staging_common::{ChannelRole, LibraryKey, format_socket_addr};
use tokio::sync::broadcast;

use super::{Channel, ChannelSpec, RequestHandler, TransportLibrary};
use crate::error::{Result, StagingError};

const TOPIC_CAPACITY: usize = 1024;

/// Messages retained per address by [`InProcHub::published`].
pub const DEFAULT_PUBLISH_LOG_LIMIT: usize = 1024;

/// Shared address space for in-process channels.
#[derive(Clone, Default)]
pub struct InProcHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    bound: DashMap<String, ChannelRole>,
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    responders: DashMap<String, Arc<dyn RequestHandler>>,
    published: DashMap<String, VecDeque<Bytes>>,
    publish_log_limit: usize,
}

impl Default for HubInner {
    fn default() -> Self {
        Self {
            bound: DashMap::new(),
            topics: DashMap::new(),
            responders: DashMap::new(),
            published: DashMap::new(),
            publish_log_limit: DEFAULT_PUBLISH_LOG_LIMIT,
        }
    }
}

impl std::fmt::Debug for InProcHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcHub")
            .field("bound", &self.inner.bound.len())
            .finish()
    }
}

impl InProcHub {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub keeping only the last `limit` published messages per address.
    pub fn with_publish_log_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                publish_log_limit: limit,
                ..HubInner::default()
            }),
        }
    }

    /// Whether some channel currently binds `addr`.
    pub fn is_bound(&self, addr: &str) -> bool {
        self.inner.bound.contains_key(addr)
    }

    /// Number of bound addresses.
    pub fn bound_count(&self) -> usize {
        self.inner.bound.len()
    }

    /// Role of the channel bound at `addr`.
    pub fn bound_role(&self, addr: &str) -> Option<ChannelRole> {
        self.inner.bound.get(addr).map(|role| *role)
    }

    /// The most recent messages published at `addr`, oldest first.
    pub fn published(&self, addr: &str) -> Vec<Bytes> {
        self.inner
            .published
            .get(addr)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn bind(&self, spec: &ChannelSpec) -> Result<String> {
        let addr = spec.addr();
        match self.inner.bound.entry(addr.clone()) {
            Entry::Occupied(existing) => Err(StagingError::transport(
                spec,
                format!("address in use by a {} channel", existing.get()),
            )),
            Entry::Vacant(slot) => {
                slot.insert(spec.role);
                Ok(addr)
            }
        }
    }

    fn unbind(&self, addr: &str) {
        self.inner.bound.remove(addr);
        self.inner.responders.remove(addr);
    }

    fn topic(&self, addr: &str) -> broadcast::Sender<Bytes> {
        self.inner
            .topics
            .entry(addr.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn record(&self, addr: &str, bytes: Bytes) {
        let limit = self.inner.publish_log_limit;
        if limit == 0 {
            return;
        }
        let mut log = self.inner.published.entry(addr.to_string()).or_default();
        if log.len() == limit {
            log.pop_front();
        }
        log.push_back(bytes);
    }

    fn responder(&self, addr: &str) -> Option<Arc<dyn RequestHandler>> {
        self.inner.responders.get(addr).map(|h| h.clone())
    }
}

/// [`TransportLibrary`] over an [`InProcHub`].
#[derive(Debug, Clone, Default)]
pub struct InProcLibrary {
    hub: InProcHub,
}

impl InProcLibrary {
    /// Library key.
    pub const KEY: &'static str = "inproc";

    #[allow(missing_docs)]
    pub fn new(hub: InProcHub) -> Self {
        Self { hub }
    }

    #[allow(missing_docs)]
    pub fn hub(&self) -> &InProcHub {
        &self.hub
    }
}

#[async_trait]
impl TransportLibrary for InProcLibrary {
    fn key(&self) -> LibraryKey {
        LibraryKey::from(Self::KEY)
    }

    async fn open(
        &self,
        spec: &ChannelSpec,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Box<dyn Channel>> {
        match spec.role {
            ChannelRole::Publish => {
                let addr = self.hub.bind(spec)?;
                let sender = self.hub.topic(&addr);
                Ok(Box::new(InProcPublisher {
                    hub: self.hub.clone(),
                    addr,
                    sender,
                }))
            }
            ChannelRole::Subscribe => {
                let addr = spec.addr();
                let receiver = self.hub.topic(&addr).subscribe();
                Ok(Box::new(InProcSubscriber { addr, receiver }))
            }
            ChannelRole::PointToPoint => {
                let handler = handler
                    .ok_or_else(|| StagingError::transport(spec, "no request handler to serve"))?;
                let addr = self.hub.bind(spec)?;
                self.hub.inner.responders.insert(addr.clone(), handler);
                Ok(Box::new(InProcResponder {
                    hub: self.hub.clone(),
                    addr,
                }))
            }
        }
    }

    async fn request(&self, addr: SocketAddr, request: Bytes, _timeout: Duration) -> Result<Bytes> {
        let key = format_socket_addr(&addr.ip().to_string(), addr.port());
        let handler = self
            .hub
            .responder(&key)
            .ok_or_else(|| StagingError::transport(format!("inproc://{key}"), "connection refused"))?;
        Ok(handler.handle(request))
    }
}

fn unsupported(addr: &str, operation: &str, role: ChannelRole) -> StagingError {
    StagingError::transport(
        format!("inproc://{addr}"),
        format!("{operation} is not supported on a {role} channel"),
    )
}

struct InProcPublisher {
    hub: InProcHub,
    addr: String,
    sender: broadcast::Sender<Bytes>,
}

#[async_trait]
impl Channel for InProcPublisher {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.hub.record(&self.addr, bytes.clone());
        // no subscribers is fine for a broadcast
        let _ = self.sender.send(bytes);
        Ok(())
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Option<Bytes>> {
        Err(unsupported(&self.addr, "read", ChannelRole::Publish))
    }

    async fn close(&mut self) -> Result<()> {
        self.hub.unbind(&self.addr);
        Ok(())
    }
}

struct InProcSubscriber {
    addr: String,
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl Channel for InProcSubscriber {
    async fn write(&mut self, _bytes: Bytes) -> Result<()> {
        Err(unsupported(&self.addr, "write", ChannelRole::Subscribe))
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let recv = async {
            loop {
                match self.receiver.recv().await {
                    Ok(bytes) => return Ok(bytes),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(addr = %self.addr, skipped, "Subscriber lagged behind publisher");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StagingError::transport(
                            format!("inproc://{}", self.addr),
                            "publisher closed",
                        ));
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, recv).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct InProcResponder {
    hub: InProcHub,
    addr: String,
}

#[async_trait]
impl Channel for InProcResponder {
    async fn write(&mut self, _bytes: Bytes) -> Result<()> {
        Err(unsupported(&self.addr, "write", ChannelRole::PointToPoint))
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Option<Bytes>> {
        Err(unsupported(&self.addr, "read", ChannelRole::PointToPoint))
    }

    async fn close(&mut self) -> Result<()> {
        self.hub.unbind(&self.addr);
        Ok(())
    }
}
