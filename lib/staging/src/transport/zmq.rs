// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! ZeroMQ transport library.
//!
//! - publish: PUB socket bound to `tcp://ip:port`
//! - subscribe: SUB socket connected to the publisher, subscribed to everything
//! - point-to-point: REP socket bound to `tcp://ip:port`, served by a task
//! - request: transient REQ socket, one exchange, then closed

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dynamo_staging_common::{ChannelRole, LibraryKey, format_socket_addr};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeromq::{PubSocket, RepSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use super::{Channel, ChannelSpec, RequestHandler, TransportLibrary};
use crate::error::{Result, StagingError};

fn tcp_endpoint(addr: &str) -> String {
    format!("tcp://{addr}")
}

fn first_frame(message: ZmqMessage) -> Bytes {
    message.into_vec().into_iter().next().unwrap_or_default()
}

/// [`TransportLibrary`] backed by the `zeromq` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZmqLibrary;

impl ZmqLibrary {
    /// Library key.
    pub const KEY: &'static str = "zmq";
}

#[async_trait]
impl TransportLibrary for ZmqLibrary {
    fn key(&self) -> LibraryKey {
        LibraryKey::from(Self::KEY)
    }

    async fn open(
        &self,
        spec: &ChannelSpec,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Box<dyn Channel>> {
        let endpoint = tcp_endpoint(&spec.addr());
        match spec.role {
            ChannelRole::Publish => {
                let mut socket = PubSocket::new();
                socket
                    .bind(&endpoint)
                    .await
                    .map_err(|e| StagingError::transport(spec, e))?;
                tracing::debug!(%endpoint, "Bound zmq publisher");
                Ok(Box::new(ZmqPublisher {
                    endpoint,
                    socket: Some(socket),
                }))
            }
            ChannelRole::Subscribe => {
                let mut socket = SubSocket::new();
                socket
                    .connect(&endpoint)
                    .await
                    .map_err(|e| StagingError::transport(spec, e))?;
                socket
                    .subscribe("")
                    .await
                    .map_err(|e| StagingError::transport(spec, e))?;
                tracing::debug!(%endpoint, "Connected zmq subscriber");
                Ok(Box::new(ZmqSubscriber {
                    endpoint,
                    socket: Some(socket),
                }))
            }
            ChannelRole::PointToPoint => {
                let handler = handler
                    .ok_or_else(|| StagingError::transport(spec, "no request handler to serve"))?;
                let mut socket = RepSocket::new();
                socket
                    .bind(&endpoint)
                    .await
                    .map_err(|e| StagingError::transport(spec, e))?;
                tracing::debug!(%endpoint, "Bound zmq responder");

                let cancel = CancellationToken::new();
                let task = tokio::spawn(serve_requests(
                    socket,
                    endpoint.clone(),
                    handler,
                    cancel.clone(),
                ));
                Ok(Box::new(ZmqResponder {
                    endpoint,
                    cancel,
                    task: Some(task),
                }))
            }
        }
    }

    async fn request(&self, addr: SocketAddr, request: Bytes, timeout: Duration) -> Result<Bytes> {
        let endpoint = tcp_endpoint(&format_socket_addr(&addr.ip().to_string(), addr.port()));
        let exchange = async {
            let mut socket = ReqSocket::new();
            socket
                .connect(&endpoint)
                .await
                .map_err(|e| StagingError::transport(&endpoint, e))?;
            socket
                .send(ZmqMessage::from(request))
                .await
                .map_err(|e| StagingError::transport(&endpoint, e))?;
            let reply = socket
                .recv()
                .await
                .map_err(|e| StagingError::transport(&endpoint, e))?;
            let _ = socket.close().await;
            Ok(first_frame(reply))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                StagingError::transport(&endpoint, format!("no reply within {timeout:?}"))
            })?
    }
}

async fn serve_requests(
    mut socket: RepSocket,
    endpoint: String,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(%endpoint, "Responder received cancellation signal");
                break;
            }

            request = socket.recv() => {
                let request = match request {
                    Ok(message) => first_frame(message),
                    Err(e) => {
                        tracing::warn!(%endpoint, error = %e, "Error receiving request");
                        continue;
                    }
                };
                let reply = handler.handle(request);
                if let Err(e) = socket.send(ZmqMessage::from(reply)).await {
                    tracing::warn!(%endpoint, error = %e, "Failed to send reply");
                }
            }
        }
    }
    let _ = socket.close().await;
}

fn unsupported(endpoint: &str, operation: &str, role: ChannelRole) -> StagingError {
    StagingError::transport(
        endpoint,
        format!("{operation} is not supported on a {role} channel"),
    )
}

fn closed(endpoint: &str) -> StagingError {
    StagingError::transport(endpoint, "socket already closed")
}

struct ZmqPublisher {
    endpoint: String,
    socket: Option<PubSocket>,
}

#[async_trait]
impl Channel for ZmqPublisher {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        let socket = self.socket.as_mut().ok_or_else(|| closed(&self.endpoint))?;
        socket
            .send(ZmqMessage::from(bytes))
            .await
            .map_err(|e| StagingError::transport(&self.endpoint, e))
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Option<Bytes>> {
        Err(unsupported(&self.endpoint, "read", ChannelRole::Publish))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(socket) = self.socket.take() {
            let errors = socket.close().await;
            if !errors.is_empty() {
                tracing::warn!(endpoint = %self.endpoint, ?errors, "Errors while closing publisher");
            }
        }
        Ok(())
    }
}

struct ZmqSubscriber {
    endpoint: String,
    socket: Option<SubSocket>,
}

#[async_trait]
impl Channel for ZmqSubscriber {
    async fn write(&mut self, _bytes: Bytes) -> Result<()> {
        Err(unsupported(&self.endpoint, "write", ChannelRole::Subscribe))
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let socket = self.socket.as_mut().ok_or_else(|| closed(&self.endpoint))?;
        match tokio::time::timeout(timeout, socket.recv()).await {
            Ok(Ok(message)) => Ok(Some(first_frame(message))),
            Ok(Err(e)) => Err(StagingError::transport(&self.endpoint, e)),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(socket) = self.socket.take() {
            let _ = socket.close().await;
        }
        Ok(())
    }
}

struct ZmqResponder {
    endpoint: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Channel for ZmqResponder {
    async fn write(&mut self, _bytes: Bytes) -> Result<()> {
        Err(unsupported(&self.endpoint, "write", ChannelRole::PointToPoint))
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Option<Bytes>> {
        Err(unsupported(&self.endpoint, "read", ChannelRole::PointToPoint))
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Responder task ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for ZmqResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
