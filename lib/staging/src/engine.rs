// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The staging writer.
//!
//! ```text
//! open ─► begin_step ─► put* ─► end_step ─┐
//!            ▲                            │
//!            └────────────────────────────┘
//!                                   close ─► closed
//! ```
//!
//! `open` and `end_step` are collective: every member of the process group
//! must call them in the same order. `open` is split into a side-effect-free
//! phase (parameters, interface selection) and a resource phase (artifact,
//! channels); after each phase the group agrees on the outcome so that a
//! failure on one rank fails every rank instead of leaving peers blocked.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dynamo_staging_common::{
    ChannelKind, ChannelRole, Element, EndpointError, EndpointRecord, EndpointTable,
    VariableDescriptor,
};
use futures::future::BoxFuture;

use crate::error::{Result, StagingError};
use crate::group::{ProcessGroup, SoloGroup};
use crate::handshake::{DiscoveryArtifact, InterfaceResolver, SystemInterfaces, resolve_endpoint};
use crate::logging::engine_event;
use crate::params::{EngineSettings, Params};
use crate::serializer::{
    AggregatedMetadataPack, DataRequest, MsgpackSerializer, PackQueue, StepSerializer,
};
use crate::step::{PutMode, StepController, StepMode, StepState, StepStatus};
use crate::transport::{OpenMode, TransportLibrary, TransportManager};

/// Builder for [`StagingWriter`].
pub struct StagingWriterBuilder {
    name: String,
    group: Arc<dyn ProcessGroup>,
    resolver: Arc<dyn InterfaceResolver>,
    libraries: Vec<Arc<dyn TransportLibrary>>,
    serializer: Option<Box<dyn StepSerializer>>,
}

impl StagingWriterBuilder {
    /// Process group; defaults to [`SoloGroup`].
    pub fn group(mut self, group: Arc<dyn ProcessGroup>) -> Self {
        self.group = group;
        self
    }

    /// Interface source for the handshake; defaults to [`SystemInterfaces`].
    pub fn resolver(mut self, resolver: Arc<dyn InterfaceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Register an extra transport library, replacing one with the same key.
    pub fn library(mut self, library: Arc<dyn TransportLibrary>) -> Self {
        self.libraries.push(library);
        self
    }

    /// Step serializer; defaults to [`MsgpackSerializer`].
    pub fn serializer(mut self, serializer: Box<dyn StepSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Build a closed writer.
    pub fn build(self) -> Result<StagingWriter> {
        if self.name.is_empty() {
            return Err(StagingError::invalid_configuration(
                "name",
                "stream name must not be empty",
            ));
        }
        let (rank, size) = (self.group.rank(), self.group.size());
        if size == 0 || rank >= size {
            return Err(StagingError::Group(format!(
                "rank {rank} is not valid in a group of size {size}"
            )));
        }

        let mut transports = TransportManager::new();
        for library in self.libraries {
            transports.register_library(library);
        }

        let settings = EngineSettings::default();
        Ok(StagingWriter {
            name: self.name,
            group: self.group,
            resolver: self.resolver,
            transports,
            serializer: self
                .serializer
                .unwrap_or_else(|| Box::new(MsgpackSerializer::new(rank))),
            steps: StepController::new(),
            packs: Arc::new(PackQueue::new(settings.queue_limit)),
            settings,
            endpoint: None,
            endpoints: EndpointTable::new(),
            artifact: None,
            metadata_channel: None,
            data_channel: None,
            deferred: Vec::new(),
            scratch: BytesMut::new(),
            last_metadata: None,
        })
    }
}

/// Streaming writer for one named stream.
///
/// # Example
///
/// ```no_run
/// use dynamo_staging::{Params, StagingWriter, StepMode, VariableDescriptor};
/// use dynamo_staging::transport::OpenMode;
///
/// # async fn run() -> dynamo_staging::Result<()> {
/// let mut writer = StagingWriter::builder("simulation").build()?;
/// writer.open(&Params::from([("verbose", "3")]), OpenMode::Write).await?;
///
/// let time = VariableDescriptor::global_value::<f64>("time")?;
/// for step in 0..3 {
///     writer.begin_step(StepMode::Append, None)?;
///     writer.put_sync(&time, &[step as f64])?;
///     writer.end_step().await?;
/// }
/// writer.close(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct StagingWriter {
    name: String,
    group: Arc<dyn ProcessGroup>,
    resolver: Arc<dyn InterfaceResolver>,
    transports: TransportManager,
    serializer: Box<dyn StepSerializer>,
    steps: StepController,
    packs: Arc<PackQueue>,
    settings: EngineSettings,
    endpoint: Option<EndpointRecord>,
    endpoints: EndpointTable,
    artifact: Option<DiscoveryArtifact>,
    metadata_channel: Option<usize>,
    data_channel: Option<usize>,
    deferred: Vec<String>,
    scratch: BytesMut,
    last_metadata: Option<AggregatedMetadataPack>,
}

impl std::fmt::Debug for StagingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingWriter")
            .field("name", &self.name)
            .field("rank", &self.group.rank())
            .field("state", &self.steps.state())
            .field("current_step", &self.steps.current_step())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl StagingWriter {
    /// Start building a writer for stream `name`.
    pub fn builder(name: impl Into<String>) -> StagingWriterBuilder {
        StagingWriterBuilder {
            name: name.into(),
            group: Arc::new(SoloGroup),
            resolver: Arc::new(SystemInterfaces),
            libraries: Vec::new(),
            serializer: None,
        }
    }

    /// Resolve parameters, run the handshake and open the channels.
    ///
    /// Collective. On failure nothing opened by this call stays reachable and
    /// the writer remains closed.
    pub async fn open(&mut self, params: &Params, mode: OpenMode) -> Result<()> {
        if self.steps.state() != StepState::Closed {
            return Err(StagingError::InvalidState {
                operation: "open",
                state: self.steps.state(),
            });
        }
        let (rank, size) = (self.group.rank(), self.group.size());

        // phase 1: validation and interface selection, no side effects
        let prepared = self.prepare(params, mode);
        let agreed = self.group.all_agree(prepared.is_ok()).await?;
        let (settings, endpoint) = match prepared {
            Err(e) => {
                tracing::error!(rank, stream = %self.name, error = %e, "Failed to open writer");
                return Err(e);
            }
            Ok(_) if !agreed => return Err(StagingError::PeerAborted { operation: "open" }),
            Ok(prepared) => prepared,
        };

        // phase 2: artifact, channels and the group's endpoint table
        self.settings = settings;
        self.packs = Arc::new(PackQueue::new(self.settings.queue_limit));
        let opened = self.open_resources(&endpoint, mode).await;
        let exchanged = self.exchange_endpoints(&endpoint).await;
        let ready = opened.and(exchanged);
        let agreed = self.group.all_agree(ready.is_ok()).await;
        let endpoints = match (ready, agreed) {
            (Ok(endpoints), Ok(true)) => endpoints,
            (ready, agreed) => {
                self.release(true).await;
                return Err(match (ready, agreed) {
                    (Err(e), _) | (Ok(_), Err(e)) => e,
                    (Ok(_), Ok(_)) => StagingError::PeerAborted { operation: "open" },
                });
            }
        };

        self.steps.open()?;
        self.endpoints = endpoints;
        engine_event!(
            self.settings.verbosity().reports_lifecycle(),
            rank,
            size,
            stream = %self.name,
            %endpoint,
            library = %self.settings.library,
            "Opened staging writer"
        );
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn prepare(&self, params: &Params, mode: OpenMode) -> Result<(EngineSettings, EndpointRecord)> {
        if mode == OpenMode::Read {
            return Err(StagingError::invalid_configuration(
                "mode",
                "a writer cannot be opened in read mode",
            ));
        }
        let settings = EngineSettings::resolve(params)?;
        let endpoint = resolve_endpoint(
            self.resolver.as_ref(),
            &settings.interface,
            settings.base_port,
            self.group.rank(),
            self.group.size(),
        )?;
        Ok((settings, endpoint))
    }

    async fn open_resources(&mut self, endpoint: &EndpointRecord, mode: OpenMode) -> Result<()> {
        let rank = self.group.rank();
        self.transports
            .set_request_handler(self.packs.clone());
        self.transports
            .set_request_timeout(self.settings.request_timeout);

        if self.group.is_root() {
            let artifact = DiscoveryArtifact::new(&self.settings.handshake_file);
            artifact.publish(endpoint.ip()).await?;
            self.artifact = Some(artifact);

            let params = self.channel_params(endpoint, endpoint.metadata_port(), ChannelKind::Metadata);
            let opened = self
                .transports
                .open_transports(&[params], mode, ChannelRole::Publish, self.settings.profile)
                .await?;
            self.metadata_channel = opened.first().copied();
        }

        if self.settings.data_channel {
            let params = self.channel_params(endpoint, endpoint.data_port(), ChannelKind::Data);
            let opened = self
                .transports
                .open_transports(&[params], mode, ChannelRole::PointToPoint, self.settings.profile)
                .await?;
            self.data_channel = opened.first().copied();
        }

        tracing::debug!(
            rank,
            metadata = ?self.metadata_channel,
            data = ?self.data_channel,
            "Opened writer channels"
        );
        Ok(())
    }

    // Collective. Runs even when this rank's resource phase failed so peers
    // are not left waiting in the gather.
    async fn exchange_endpoints(&self, endpoint: &EndpointRecord) -> Result<EndpointTable> {
        let encoded = rmp_serde::to_vec(endpoint);
        let contribution = encoded
            .as_deref()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        let gathered = self.group.all_gather(contribution).await?;
        encoded?;

        let records = gathered
            .iter()
            .enumerate()
            .map(|(rank, blob)| {
                rmp_serde::from_slice::<EndpointRecord>(blob).map_err(|e| {
                    StagingError::Serializer(format!("endpoint record of rank {rank}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let table = EndpointTable::from_gathered(records, self.settings.base_port)?;
        if table.get(endpoint.rank()) != Some(endpoint) {
            return Err(EndpointError::LayoutMismatch {
                position: endpoint.rank(),
                record: endpoint.to_string(),
            }
            .into());
        }
        tracing::debug!(rank = endpoint.rank(), ranks = table.len(), "Exchanged endpoints");
        Ok(table)
    }

    fn channel_params(&self, endpoint: &EndpointRecord, port: u16, kind: ChannelKind) -> Params {
        Params::from([
            ("IPAddress", endpoint.ip().to_string()),
            ("Port", port.to_string()),
            ("Library", self.settings.library.to_string()),
            ("Kind", kind.to_string()),
            ("Name", format!("{}.{}.{}", self.name, kind, endpoint.rank())),
        ])
    }

    // Closes every channel; on a failed open also withdraws the artifact.
    async fn release(&mut self, unwinding: bool) {
        if let Err(e) = self.transports.close(None).await {
            tracing::warn!(rank = self.group.rank(), error = %e, "Failed to close channels");
        }
        self.metadata_channel = None;
        self.data_channel = None;

        if let Some(artifact) = self.artifact.take() {
            if unwinding {
                if let Err(e) = artifact.remove().await {
                    tracing::warn!(error = %e, "Failed to remove discovery artifact");
                }
            }
        }
        self.packs.clear();
        self.deferred.clear();
        self.endpoint = None;
        self.endpoints = EndpointTable::new();
        self.last_metadata = None;
    }

    /// Start the next step. The writer never waits, so `_timeout` is unused
    /// and the status is always [`StepStatus::Ok`].
    pub fn begin_step(&mut self, mode: StepMode, _timeout: Option<Duration>) -> Result<StepStatus> {
        let step = self.steps.begin()?;
        self.serializer
            .reset_for_step(step, self.settings.buffer_size);
        self.deferred.clear();
        engine_event!(
            self.settings.verbosity().reports_steps(),
            rank = self.group.rank(),
            step,
            ?mode,
            "Begin step"
        );
        Ok(StepStatus::Ok)
    }

    /// Step number of the last `begin_step`, `None` before the first.
    pub fn current_step(&self) -> Option<u64> {
        self.steps.current_step()
    }

    /// Append `data` for `descriptor` to the current step.
    ///
    /// Both modes append immediately; deferred puts are additionally
    /// remembered until [`perform_puts`](Self::perform_puts).
    pub fn put<T: Element>(
        &mut self,
        descriptor: &VariableDescriptor,
        data: &[T],
        mode: PutMode,
    ) -> Result<()> {
        let step = self.steps.check_put()?;
        descriptor.check_data(T::TYPE, data.len())?;

        self.scratch.clear();
        T::encode(data, &mut self.scratch);
        self.serializer
            .append(descriptor.clone(), &self.scratch)?;
        if mode == PutMode::Deferred {
            self.deferred.push(descriptor.name().to_string());
        }

        engine_event!(
            self.settings.verbosity().reports_steps(),
            rank = self.group.rank(),
            step,
            variable = descriptor.name(),
            element_type = %descriptor.element_type(),
            elements = data.len(),
            ?mode,
            "Put variable"
        );
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn put_sync<T: Element>(&mut self, descriptor: &VariableDescriptor, data: &[T]) -> Result<()> {
        self.put(descriptor, data, PutMode::Sync)
    }

    #[allow(missing_docs)]
    pub fn put_deferred<T: Element>(
        &mut self,
        descriptor: &VariableDescriptor,
        data: &[T],
    ) -> Result<()> {
        self.put(descriptor, data, PutMode::Deferred)
    }

    /// Put a single value (value shapes).
    pub fn put_value<T: Element>(&mut self, descriptor: &VariableDescriptor, value: &T) -> Result<()> {
        self.put(descriptor, std::slice::from_ref(value), PutMode::Sync)
    }

    /// Flush deferred puts. They were appended at put time, so this only
    /// clears the pending list.
    pub fn perform_puts(&mut self) {
        if !self.deferred.is_empty() {
            tracing::trace!(count = self.deferred.len(), "Deferred puts already appended");
            self.deferred.clear();
        }
    }

    /// Names of deferred puts not yet performed.
    pub fn pending_deferred(&self) -> &[String] {
        &self.deferred
    }

    /// Finish the current step.
    ///
    /// Collective: gathers every rank's metadata, queues this rank's data
    /// pack for pulls and, on rank 0, publishes the aggregated metadata. The
    /// step counts as drained once the pack is queued, even if publishing
    /// then fails. If any rank cannot produce its metadata, that rank returns
    /// the serializer error, the others return [`StagingError::PeerAborted`]
    /// and nothing is published.
    pub async fn end_step(&mut self) -> Result<()> {
        let step = self.steps.check_end()?;
        let rank = self.group.rank();
        self.perform_puts();

        let local_metadata = self.serializer.local_metadata();
        let agreed = self.group.all_agree(local_metadata.is_ok()).await?;

        let pack = self.serializer.local_pack();
        let pack_bytes = pack.bytes().len();
        if let Some(evicted) = self.packs.push(pack) {
            tracing::debug!(rank, step, evicted, "Evicted oldest data pack");
        }
        self.steps.drain()?;

        let local_metadata = local_metadata.inspect_err(|e| {
            tracing::error!(rank, step, error = %e, "Failed to serialize step metadata");
        })?;
        if !agreed {
            return Err(StagingError::PeerAborted {
                operation: "end_step",
            });
        }
        let gathered = self.group.all_gather(local_metadata).await?;

        if self.group.is_root() {
            let aggregated = self.serializer.aggregate(step, gathered)?;
            self.last_metadata = Some(aggregated.clone());
            if let Some(index) = self.metadata_channel {
                self.transports.write(index, aggregated.into_bytes()).await?;
            }
        }

        engine_event!(
            self.settings.verbosity().reports_steps(),
            rank,
            step,
            pack_bytes,
            "End step"
        );
        Ok(())
    }

    /// Flush one channel, or every channel with `None`.
    pub async fn flush(&mut self, index: Option<usize>) -> Result<()> {
        if self.steps.state() == StepState::Closed {
            return Err(StagingError::InvalidState {
                operation: "flush",
                state: StepState::Closed,
            });
        }
        engine_event!(
            self.settings.verbosity().reports_steps(),
            rank = self.group.rank(),
            index = ?index,
            "Flush"
        );
        self.transports.flush(index).await
    }

    /// Close one channel (`Some`) or the whole writer (`None`).
    ///
    /// Repeated closes are no-ops. Closing the writer keeps the discovery
    /// artifact in place for readers that have not picked it up yet.
    pub async fn close(&mut self, index: Option<usize>) -> Result<()> {
        if self.steps.state() == StepState::Closed {
            return Ok(());
        }

        if let Some(index) = index {
            if self.metadata_channel == Some(index) {
                self.metadata_channel = None;
            }
            if self.data_channel == Some(index) {
                self.data_channel = None;
            }
            return self.transports.close(Some(index)).await;
        }

        let step = self.steps.current_step();
        let left = self.steps.close();
        if left == StepState::StepActive {
            tracing::warn!(
                rank = self.group.rank(),
                step = ?step,
                "Closing with an active step; its data is discarded"
            );
        }
        let result = self.transports.close(None).await;
        self.release(false).await;
        engine_event!(
            self.settings.verbosity().reports_lifecycle(),
            rank = self.group.rank(),
            stream = %self.name,
            "Closed staging writer"
        );
        result
    }

    /// Pull `step`'s data pack from the data channel of `endpoint`.
    ///
    /// Returns an empty buffer when the step is not (or no longer) queued
    /// there. The future does not borrow the writer.
    pub fn pull(&self, endpoint: &EndpointRecord, step: u64) -> BoxFuture<'static, Result<Bytes>> {
        let request = DataRequest { step }.encode();
        match request {
            Ok(request) => self.transports.request(
                &self.settings.library,
                SocketAddr::new(endpoint.ip(), endpoint.data_port()),
                request,
            ),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    /// Pull `step`'s data pack from the data channel of `rank`, looked up in
    /// the endpoint table exchanged at open.
    pub fn pull_rank(&self, rank: usize, step: u64) -> BoxFuture<'static, Result<Bytes>> {
        match self.endpoints.get(rank) {
            Some(endpoint) => self.pull(endpoint, step),
            None => {
                let err = if self.steps.state() == StepState::Closed {
                    StagingError::InvalidState {
                        operation: "pull",
                        state: StepState::Closed,
                    }
                } else {
                    StagingError::from(EndpointError::RankOutOfRange {
                        rank,
                        group_size: self.endpoints.len(),
                    })
                };
                Box::pin(async move { Err(err) })
            }
        }
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> StepState {
        self.steps.state()
    }

    /// This rank's endpoint while open.
    pub fn endpoint(&self) -> Option<&EndpointRecord> {
        self.endpoint.as_ref()
    }

    /// Every rank's endpoint while open, keyed by rank.
    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Settings in effect (defaults before the first open).
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Open channels carrying `kind`.
    pub fn channel_count(&self, kind: ChannelKind) -> usize {
        self.transports.channel_count(kind)
    }

    #[allow(missing_docs)]
    pub fn transports(&self) -> &TransportManager {
        &self.transports
    }

    /// Local data packs awaiting pulls.
    pub fn pack_queue(&self) -> &Arc<PackQueue> {
        &self.packs
    }

    /// Discovery artifact published by this rank (rank 0 only).
    pub fn artifact(&self) -> Option<&DiscoveryArtifact> {
        self.artifact.as_ref()
    }

    /// Aggregated metadata of the last drained step (rank 0 only).
    pub fn last_metadata(&self) -> Option<&AggregatedMetadataPack> {
        self.last_metadata.as_ref()
    }
}
