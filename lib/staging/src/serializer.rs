// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Step serialization and the data-pack queue.
//!
//! A step produces two artifacts per rank: a metadata blob (descriptors plus
//! payload offsets) that is aggregated across the group and pushed on the
//! metadata channel, and a [`LocalDataPack`] holding the payload bytes that
//! stays in this rank's [`PackQueue`] until a reader pulls it.

use std::collections::{HashSet, VecDeque};

use bytes::{Bytes, BytesMut};
use dynamo_staging_common::{VariableDescriptor, VariableError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StagingError};
use crate::transport::RequestHandler;

/// Serialized payload of one rank for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDataPack {
    step: u64,
    rank: usize,
    bytes: Bytes,
}

impl LocalDataPack {
    #[allow(missing_docs)]
    pub fn new(step: u64, rank: usize, bytes: Bytes) -> Self {
        Self { step, rank, bytes }
    }

    #[allow(missing_docs)]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[allow(missing_docs)]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[allow(missing_docs)]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Payload of one variable, located through its metadata entry.
    pub fn payload(&self, entry: &VariableEntry) -> Option<Bytes> {
        let start = usize::try_from(entry.offset).ok()?;
        let end = start.checked_add(usize::try_from(entry.length).ok()?)?;
        (end <= self.bytes.len()).then(|| self.bytes.slice(start..end))
    }
}

/// Group-wide metadata of one step, ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedMetadataPack {
    step: u64,
    bytes: Bytes,
}

impl AggregatedMetadataPack {
    #[allow(missing_docs)]
    pub fn new(step: u64, bytes: Bytes) -> Self {
        Self { step, bytes }
    }

    #[allow(missing_docs)]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[allow(missing_docs)]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[allow(missing_docs)]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Packs variables into per-step buffers and merges metadata across ranks.
pub trait StepSerializer: Send {
    /// Retire the previous buffer and start `step` with `capacity` bytes reserved.
    fn reset_for_step(&mut self, step: u64, capacity: usize);

    /// Append one variable's encoded payload to the current step.
    fn append(&mut self, descriptor: VariableDescriptor, payload: &[u8]) -> Result<()>;

    /// This rank's metadata blob for the current step.
    fn local_metadata(&self) -> Result<Bytes>;

    /// Take the payload bytes of the current step.
    fn local_pack(&mut self) -> LocalDataPack;

    /// Merge every rank's metadata blob (ordered by rank) into one pack.
    fn aggregate(&self, step: u64, blobs: Vec<Bytes>) -> Result<AggregatedMetadataPack>;
}

/// Location of one variable inside its rank's [`LocalDataPack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableEntry {
    #[allow(missing_docs)]
    pub descriptor: VariableDescriptor,
    /// Byte offset in the pack.
    pub offset: u64,
    /// Byte length in the pack.
    pub length: u64,
}

/// Metadata contributed by one rank for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    #[allow(missing_docs)]
    pub step: u64,
    #[allow(missing_docs)]
    pub rank: usize,
    /// Entries in put order.
    pub variables: Vec<VariableEntry>,
}

/// Decoded [`AggregatedMetadataPack`] produced by [`MsgpackSerializer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedMetadata {
    #[allow(missing_docs)]
    pub step: u64,
    /// One entry per rank, ordered by rank.
    pub ranks: Vec<StepMetadata>,
}

impl AggregatedMetadata {
    /// Find a variable's entry for `rank`.
    pub fn find(&self, rank: usize, name: &str) -> Option<&VariableEntry> {
        self.ranks
            .get(rank)?
            .variables
            .iter()
            .find(|entry| entry.descriptor.name() == name)
    }
}

/// MessagePack-backed [`StepSerializer`].
#[derive(Debug)]
pub struct MsgpackSerializer {
    rank: usize,
    step: u64,
    buffer: BytesMut,
    entries: Vec<VariableEntry>,
    names: HashSet<String>,
}

impl MsgpackSerializer {
    #[allow(missing_docs)]
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            step: 0,
            buffer: BytesMut::new(),
            entries: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Variables appended to the current step.
    pub fn variable_count(&self) -> usize {
        self.entries.len()
    }

    /// Decode a pack produced by [`StepSerializer::aggregate`].
    pub fn decode_aggregate(pack: &[u8]) -> Result<AggregatedMetadata> {
        Ok(rmp_serde::from_slice(pack)?)
    }
}

impl StepSerializer for MsgpackSerializer {
    fn reset_for_step(&mut self, step: u64, capacity: usize) {
        self.step = step;
        self.buffer = BytesMut::with_capacity(capacity);
        self.entries.clear();
        self.names.clear();
    }

    fn append(&mut self, descriptor: VariableDescriptor, payload: &[u8]) -> Result<()> {
        if !self.names.insert(descriptor.name().to_string()) {
            return Err(VariableError::Duplicate(descriptor.name().to_string()).into());
        }
        let offset = self.buffer.len() as u64;
        self.buffer.extend_from_slice(payload);
        self.entries.push(VariableEntry {
            descriptor,
            offset,
            length: payload.len() as u64,
        });
        Ok(())
    }

    fn local_metadata(&self) -> Result<Bytes> {
        let metadata = StepMetadata {
            step: self.step,
            rank: self.rank,
            variables: self.entries.clone(),
        };
        Ok(Bytes::from(rmp_serde::to_vec_named(&metadata)?))
    }

    fn local_pack(&mut self) -> LocalDataPack {
        LocalDataPack::new(self.step, self.rank, self.buffer.split().freeze())
    }

    fn aggregate(&self, step: u64, blobs: Vec<Bytes>) -> Result<AggregatedMetadataPack> {
        let ranks = blobs
            .iter()
            .enumerate()
            .map(|(rank, blob)| {
                let metadata: StepMetadata = rmp_serde::from_slice(blob)?;
                if metadata.step != step || metadata.rank != rank {
                    return Err(StagingError::Serializer(format!(
                        "expected metadata for rank {rank} step {step}, got rank {} step {}",
                        metadata.rank, metadata.step
                    )));
                }
                Ok(metadata)
            })
            .collect::<Result<Vec<_>>>()?;

        let encoded = rmp_serde::to_vec_named(&AggregatedMetadata { step, ranks })?;
        Ok(AggregatedMetadataPack::new(step, Bytes::from(encoded)))
    }
}

/// Pull request sent on a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Step whose local pack is wanted.
    pub step: u64,
}

impl DataRequest {
    #[allow(missing_docs)]
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    #[allow(missing_docs)]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Bounded queue of local packs awaiting pulls, oldest evicted first.
#[derive(Debug)]
pub struct PackQueue {
    limit: usize,
    packs: Mutex<VecDeque<LocalDataPack>>,
}

impl PackQueue {
    /// `limit` is clamped to at least one pack.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            packs: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a pack; returns the step evicted to make room, if any.
    pub fn push(&self, pack: LocalDataPack) -> Option<u64> {
        let mut packs = self.packs.lock();
        packs.push_back(pack);
        if packs.len() > self.limit {
            packs.pop_front().map(|evicted| evicted.step())
        } else {
            None
        }
    }

    /// Pack for `step`, if still queued.
    pub fn get(&self, step: u64) -> Option<LocalDataPack> {
        self.packs.lock().iter().find(|p| p.step() == step).cloned()
    }

    /// Most recently queued step.
    pub fn latest_step(&self) -> Option<u64> {
        self.packs.lock().back().map(LocalDataPack::step)
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.packs.lock().len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.packs.lock().is_empty()
    }

    #[allow(missing_docs)]
    pub fn clear(&self) {
        self.packs.lock().clear();
    }
}

impl RequestHandler for PackQueue {
    // unknown or evicted steps get an empty reply
    fn handle(&self, request: Bytes) -> Bytes {
        match DataRequest::decode(&request) {
            Ok(DataRequest { step }) => match self.get(step) {
                Some(pack) => pack.bytes().clone(),
                None => {
                    tracing::debug!(step, "Data request for a step that is not queued");
                    Bytes::new()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Malformed data request");
                Bytes::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use dynamo_staging_common::Element;

    fn encoded<T: Element>(values: &[T]) -> Vec<u8> {
        let mut out = BytesMut::new();
        T::encode(values, &mut out);
        out.to_vec()
    }

    fn step_with(serializer: &mut MsgpackSerializer, step: u64) -> Bytes {
        serializer.reset_for_step(step, 64);
        serializer
            .append(
                VariableDescriptor::global_value::<f64>("time").unwrap(),
                &encoded(&[1.5f64]),
            )
            .unwrap();
        serializer
            .append(
                VariableDescriptor::local_array::<i32>("ids", vec![3]).unwrap(),
                &encoded(&[1i32, 2, 3]),
            )
            .unwrap();
        serializer.local_metadata().unwrap()
    }

    #[test]
    fn test_metadata_locates_payload() {
        let mut serializer = MsgpackSerializer::new(0);
        let blob = step_with(&mut serializer, 4);
        let pack = serializer.local_pack();
        assert_eq!(pack.step(), 4);
        assert_eq!(pack.bytes().len(), 8 + 12);

        let aggregated = serializer.aggregate(4, vec![blob]).unwrap();
        let decoded = MsgpackSerializer::decode_aggregate(aggregated.bytes()).unwrap();
        assert_eq!(decoded.step, 4);

        let ids = decoded.find(0, "ids").unwrap();
        assert_eq!(ids.offset, 8);
        let mut expected = BytesMut::new();
        for v in [1i32, 2, 3] {
            expected.put_i32_le(v);
        }
        assert_eq!(pack.payload(ids).unwrap(), expected.freeze());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut serializer = MsgpackSerializer::new(0);
        step_with(&mut serializer, 0);
        let err = serializer
            .append(
                VariableDescriptor::global_value::<f64>("time").unwrap(),
                &encoded(&[2.0f64]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StagingError::Variable(VariableError::Duplicate(name)) if name == "time"
        ));
        assert_eq!(serializer.variable_count(), 2);
    }

    #[test]
    fn test_reset_starts_fresh_buffer() {
        let mut serializer = MsgpackSerializer::new(0);
        step_with(&mut serializer, 0);
        let first = serializer.local_pack();

        step_with(&mut serializer, 1);
        let second = serializer.local_pack();
        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(second.step(), 1);
        assert_eq!(first.step(), 0);
    }

    #[test]
    fn test_aggregate_orders_ranks() {
        let mut rank0 = MsgpackSerializer::new(0);
        let mut rank1 = MsgpackSerializer::new(1);
        let blobs = vec![step_with(&mut rank0, 2), step_with(&mut rank1, 2)];

        let decoded = MsgpackSerializer::decode_aggregate(
            rank0.aggregate(2, blobs.clone()).unwrap().bytes(),
        )
        .unwrap();
        assert_eq!(decoded.ranks.len(), 2);
        assert_eq!(decoded.ranks[1].rank, 1);

        let swapped = vec![blobs[1].clone(), blobs[0].clone()];
        assert!(rank0.aggregate(2, swapped).is_err());
        assert!(rank0.aggregate(3, blobs).is_err());
    }

    #[test]
    fn test_pack_queue_evicts_oldest() {
        let queue = PackQueue::new(2);
        assert_eq!(queue.push(LocalDataPack::new(0, 0, Bytes::from_static(b"a"))), None);
        assert_eq!(queue.push(LocalDataPack::new(1, 0, Bytes::from_static(b"b"))), None);
        assert_eq!(queue.push(LocalDataPack::new(2, 0, Bytes::from_static(b"c"))), Some(0));
        assert_eq!(queue.len(), 2);
        assert!(queue.get(0).is_none());
        assert_eq!(queue.latest_step(), Some(2));
    }

    #[test]
    fn test_pack_queue_answers_requests() {
        let queue = PackQueue::new(4);
        queue.push(LocalDataPack::new(7, 0, Bytes::from_static(b"payload")));

        let hit = queue.handle(DataRequest { step: 7 }.encode().unwrap());
        assert_eq!(hit, Bytes::from_static(b"payload"));

        let miss = queue.handle(DataRequest { step: 8 }.encode().unwrap());
        assert!(miss.is_empty());

        let garbage = queue.handle(Bytes::from_static(b"\xc1"));
        assert!(garbage.is_empty());
    }
}
