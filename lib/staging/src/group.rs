// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-group collectives.
//!
//! The writer needs only rank/size, a barrier, an all-gather of byte blobs
//! and a group-wide agreement. Every member must enter each collective in the
//! same order; a member that never arrives stalls the others.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::error::{Result, StagingError};

/// Collective operations over a fixed group of cooperating writers.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// This member's rank, `0..size`.
    fn rank(&self) -> usize;

    /// Number of members.
    fn size(&self) -> usize;

    /// Rank 0 owns group-wide resources (metadata channel, discovery artifact).
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Wait until every member arrives.
    async fn barrier(&self) -> Result<()>;

    /// Contribute `local`; every member receives all contributions ordered by rank.
    async fn all_gather(&self, local: Bytes) -> Result<Vec<Bytes>>;

    /// Logical AND of `ok` across the group.
    async fn all_agree(&self, ok: bool) -> Result<bool> {
        let votes = self.all_gather(Bytes::copy_from_slice(&[ok as u8])).await?;
        Ok(votes.iter().all(|vote| vote.first() == Some(&1)))
    }
}

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloGroup;

#[async_trait]
impl ProcessGroup for SoloGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }

    async fn all_gather(&self, local: Bytes) -> Result<Vec<Bytes>> {
        Ok(vec![local])
    }

    async fn all_agree(&self, ok: bool) -> Result<bool> {
        Ok(ok)
    }
}

struct Shared {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Bytes>>>,
}

/// One member of an in-process group.
///
/// Members are created together with [`LocalGroup::new`] and driven from
/// separate tasks.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl LocalGroup {
    /// Create all `size` members, indexed by rank.
    pub fn new(size: usize) -> Result<Vec<LocalGroup>> {
        if size == 0 {
            return Err(StagingError::Group("group size must be at least 1".into()));
        }
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
        });
        Ok((0..size)
            .map(|rank| LocalGroup {
                rank,
                shared: shared.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    async fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn all_gather(&self, local: Bytes) -> Result<Vec<Bytes>> {
        self.shared.slots.lock()[self.rank] = Some(local);

        // every slot is filled once all members pass
        self.shared.barrier.wait().await;
        let gathered = {
            let slots = self.shared.slots.lock();
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        StagingError::Group(format!("rank {rank} did not contribute"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        // nobody may overwrite its slot before everyone has read
        self.shared.barrier.wait().await;
        gathered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_solo_group() {
        let group = SoloGroup;
        assert!(group.is_root());
        assert_eq!(group.size(), 1);
        group.barrier().await.unwrap();
        let gathered = group.all_gather(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(gathered, vec![Bytes::from_static(b"x")]);
        assert!(!group.all_agree(false).await.unwrap());
    }

    #[test]
    fn test_empty_group_is_rejected() {
        assert!(LocalGroup::new(0).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_all_gather_orders_by_rank() {
        let members = LocalGroup::new(4).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                tokio::spawn(async move {
                    let mut rounds = Vec::new();
                    for round in 0..3u8 {
                        let local = Bytes::from(vec![member.rank() as u8, round]);
                        rounds.push(member.all_gather(local).await.unwrap());
                    }
                    rounds
                })
            })
            .collect();

        for handle in handles {
            let rounds = handle.await.unwrap();
            for (round, gathered) in rounds.iter().enumerate() {
                let expected: Vec<Bytes> = (0..4u8)
                    .map(|rank| Bytes::from(vec![rank, round as u8]))
                    .collect();
                assert_eq!(gathered, &expected);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_local_all_agree_fails_together() {
        let members = LocalGroup::new(3).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                tokio::spawn(async move {
                    let first = member.all_agree(true).await.unwrap();
                    let second = member.all_agree(member.rank() != 1).await.unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), (true, false));
        }
    }
}
