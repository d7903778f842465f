// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint records for the staging handshake.
//!
//! Ports are derived from `(base_port, rank, group_size)` so that any peer
//! knowing the group layout computes the same endpoints without a round-trip:
//! - metadata port = `base_port + rank`
//! - data port = `base_port + group_size + rank`
//!
//! Only the IP address has to be discovered, which is what the handshake
//! artifact carries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use xxhash_rust::xxh3::xxh3_64;

/// Base port shared by writer and reader implementations.
pub const DEFAULT_BASE_PORT: u16 = 12306;

/// Errors that can occur when deriving or recording endpoints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// The derived port does not fit in a `u16`.
    #[error("Port overflow: base {base_port} + offset {offset} exceeds 65535")]
    PortOverflow {
        /// Base port in use.
        base_port: u16,
        /// Offset added to the base.
        offset: u64,
    },

    /// `rank` is not smaller than `group_size`.
    #[error("Rank {rank} is outside a group of size {group_size}")]
    RankOutOfRange {
        /// Offending rank.
        rank: usize,
        /// Group size.
        group_size: usize,
    },

    /// Endpoint records are write-once.
    #[error("Endpoint for rank {0} already recorded")]
    AlreadyRecorded(usize),

    /// A peer's record does not match the ports this rank derives for it.
    #[error("Endpoint reported at position {position} does not match the group layout: {record}")]
    LayoutMismatch {
        /// Position of the record in the gathered list.
        position: usize,
        /// The record as reported.
        record: String,
    },
}

/// Derive `(metadata_port, data_port)` for `rank` in a group of `group_size`.
///
/// Pure: two independent computations with the same inputs agree.
pub fn derive_ports(
    base_port: u16,
    rank: usize,
    group_size: usize,
) -> Result<(u16, u16), EndpointError> {
    if rank >= group_size {
        return Err(EndpointError::RankOutOfRange { rank, group_size });
    }
    let offset_port = |offset: u64| {
        u16::try_from(base_port as u64 + offset)
            .map_err(|_| EndpointError::PortOverflow { base_port, offset })
    };
    let metadata = offset_port(rank as u64)?;
    let data = offset_port(group_size as u64 + rank as u64)?;
    Ok((metadata, data))
}

/// Format a host and port into a valid socket address string.
///
/// IPv6 hosts are wrapped in brackets.
///
/// ```
/// use dynamo_staging_common::format_socket_addr;
///
/// assert_eq!(format_socket_addr("192.168.1.1", 8080), "192.168.1.1:8080");
/// assert_eq!(format_socket_addr("::1", 8080), "[::1]:8080");
/// ```
pub fn format_socket_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Network identity of one rank for the lifetime of a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointRecord {
    rank: usize,
    ip: IpAddr,
    metadata_port: u16,
    data_port: u16,
}

impl EndpointRecord {
    /// Derive the record for `rank` from the chosen address and group layout.
    pub fn derive(
        ip: IpAddr,
        base_port: u16,
        rank: usize,
        group_size: usize,
    ) -> Result<Self, EndpointError> {
        let (metadata_port, data_port) = derive_ports(base_port, rank, group_size)?;
        Ok(Self {
            rank,
            ip,
            metadata_port,
            data_port,
        })
    }

    #[allow(missing_docs)]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[allow(missing_docs)]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    #[allow(missing_docs)]
    pub fn metadata_port(&self) -> u16 {
        self.metadata_port
    }

    #[allow(missing_docs)]
    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// `host:port` of the metadata channel.
    pub fn metadata_addr(&self) -> String {
        format_socket_addr(&self.ip.to_string(), self.metadata_port)
    }

    /// `host:port` of the data channel.
    pub fn data_addr(&self) -> String {
        format_socket_addr(&self.ip.to_string(), self.data_port)
    }

    /// Checksum used to compare records cheaply across ranks.
    pub fn checksum(&self) -> u64 {
        let encoded = format!(
            "{}|{}|{}|{}",
            self.rank, self.ip, self.metadata_port, self.data_port
        );
        xxh3_64(encoded.as_bytes())
    }
}

impl fmt::Display for EndpointRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank {} @ {} (metadata {}, data {})",
            self.rank, self.ip, self.metadata_port, self.data_port
        )
    }
}

/// rank -> [`EndpointRecord`], each entry written once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTable {
    records: BTreeMap<usize, EndpointRecord>,
}

impl EndpointTable {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from one record per rank, gathered in rank order.
    ///
    /// Every record is checked against the endpoint derived locally from its
    /// address, its position and `base_port`, so ranks configured with
    /// different base ports or group sizes are caught here.
    pub fn from_gathered(
        records: Vec<EndpointRecord>,
        base_port: u16,
    ) -> Result<Self, EndpointError> {
        let group_size = records.len();
        let mut table = Self::new();
        for (position, record) in records.into_iter().enumerate() {
            let expected = EndpointRecord::derive(record.ip, base_port, position, group_size)?;
            if expected.checksum() != record.checksum() {
                return Err(EndpointError::LayoutMismatch {
                    position,
                    record: record.to_string(),
                });
            }
            table.insert(record)?;
        }
        Ok(table)
    }

    /// Record an endpoint. Fails if the rank already has one.
    pub fn insert(&mut self, record: EndpointRecord) -> Result<(), EndpointError> {
        if self.records.contains_key(&record.rank) {
            return Err(EndpointError::AlreadyRecorded(record.rank));
        }
        self.records.insert(record.rank, record);
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn get(&self, rank: usize) -> Option<&EndpointRecord> {
        self.records.get(&rank)
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in rank order.
    pub fn iter(&self) -> impl Iterator<Item = &EndpointRecord> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_ports_layout() {
        assert_eq!(derive_ports(12306, 0, 1).unwrap(), (12306, 12307));
        assert_eq!(derive_ports(12306, 2, 4).unwrap(), (12308, 12312));
    }

    #[test]
    fn test_derive_ports_is_deterministic() {
        for rank in 0..8 {
            assert_eq!(derive_ports(20000, rank, 8), derive_ports(20000, rank, 8));
        }
    }

    #[test]
    fn test_derive_ports_never_collide_within_group() {
        let size = 16;
        let mut seen = std::collections::HashSet::new();
        for rank in 0..size {
            let (metadata, data) = derive_ports(DEFAULT_BASE_PORT, rank, size).unwrap();
            assert!(seen.insert(metadata));
            assert!(seen.insert(data));
        }
    }

    #[test]
    fn test_derive_ports_overflow() {
        assert_eq!(
            derive_ports(65535, 0, 2).unwrap_err(),
            EndpointError::PortOverflow {
                base_port: 65535,
                offset: 2
            }
        );
    }

    #[test]
    fn test_derive_ports_rank_out_of_range() {
        assert!(matches!(
            derive_ports(12306, 3, 3),
            Err(EndpointError::RankOutOfRange { .. })
        ));
    }

    #[test]
    fn test_record_addresses() {
        let record = EndpointRecord::derive("10.0.0.5".parse().unwrap(), 12306, 1, 2).unwrap();
        assert_eq!(record.metadata_addr(), "10.0.0.5:12307");
        assert_eq!(record.data_addr(), "10.0.0.5:12309");

        let v6 = EndpointRecord::derive("::1".parse().unwrap(), 12306, 0, 1).unwrap();
        assert_eq!(v6.metadata_addr(), "[::1]:12306");
    }

    #[test]
    fn test_record_checksum() {
        let a = EndpointRecord::derive("10.0.0.5".parse().unwrap(), 12306, 0, 2).unwrap();
        let b = EndpointRecord::derive("10.0.0.5".parse().unwrap(), 12306, 0, 2).unwrap();
        let c = EndpointRecord::derive("10.0.0.6".parse().unwrap(), 12306, 0, 2).unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_table_is_write_once() {
        let mut table = EndpointTable::new();
        let record = EndpointRecord::derive("10.0.0.5".parse().unwrap(), 12306, 0, 1).unwrap();
        table.insert(record.clone()).unwrap();
        assert_eq!(
            table.insert(record).unwrap_err(),
            EndpointError::AlreadyRecorded(0)
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).unwrap().metadata_port(), 12306);
    }

    #[test]
    fn test_table_from_gathered() {
        let records: Vec<_> = ["10.0.0.5", "10.0.0.6", "10.0.0.7"]
            .iter()
            .enumerate()
            .map(|(rank, ip)| EndpointRecord::derive(ip.parse().unwrap(), 12306, rank, 3).unwrap())
            .collect();
        let table = EndpointTable::from_gathered(records, 12306).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2).unwrap().data_addr(), "10.0.0.7:12311");
        let ranks: Vec<_> = table.iter().map(EndpointRecord::rank).collect();
        assert_eq!(ranks, [0, 1, 2]);
    }

    #[test]
    fn test_table_from_gathered_rejects_layout_mismatch() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        // rank 1 opened with another base port
        let records = vec![
            EndpointRecord::derive(ip, 12306, 0, 2).unwrap(),
            EndpointRecord::derive(ip, 13000, 1, 2).unwrap(),
        ];
        assert!(matches!(
            EndpointTable::from_gathered(records, 12306),
            Err(EndpointError::LayoutMismatch { position: 1, .. })
        ));

        // out of rank order
        let records = vec![
            EndpointRecord::derive(ip, 12306, 1, 2).unwrap(),
            EndpointRecord::derive(ip, 12306, 0, 2).unwrap(),
        ];
        assert!(matches!(
            EndpointTable::from_gathered(records, 12306),
            Err(EndpointError::LayoutMismatch { position: 0, .. })
        ));
    }

    #[test]
    fn test_record_serde() {
        let record = EndpointRecord::derive("10.0.0.5".parse().unwrap(), 12306, 0, 1).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let decoded: EndpointRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
