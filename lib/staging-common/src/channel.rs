// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channel vocabulary shared by the transport manager and its libraries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Error returned when a channel kind or role string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid channel {what}: '{value}'. Valid options are: {valid}")]
pub struct ParseChannelError {
    what: &'static str,
    value: String,
    valid: &'static str,
}

/// What a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Aggregated variable descriptors, broadcast once per step.
    Metadata,
    /// Payload bytes, pulled on demand from each rank.
    Data,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => write!(f, "metadata"),
            Self::Data => write!(f, "data"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "metadata" => Ok(Self::Metadata),
            "data" => Ok(Self::Data),
            _ => Err(ParseChannelError {
                what: "kind",
                value: s.to_string(),
                valid: "'metadata', 'data'",
            }),
        }
    }
}

/// How a channel's socket participates in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Bind and broadcast to every connected subscriber.
    Publish,
    /// Connect to a publisher and receive its broadcasts.
    Subscribe,
    /// Bind and answer requests one at a time.
    PointToPoint,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => write!(f, "publish"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::PointToPoint => write!(f, "p2p"),
        }
    }
}

impl FromStr for ChannelRole {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "publish" | "pub" => Ok(Self::Publish),
            "subscribe" | "sub" => Ok(Self::Subscribe),
            "p2p" | "point-to-point" | "pointtopoint" => Ok(Self::PointToPoint),
            _ => Err(ParseChannelError {
                what: "role",
                value: s.to_string(),
                valid: "'publish', 'subscribe', 'p2p'",
            }),
        }
    }
}

/// Name of a transport library (e.g. `"zmq"`, `"inproc"`).
///
/// Keys are normalized to lowercase so `"ZMQ"` and `"zmq"` select the same
/// library.
///
/// ```
/// use dynamo_staging_common::LibraryKey;
///
/// let key = LibraryKey::from("ZMQ");
/// assert_eq!(key.as_str(), "zmq");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LibraryKey(Arc<str>);

impl LibraryKey {
    /// Create a key, normalizing to lowercase.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref().to_lowercase()))
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for LibraryKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for LibraryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LibraryKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for LibraryKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::borrow::Borrow<str> for LibraryKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LibraryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
