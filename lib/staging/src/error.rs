// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Staging error taxonomy.
//!
//! Fatal errors surface as [`StagingError`]. Advisory parse failures on tuning
//! knobs are never returned; they are logged and the knob is treated as absent.

use std::path::PathBuf;

use dynamo_staging_common::{EndpointError, LibraryKey, VariableError};

use crate::step::StepState;

/// Convenience alias used throughout the crate.
pub type Result<T, E = StagingError> = std::result::Result<T, E>;

/// Errors returned by the staging writer and its components.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// A recognized parameter carries an out-of-range or unparsable value.
    #[error("Invalid configuration for '{key}': {reason}")]
    InvalidConfiguration {
        /// The offending parameter key.
        key: String,
        /// Legal range or parse failure.
        reason: String,
    },

    /// The handshake found no usable network address.
    #[error("No network interface available")]
    NoNetworkInterface,

    /// An explicitly selected interface or address is not present on this host.
    #[error("Network interface not found: {selector}")]
    InterfaceNotFound {
        /// The selector that matched nothing.
        selector: String,
    },

    /// An underlying channel failed to open, send or receive.
    #[error("Transport failure on {channel}: {reason}")]
    TransportFailure {
        /// Channel description, e.g. `metadata publish tcp://10.0.0.1:12306`.
        channel: String,
        /// Error reported by the transport library.
        reason: String,
    },

    /// No transport library is registered under this key.
    #[error("Unknown transport library: {0}")]
    UnknownLibrary(LibraryKey),

    /// There is no open channel at this index.
    #[error("No open channel at index {index}")]
    ChannelNotFound {
        /// Requested channel index.
        index: usize,
    },

    /// The requested operation is not legal in the current step state.
    #[error("{operation} is not allowed while the engine is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the engine was in.
        state: StepState,
    },

    /// A put was rejected by descriptor validation.
    #[error(transparent)]
    Variable(#[from] VariableError),

    /// Port derivation or endpoint recording failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The serializer failed to encode or decode a pack.
    #[error("Serializer error: {0}")]
    Serializer(String),

    /// A collective operation failed.
    #[error("Process group error: {0}")]
    Group(String),

    /// Another rank failed during a collective phase, so this rank fails too.
    #[error("{operation} aborted: a peer in the process group failed")]
    PeerAborted {
        /// Phase that was aborted.
        operation: &'static str,
    },

    /// The discovery artifact could not be written, read or removed.
    #[error("Discovery artifact {path}: {source}")]
    Discovery {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl StagingError {
    pub(crate) fn invalid_configuration(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(channel: impl ToString, reason: impl ToString) -> Self {
        Self::TransportFailure {
            channel: channel.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for errors that abort `open` (configuration and handshake).
    pub fn is_open_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration { .. }
                | Self::NoNetworkInterface
                | Self::InterfaceNotFound { .. }
                | Self::PeerAborted { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for StagingError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serializer(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StagingError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serializer(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_configuration_names_key() {
        let err = StagingError::invalid_configuration("verbose", "must be in [0, 5], got 7");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for 'verbose': must be in [0, 5], got 7"
        );
        assert!(err.is_open_fatal());
    }

    #[test]
    fn test_invalid_state_display() {
        let err = StagingError::InvalidState {
            operation: "put",
            state: StepState::Opened,
        };
        assert_eq!(err.to_string(), "put is not allowed while the engine is opened");
        assert!(!err.is_open_fatal());
    }

    #[test]
    fn test_channel_not_found_display() {
        let err = StagingError::ChannelNotFound { index: 4 };
        assert_eq!(err.to_string(), "No open channel at index 4");
        assert!(!err.is_open_fatal());
    }

    #[test]
    fn test_variable_error_is_transparent() {
        let err = StagingError::from(VariableError::Duplicate("u".into()));
        assert_eq!(err.to_string(), "Variable u was already put in this step");
    }
}
