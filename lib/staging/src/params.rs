// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Open-time parameters.
//!
//! [`Params`] is a case-insensitive string map with the lenient accessors the
//! transport layer uses for tuning knobs. [`EngineSettings::resolve`] turns a
//! `Params` into validated engine settings; only `verbose`, `BasePort` and the
//! interface selectors are fatal when malformed, every other recognized key
//! falls back to its default with a warning. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use dynamo_staging_common::{DEFAULT_BASE_PORT, LibraryKey};
use validator::{Validate, ValidationErrors};

use crate::error::{Result, StagingError};
use crate::handshake::{DEFAULT_HANDSHAKE_FILE, InterfaceSelector};

/// Default transport library.
pub const DEFAULT_LIBRARY: &str = "zmq";

/// Highest accepted `verbose` level.
pub const MAX_VERBOSITY: u8 = 5;

/// Case-insensitive key/value parameters.
///
/// Keys are stored lowercased; values keep their case and are compared
/// case-insensitively where it matters (booleans, enums).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: BTreeMap<String, String>,
}

impl Params {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, returning the previous value for the same key.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.entries
            .insert(key.as_ref().to_lowercase(), value.into())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Raw value for `key`, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(String::as_str)
    }

    #[allow(missing_docs)]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// `yes`/`true` → `true`; `no`/`false`, anything else, or absent → `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key).map(|v| v.trim().to_lowercase()) {
            Some(value) => matches!(value.as_str(), "yes" | "true"),
            None => false,
        }
    }

    /// Owned copy of the raw value.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    /// Best-effort integer parse.
    ///
    /// A value that is present but not an integer is logged and reported as
    /// absent; the caller keeps whatever default it had.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?;
        match raw.trim().parse::<i64>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    key,
                    value = raw,
                    "Parameter {} should be an integer in string format; ignoring it: {}",
                    key,
                    e
                );
                None
            }
        }
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order, keys lowercased.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

impl<K: AsRef<str>, V: Into<String>, const N: usize> From<[(K, V); N]> for Params {
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

/// Diagnostic verbosity, `0..=5`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(u8);

impl Verbosity {
    /// Wrap a level, rejecting anything above [`MAX_VERBOSITY`].
    pub fn new(level: u8) -> Option<Self> {
        (level <= MAX_VERBOSITY).then_some(Self(level))
    }

    #[allow(missing_docs)]
    pub fn level(self) -> u8 {
        self.0
    }

    /// Open/close events are promoted to `info`.
    pub fn reports_lifecycle(self) -> bool {
        self.0 >= 3
    }

    /// Per-step events (begin/put/end/flush) are promoted to `info`.
    pub fn reports_steps(self) -> bool {
        self.0 >= MAX_VERBOSITY
    }
}

/// Validated engine settings.
///
/// # Example
///
/// ```
/// use dynamo_staging::params::EngineSettings;
///
/// let settings = EngineSettings::builder()
///     .verbose(3)
///     .library("inproc")
///     .build()
///     .unwrap();
/// assert_eq!(settings.verbosity().level(), 3);
/// ```
#[derive(Debug, Clone, Builder, Validate)]
#[builder(pattern = "owned", build_fn(private, name = "build_unchecked"))]
pub struct EngineSettings {
    /// Diagnostic verbosity, `0..=5`.
    #[builder(default = "0")]
    #[validate(range(max = 5))]
    pub verbose: u8,

    /// Base of the derived metadata/data ports.
    #[builder(default = "DEFAULT_BASE_PORT")]
    pub base_port: u16,

    /// Interface selection policy for the handshake.
    #[builder(default)]
    pub interface: InterfaceSelector,

    /// Location of the discovery artifact written by rank 0.
    #[builder(default = "PathBuf::from(DEFAULT_HANDSHAKE_FILE)", setter(into))]
    pub handshake_file: PathBuf,

    /// Transport library for every channel.
    #[builder(default = "LibraryKey::from(DEFAULT_LIBRARY)", setter(into))]
    pub library: LibraryKey,

    /// Open a per-rank data channel serving pulls of local data packs.
    #[builder(default = "true")]
    pub data_channel: bool,

    /// Starting capacity hint of each step buffer, in bytes.
    #[builder(default = "1024")]
    #[validate(range(min = 1))]
    pub buffer_size: usize,

    /// Local data packs retained for pulls.
    #[builder(default = "16")]
    #[validate(range(min = 1))]
    pub queue_limit: usize,

    /// Timeout for synchronous requests.
    #[builder(default = "Duration::from_millis(5000)")]
    pub request_timeout: Duration,

    /// Count writes per channel.
    #[builder(default = "false")]
    pub profile: bool,
}

impl EngineSettingsBuilder {
    /// Build and validate the settings.
    pub fn build(self) -> Result<EngineSettings> {
        let settings = self
            .build_unchecked()
            .map_err(|e| StagingError::invalid_configuration("settings", e.to_string()))?;
        settings.validate().map_err(from_validation_errors)?;
        Ok(settings)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            verbose: 0,
            base_port: DEFAULT_BASE_PORT,
            interface: InterfaceSelector::default(),
            handshake_file: PathBuf::from(DEFAULT_HANDSHAKE_FILE),
            library: LibraryKey::from(DEFAULT_LIBRARY),
            data_channel: true,
            buffer_size: 1024,
            queue_limit: 16,
            request_timeout: Duration::from_millis(5000),
            profile: false,
        }
    }
}

impl EngineSettings {
    #[allow(missing_docs)]
    pub fn builder() -> EngineSettingsBuilder {
        EngineSettingsBuilder::default()
    }

    #[allow(missing_docs)]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity(self.verbose)
    }

    /// Resolve settings from open-time parameters.
    pub fn resolve(params: &Params) -> Result<Self> {
        let defaults = EngineSettings::default();
        let mut builder = EngineSettings::builder();

        if let Some(raw) = params.get("verbose") {
            builder = builder.verbose(parse_verbose(raw)?);
        }

        if let Some(port) = params.get_int("BasePort") {
            let port = u16::try_from(port).map_err(|_| {
                StagingError::invalid_configuration(
                    "BasePort",
                    format!("must be in [0, 65535], got {port}"),
                )
            })?;
            builder = builder.base_port(port);
        }

        builder = builder.interface(parse_interface(params)?);

        if let Some(path) = params.get_string("HandshakeFile") {
            builder = builder.handshake_file(path);
        }
        if let Some(library) = params.get("Library") {
            builder = builder.library(library);
        }
        if params.contains("DataChannel") {
            builder = builder.data_channel(params.get_bool("DataChannel"));
        }
        if params.contains("Profile") {
            builder = builder.profile(params.get_bool("Profile"));
        }

        builder = builder
            .buffer_size(advisory_positive(params, "BufferSize").unwrap_or(defaults.buffer_size))
            .queue_limit(advisory_positive(params, "QueueLimit").unwrap_or(defaults.queue_limit))
            .request_timeout(
                advisory_positive(params, "RequestTimeout")
                    .map(|ms| Duration::from_millis(ms as u64))
                    .unwrap_or(defaults.request_timeout),
            );

        builder.build()
    }
}

fn parse_verbose(raw: &str) -> Result<u8> {
    let out_of_range = || {
        StagingError::invalid_configuration(
            "verbose",
            format!("must be an integer in the range [0, {MAX_VERBOSITY}], got '{raw}'"),
        )
    };
    let value: i64 = raw.trim().parse().map_err(|_| out_of_range())?;
    u8::try_from(value)
        .ok()
        .and_then(Verbosity::new)
        .map(Verbosity::level)
        .ok_or_else(out_of_range)
}

fn parse_interface(params: &Params) -> Result<InterfaceSelector> {
    match (params.get("IPAddress"), params.get("NetworkInterface")) {
        (Some(_), Some(_)) => Err(StagingError::invalid_configuration(
            "IPAddress",
            "IPAddress and NetworkInterface are mutually exclusive",
        )),
        (Some(ip), None) => {
            let ip: IpAddr = ip.trim().parse().map_err(|_| {
                StagingError::invalid_configuration(
                    "IPAddress",
                    format!("'{ip}' is not an IP address"),
                )
            })?;
            Ok(InterfaceSelector::Address(ip))
        }
        (None, Some(name)) => Ok(InterfaceSelector::Named(name.trim().to_string())),
        (None, None) => Ok(InterfaceSelector::First),
    }
}

/// Positive integer tuning knob; anything else is logged and ignored.
fn advisory_positive(params: &Params, key: &str) -> Option<usize> {
    let value = params.get_int(key)?;
    match usize::try_from(value) {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(key, value, "Parameter {} must be positive; using default", key);
            None
        }
    }
}

fn from_validation_errors(errors: ValidationErrors) -> StagingError {
    let field = errors
        .field_errors()
        .keys()
        .next()
        .map(|k| k.to_string())
        .unwrap_or_default();
    let key = match field.as_str() {
        "verbose" => "verbose",
        "buffer_size" => "BufferSize",
        "queue_limit" => "QueueLimit",
        _ => "settings",
    };
    StagingError::invalid_configuration(key, errors.to_string())
}
