// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! - `DYN_STAGING_LOG`: `EnvFilter` directives, default `info`
//! - `DYN_STAGING_LOGGING_CONFIG_PATH`: TOML file with `log_level` and a
//!   `log_filters` table of `module = "level"` pairs
//! - `DYN_STAGING_LOGGING_JSONL=1`: one JSON object per line on stderr
//!
//! The engine's `verbose` option is separate: it decides whether lifecycle
//! and step events are emitted at `info` or `debug`.

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// ENV used to set the log filter
const FILTER_ENV: &str = "DYN_STAGING_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "DYN_STAGING_LOGGING_CONFIG_PATH";

/// ENV enabling JSONL output
const JSONL_ENV: &str = "DYN_STAGING_LOGGING_JSONL";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("zeromq".to_string(), "warn".to_string())]),
        }
    }
}

/// Install the global subscriber. Later calls do nothing.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn jsonl_enabled() -> bool {
    std::env::var(JSONL_ENV)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    let result = if jsonl_enabled() {
        let l = fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    } else {
        let l = fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging was already initialized: {e}");
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let mut figment = Figment::new().merge(Serialized::defaults(LoggingConfig::default()));
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        figment = figment.merge(Toml::file(path));
    }
    figment.extract().unwrap_or_else(|e| {
        eprintln!("Invalid logging configuration, using defaults: {e}");
        LoggingConfig::default()
    })
}

/// Emit at `info` when `$promote` holds, at `debug` otherwise.
macro_rules! engine_event {
    ($promote:expr, $($arg:tt)+) => {
        if $promote {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

pub(crate) use engine_event;
