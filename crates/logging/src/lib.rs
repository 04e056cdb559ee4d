//! Encore Logging
//!
//! One place to install the `tracing` subscriber. `RUST_LOG` always wins over
//! the level passed in by the application.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Default verbosity when `RUST_LOG` is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Filter directive: our crates at `self`, dependencies one notch quieter.
    fn directive(&self) -> String {
        let deps = match self {
            Self::Trace | Self::Debug => "info",
            _ => "warn",
        };
        format!("{},encore={}", deps, self.as_str())
    }
}

/// Install the global fmt subscriber. Returns an error string if one is already set.
pub fn try_init(level: LogLevel) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| e.to_string())
}
