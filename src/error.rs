//! Error types for camrelay

use thiserror::Error;

use crate::encoder::{HalError, StreamKind};

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pipeline and encoder operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration, rejected before any resource is acquired
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file or environment could not be loaded
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// A capture device could not be opened or configured
    #[error("Device {path}: {source}")]
    Device {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An encoder session failed after its fallback ladder was exhausted
    #[error("Failed to start {stream} stream: {source}")]
    SessionStart {
        stream: StreamKind,
        #[source]
        source: HalError,
    },

    /// Hardware encoder call failed outside of session start
    #[error("Encoder error: {0}")]
    Hal(#[from] HalError),

    /// The encoder orchestrator is not running
    #[error("Encoder is not running")]
    NotRunning,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a device error for the given path
    pub fn device(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Device {
            path: path.into(),
            source,
        }
    }
}
