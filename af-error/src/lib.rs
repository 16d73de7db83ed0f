//! Unified error handling for Aeroflux
//!
//! One thiserror-based error type shared by every crate in the workspace.
//! Constructor helpers cover the cases that are built from formatted
//! messages; everything else converts through `#[from]` impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using AerofluxError
pub type Result<T> = std::result::Result<T, AerofluxError>;

/// Unified error type for all Aeroflux operations
#[derive(thiserror::Error, Debug)]
pub enum AerofluxError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read {path}: {source}")]
    DeviceRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write {value} to {path}: {source}")]
    DeviceWrite {
        path: PathBuf,
        value: i64,
        source: io::Error,
    },

    #[error("Unparseable value '{raw}' read from {path}")]
    DeviceParse {
        path: PathBuf,
        raw: String,
    },

    #[error("Command '{command}' failed: {reason}")]
    Command {
        command: String,
        reason: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("{0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Persistence Errors
    // ============================================================================
    #[error("No persisted PWM data for fan '{0}'")]
    PwmDataMissing(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cannot attach empty PWM curve data to fan '{0}'")]
    InvalidCurveData(String),

    // ============================================================================
    // Runtime Errors
    // ============================================================================
    #[error("No curve definition with id '{0}' found")]
    UnknownCurve(String),

    #[error("No sensor definition with id '{0}' found")]
    UnknownSensor(String),

    #[error("Fan '{0}' reports no RPM even at maximum PWM")]
    FanDead(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl AerofluxError {
    /// Generic error with a free-form message
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Configuration error with a formatted message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Persistence error with a formatted message
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Failed read of a device file
    pub fn device_read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::DeviceRead {
            path: path.into(),
            source,
        }
    }

    /// Failed write of a device file
    pub fn device_write(path: impl Into<PathBuf>, value: i64, source: io::Error) -> Self {
        Self::DeviceWrite {
            path: path.into(),
            value,
            source,
        }
    }
}
