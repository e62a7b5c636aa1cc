//! Error types for the controller.
//!
//! This module defines all error types used throughout the crate,
//! providing detailed error information for debugging and for routing
//! decisions in the ingress pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for the controller.
#[derive(Debug, Error)]
pub enum LedlinkError {
    /// IO error during file or port operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error detected at load time.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A job file row failed to parse or validate.
    ///
    /// Carries the location so ingress can route the pair to the error
    /// directory without matching on message text.
    #[error("Invalid row at {}:{}: {}", .path.display(), .line, .reason)]
    ParseRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Serial transport failure (open, write, or close).
    #[error("Transport error: {message}")]
    Transport { message: String },
}

impl LedlinkError {
    /// Build a configuration error from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        LedlinkError::Config {
            message: message.into(),
        }
    }

    /// Build a transport error from any displayable message.
    pub fn transport(message: impl Into<String>) -> Self {
        LedlinkError::Transport {
            message: message.into(),
        }
    }
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, LedlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_row_display() {
        let err = LedlinkError::ParseRow {
            path: PathBuf::from("work/red.txt"),
            line: 7,
            reason: "duplicate index 42".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("red.txt"));
        assert!(msg.contains(":7"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_config_helper() {
        let err = LedlinkError::config("bad row_pattern");
        assert!(err.to_string().contains("bad row_pattern"));
    }
}
