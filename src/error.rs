//! Error types for brickwire.

use thiserror::Error;

/// Main error type for all brickwire operations.
#[derive(Debug, Error)]
pub enum BrickwireError {
    /// I/O error during SPI device, GPIO, or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON deserialization error (configuration only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// Protocol error (malformed packet header, bad length, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Outbound packet exceeds the maximum packet size.
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// The event bridge was closed while the SPI thread was still running.
    #[error("Event bridge closed")]
    BridgeClosed,
}

/// Result type alias using BrickwireError.
pub type Result<T> = std::result::Result<T, BrickwireError>;
