//! Wolfpack Error Types

use thiserror::Error;

/// Result type alias for wolfpack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wolfpack error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cluster name mismatch: ours is {ours}, peer sent {theirs}")]
    ClusterMismatch { ours: String, theirs: String },

    #[error("Frame checksum mismatch")]
    ChecksumMismatch,

    #[error("Unknown gossip verb: {0}")]
    UnknownVerb(u8),

    // Endpoint errors
    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Endpoint still alive: {0}")]
    EndpointStillAlive(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable on a later gossip round
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
        )
    }
}
