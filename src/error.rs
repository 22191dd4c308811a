use std::io;

use thiserror::Error;

/// Result type for overlay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the overlay node
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TAP device setup error
    #[error("device error: {0}")]
    Device(String),

    /// Wire codec error
    #[error("codec error: {0}")]
    Codec(String),

    /// Malformed MAC address
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Malformed introduction payload
    #[error("invalid introduction payload: {0}")]
    InvalidIntro(String),

    /// MAC already registered to a different peer
    #[error("MAC {0} already registered to another peer")]
    MacConflict(String),

    /// Peer not found
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Lock error
    #[error("lock poisoned")]
    Lock,
}
