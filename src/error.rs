//! Error types for the device simulator.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Variants fall into two classes:
//! fatal ones stop the whole process (see [`Error::is_fatal`]), every other
//! variant is transient and only affects the protocol loop that raised it.

use std::net::SocketAddr;

/// Errors that can occur while simulating the device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON deserialization error (DHCP option or IPFIX traffic payloads).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be read or parsed.
    #[error("Cannot load configuration file: {0}")]
    Ini(#[from] ini::Error),

    /// Invalid configuration that cannot be replaced by a default.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The configured network interface does not exist or has no usable address.
    #[error("Network interface {name}: {reason}")]
    Interface { name: String, reason: String },

    /// Socket creation, configuration or raw send error.
    ///
    /// On the DHCP path this is fatal: the raw link socket has no recovery
    /// path to a valid link state.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A malformed or unexpected packet was received.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// No answer arrived before the deadline.
    #[error("Timed out waiting for {0}")]
    Timeout(SocketAddr),

    /// A RADIUS exchange gave up after exhausting its retries.
    #[error("RADIUS exchange with {server} failed: {reason}")]
    Radius { server: SocketAddr, reason: String },

    /// The IPFIX traffic list is malformed or empty.
    #[error("Invalid IPFIX traffic: {0}")]
    Traffic(String),

    /// The task was cancelled before it could finish.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Returns true for errors that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Ini(_) | Self::Config(_) | Self::Interface { .. } | Self::Socket(_)
        )
    }
}

/// A specialized Result type for simulator operations.
pub type Result<T> = std::result::Result<T, Error>;
