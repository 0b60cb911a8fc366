//! Error taxonomy for the server.
//!
//! Errors are grouped by the layer that raises them: the socket layer,
//! the opening handshake, the frame codec, and the connection registry.
//! Only bootstrap errors ever reach `main`; once the event loop is
//! running every error is contained to the connection that caused it.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure in the underlying byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("outbound queue full: {queued} bytes queued, limit {limit}")]
    Backpressure { queued: usize, limit: usize },
}

/// Failure during the HTTP upgrade exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),
    #[error("Protocol not implemented")]
    LegacyUnsupported,
    #[error("Malformed handshake request: {0}")]
    Malformed(&'static str),
    #[error("Handshake request exceeds {0} bytes")]
    RequestTooLarge(usize),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    /// Whether the peer should be told why it was rejected.
    ///
    /// Transport failures leave nobody to tell.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, HandshakeError::Transport(_))
    }
}

/// Failure encoding or decoding a wire frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shorter than its declared length")]
    TruncatedFrame,
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: u64, max: u64 },
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),
    #[error("client frame is not masked")]
    Unmasked,
    #[error("fragmented frames are not supported")]
    Fragmented,
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
}

/// Failure looking up or inserting a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("connection id already registered: {0}")]
    Duplicate(String),
    #[error("registry is full ({0} connections)")]
    Full(usize),
}

/// Failure handing a payload to a specific connection.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
