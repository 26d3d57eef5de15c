//! Error types
//!
//! Every per-session failure maps onto [`Error`]; the connection task logs it
//! and tears down only that session. [`Error::Bind`] is the one error that is
//! fatal to the process.

use std::net::SocketAddr;

use crate::registry::StreamKey;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("AMF error: {0}")]
    Amf(#[from] AmfError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Stream key already has an active publisher
    #[error("stream already publishing: {0}")]
    AlreadyPublishing(StreamKey),

    /// Peer did not answer a ping within the configured timeout
    #[error("liveness timeout")]
    LivenessTimeout,

    /// Subscriber queue overflowed and the subscriber was dropped
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Listener could not bind its port
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// Chunk stream framing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// Header format 1-3 used before any format 0 header on this chunk stream
    #[error("chunk stream {0} has no previous header")]
    MissingPreviousHeader(u32),

    #[error("too many chunk streams in use (limit {0})")]
    TooManyChunkStreams(usize),

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: u32, limit: u32 },

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("message type {message_type} payload too short ({len} bytes)")]
    TruncatedPayload { message_type: u8, len: usize },
}

/// Handshake errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported RTMP version {0}")]
    InvalidVersion(u8),

    #[error("handshake did not complete in time")]
    Timeout,

    #[error("peer closed connection during handshake")]
    UnexpectedEof,
}

/// AMF0 decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    #[error("unknown AMF0 marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid UTF-8 in AMF string")]
    InvalidUtf8,

    #[error("invalid AMF reference {0}")]
    InvalidReference(u16),

    #[error("AMF nesting too deep")]
    NestingTooDeep,
}

/// Protocol-level errors above the framing layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid session transition from {from} on {event}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },

    #[error("command message has no name")]
    MissingCommandName,

    #[error("{0} received before connect")]
    NotConnected(&'static str),
}
