//! Error types for discus.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all discus operations.
///
/// Lifecycle variants (`ConnectionClosed`, `ConnectionPaused`,
/// `ConnectionNotInitialized`) are sentinel values: a connection stores one
/// of them in its last-error slot as part of a state transition, and public
/// operations observing a non-connected state return the slot's value.
///
/// The `Io` variant wraps the source error in an `Arc` so the slot can be
/// cloned out without losing the original.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The connection has been closed and cannot be used again.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection is paused after an EOF-class read error. A reconnect
    /// layer may resurrect the logical connection; the transport will not.
    #[error("connection paused")]
    ConnectionPaused,

    /// The operation requires a connection that was never established.
    #[error("connection not initialized")]
    ConnectionNotInitialized,

    /// A packet's declared content length does not match its content.
    #[error("invalid content length")]
    InvalidContentLength,

    /// A TLS-specific query was made on a plain stream.
    #[error("not a TLS connection")]
    NotTlsConnection,

    /// A header buffer was too short to decode.
    #[error("invalid buffer length")]
    InvalidBufferLength,

    /// A decoded header declared an impossible content length.
    #[error("invalid buffer contents")]
    InvalidBufferContents,

    /// The ring buffer was closed and drained.
    #[error("ring buffer closed")]
    RingBufferClosed,

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Whether this error signals the peer ended the stream (EOF or a closed
    /// pipe) rather than a hard failure. EOF-class read errors pause the
    /// connection instead of closing it.
    pub(crate) fn is_eof_class(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
