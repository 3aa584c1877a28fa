//! Error types shared by the transport, protocol, and server layers.
//!
//! # Design Decisions
//! - Transport failures carry a classification (`TransportErrorKind`) so the
//!   server loop can tell an expected disconnect or shutdown interrupt apart
//!   from a genuine fault.
//! - Protocol failures wrap transport failures so codec callers only deal
//!   with one error type.

use thiserror::Error;

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The underlying resource is not open or could not be established.
    NotOpen,
    /// No bytes remain and none will arrive.
    EndOfFile,
    /// A blocking call was interrupted by a deliberate close (shutdown).
    Interrupted,
    /// The peer did not respond within the configured timeout.
    TimedOut,
    /// An underlying I/O fault with no more specific classification.
    Unknown,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportErrorKind::NotOpen => "not open",
            TransportErrorKind::EndOfFile => "end of file",
            TransportErrorKind::Interrupted => "interrupted",
            TransportErrorKind::TimedOut => "timed out",
            TransportErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A failure while moving raw bytes between endpoints.
#[derive(Debug, Error)]
#[error("transport error ({kind}): {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// True for the failure shapes a healthy client produces when it hangs up.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::EndOfFile | TransportErrorKind::NotOpen
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportErrorKind::EndOfFile,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::TimedOut
            }
            std::io::ErrorKind::NotConnected => TransportErrorKind::NotOpen,
            _ => TransportErrorKind::Unknown,
        };
        TransportError::with_source(kind, "i/o fault", err)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::TimedOut
        } else if err.is_connect() {
            TransportErrorKind::NotOpen
        } else {
            TransportErrorKind::Unknown
        };
        TransportError::with_source(kind, "could not complete http exchange", err)
    }
}

/// A failure while encoding or decoding structured values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Nested structures exceeded the configured recursion limit.
    #[error("nesting depth exceeded the configured limit of {0}")]
    DepthLimit(usize),

    /// The byte stream does not form a valid encoding.
    #[error("invalid wire data: {0}")]
    InvalidData(String),

    /// A version or type tag this codec does not understand.
    #[error("unsupported encoding: {0}")]
    Unsupported(String),

    /// The underlying transport failed mid-operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ProtocolError::InvalidData(message.into())
    }
}

/// Crate-level error, the sum of the layer-specific failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A failure raised by an application-supplied processor.
    #[error("processor error: {0}")]
    Processor(String),
}

impl Error {
    /// The transport failure at the root of this error, if there is one.
    ///
    /// The server loop uses this to recognize client disconnects that arrive
    /// wrapped in a protocol error.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Protocol(ProtocolError::Transport(e)) => Some(e),
            _ => None,
        }
    }
}
