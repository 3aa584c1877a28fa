//! Byte-transport subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP connection
//!     → tcp.rs (raw read/write halves)
//!     → buffer.rs (read-ahead + write coalescing)
//!     → handed to the protocol layer
//!
//! Client side:
//!     protocol writes → transport buffer → Flush() commits one exchange
//!     (tcp.rs writes to the socket; http.rs performs one POST round trip)
//! ```
//!
//! # Design Decisions
//! - Transports move bytes only; structure lives in the protocol layer, so
//!   any protocol runs over any transport.
//! - `flush` is the single commit point: buffering transports perform no peer
//!   I/O anywhere else.
//! - `peek` lets the server loop tell "next request pending" from "client
//!   hung up" between requests without consuming data.

use async_trait::async_trait;

use crate::error::{TransportError, TransportErrorKind};

pub mod buffer;
pub mod http;
pub mod tcp;

pub use buffer::{BufferedTransport, BufferedTransportFactory, MemoryTransport};
pub use http::{FlushHandle, HttpTransport, HttpTransportBuilder};
pub use tcp::{TcpServerTransport, TcpTransport};

/// An ordered byte stream between two endpoints.
///
/// `read` blocks until at least one byte is available or the stream ends; it
/// never returns `Ok(0)` while more data may still arrive. `write` only
/// appends to the transport's output buffer; `flush` commits the buffered
/// bytes as one logical message exchange.
#[async_trait]
pub trait Transport: Send {
    /// Establish the underlying resource.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Release the underlying resource. Benign on an already-closed instance.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, blocking until at least one is
    /// available. Fails with `EndOfFile` once the stream is exhausted.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Append bytes to the output buffer without transmitting them.
    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Commit the buffered output as a single exchange and reset the buffer.
    async fn flush(&mut self) -> Result<(), TransportError>;

    /// Report whether at least one more byte will be readable, waiting for
    /// data or end-of-stream, without consuming anything.
    async fn peek(&mut self) -> Result<bool, TransportError>;

    fn is_open(&self) -> bool;

    /// Read exactly `buf.len()` bytes, looping over short reads.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransportError::new(
                    TransportErrorKind::EndOfFile,
                    "stream ended before the requested bytes arrived",
                ));
            }
            filled += n;
        }
        Ok(())
    }
}

/// Wraps an accepted raw transport in the transport actually handed to a
/// protocol (buffering, framing, or nothing at all).
pub trait TransportFactory: Send + Sync {
    fn create(&self, inner: Box<dyn Transport>) -> Box<dyn Transport>;
}

/// Hands the raw transport through unchanged.
pub struct IdentityTransportFactory;

impl TransportFactory for IdentityTransportFactory {
    fn create(&self, inner: Box<dyn Transport>) -> Box<dyn Transport> {
        inner
    }
}

/// The input and output transports for one accepted connection.
pub type ConnectionHalves = (Box<dyn Transport>, Box<dyn Transport>);

/// A listening transport: accepts connections and yields their raw halves.
///
/// `close` called from another task must wake a blocked `accept`, which then
/// fails with kind `Interrupted` so the server loop can tell a deliberate
/// shutdown apart from an accept fault.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    async fn listen(&self) -> Result<(), TransportError>;

    async fn accept(&self) -> Result<ConnectionHalves, TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}
