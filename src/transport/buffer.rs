//! In-memory transports: a growable byte buffer and a buffering wrapper.

use async_trait::async_trait;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{Transport, TransportFactory};

/// A transport backed entirely by memory.
///
/// Writes append to the buffer; reads consume it from the front. Used by
/// codec tests and anywhere a byte sequence needs to masquerade as a peer.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    buf: Vec<u8>,
    pos: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose readable content is `bytes`.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: bytes.into(),
            pos: 0,
        }
    }

    /// Everything written (and not yet consumed by reads).
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.pos >= self.buf.len() {
            return Err(TransportError::new(
                TransportErrorKind::EndOfFile,
                "no more data available",
            ));
        }
        let n = buf.len().min(self.buf.len() - self.pos);
        buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn peek(&mut self) -> Result<bool, TransportError> {
        Ok(self.pos < self.buf.len())
    }

    fn is_open(&self) -> bool {
        true
    }
}

const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Read-ahead and write coalescing over any inner transport.
///
/// Reads pull `capacity`-sized chunks from the inner transport; writes stage
/// in memory and reach the inner transport when the staging buffer fills or
/// on `flush`.
pub struct BufferedTransport {
    inner: Box<dyn Transport>,
    rbuf: Vec<u8>,
    rpos: usize,
    wbuf: Vec<u8>,
    capacity: usize,
}

impl BufferedTransport {
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self::with_capacity(inner, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(inner: Box<dyn Transport>, capacity: usize) -> Self {
        Self {
            inner,
            rbuf: Vec::new(),
            rpos: 0,
            wbuf: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Refill the read buffer. `Ok(false)` means end of stream.
    async fn fill(&mut self) -> Result<bool, TransportError> {
        self.rbuf.resize(self.capacity, 0);
        self.rpos = 0;
        match self.inner.read(&mut self.rbuf).await {
            Ok(n) => {
                self.rbuf.truncate(n);
                Ok(n > 0)
            }
            Err(e) if e.kind() == TransportErrorKind::EndOfFile => {
                self.rbuf.clear();
                Ok(false)
            }
            Err(e) => {
                self.rbuf.clear();
                Err(e)
            }
        }
    }

    fn buffered(&self) -> usize {
        self.rbuf.len() - self.rpos
    }
}

#[async_trait]
impl Transport for BufferedTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.buffered() == 0 && !self.fill().await? {
            return Err(TransportError::new(
                TransportErrorKind::EndOfFile,
                "no more data available",
            ));
        }
        let n = buf.len().min(self.buffered());
        buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
        self.rpos += n;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.wbuf.extend_from_slice(buf);
        if self.wbuf.len() >= self.capacity {
            let staged = std::mem::take(&mut self.wbuf);
            self.inner.write(&staged).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        if !self.wbuf.is_empty() {
            let staged = std::mem::take(&mut self.wbuf);
            self.inner.write(&staged).await?;
        }
        self.inner.flush().await
    }

    async fn peek(&mut self) -> Result<bool, TransportError> {
        if self.buffered() > 0 {
            return Ok(true);
        }
        self.fill().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

/// The default server-side transport factory.
pub struct BufferedTransportFactory {
    capacity: usize,
}

impl BufferedTransportFactory {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for BufferedTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for BufferedTransportFactory {
    fn create(&self, inner: Box<dyn Transport>) -> Box<dyn Transport> {
        Box::new(BufferedTransport::with_capacity(inner, self.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_transport_round_trip() {
        let mut t = MemoryTransport::new();
        t.write(b"hello ").await.unwrap();
        t.write(b"world").await.unwrap();

        let mut buf = [0u8; 11];
        t.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");

        let err = t.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::EndOfFile);
    }

    #[tokio::test]
    async fn writes_stay_buffered_until_flush() {
        let mut buffered = BufferedTransport::new(Box::new(MemoryTransport::new()));
        buffered.write(b"staged").await.unwrap();

        // Nothing reaches the inner transport before flush.
        assert!(!buffered.inner.peek().await.unwrap());

        buffered.flush().await.unwrap();
        assert!(buffered.inner.peek().await.unwrap());
    }

    #[tokio::test]
    async fn peek_reports_eof_without_error() {
        let mut buffered = BufferedTransport::new(Box::new(MemoryTransport::from_bytes(b"x")));
        assert!(buffered.peek().await.unwrap());

        let mut one = [0u8; 1];
        buffered.read_exact(&mut one).await.unwrap();
        assert!(!buffered.peek().await.unwrap());
    }
}
