//! TCP transports: client connections, accepted-connection halves, and the
//! listening transport used by the server.
//!
//! # Design Decisions
//! - An accepted connection is split into owned read/write halves so the
//!   input and output protocols of one connection can operate independently
//!   without sharing a stream.
//! - `TcpServerTransport::close` is callable from any task while `accept` is
//!   blocked; the woken `accept` fails with kind `Interrupted`, which the
//!   server loop treats as a deliberate shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{ConnectionHalves, ServerTransport, Transport};

/// Client-side TCP transport over one full-duplex stream.
pub struct TcpTransport {
    addr: String,
    stream: Option<TcpStream>,
    lookahead: Option<u8>,
    eof: bool,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            lookahead: None,
            eof: false,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            TransportError::with_source(
                TransportErrorKind::NotOpen,
                format!("could not connect to {}", self.addr),
                e,
            )
        })?;
        self.stream = Some(stream);
        self.eof = false;
        self.lookahead = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.lookahead.take() {
            buf[0] = byte;
            return Ok(1);
        }
        if self.eof {
            return Err(TransportError::new(
                TransportErrorKind::EndOfFile,
                "no more data available",
            ));
        }
        let stream = self.stream.as_mut().ok_or_else(|| {
            TransportError::new(TransportErrorKind::NotOpen, "transport is not open")
        })?;
        let n = stream.read(buf).await.map_err(TransportError::from)?;
        if n == 0 {
            self.eof = true;
            return Err(TransportError::new(
                TransportErrorKind::EndOfFile,
                "no more data available",
            ));
        }
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            TransportError::new(TransportErrorKind::NotOpen, "transport is not open")
        })?;
        stream.write_all(buf).await.map_err(TransportError::from)
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            TransportError::new(TransportErrorKind::NotOpen, "transport is not open")
        })?;
        stream.flush().await.map_err(TransportError::from)
    }

    async fn peek(&mut self) -> Result<bool, TransportError> {
        if self.lookahead.is_some() {
            return Ok(true);
        }
        if self.eof || self.stream.is_none() {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        match self.read(&mut byte).await {
            Ok(_) => {
                self.lookahead = Some(byte[0]);
                Ok(true)
            }
            Err(e) if e.kind() == TransportErrorKind::EndOfFile => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Read side of an accepted connection.
pub struct TcpReadTransport {
    half: OwnedReadHalf,
    lookahead: Option<u8>,
    eof: bool,
    open: bool,
}

impl TcpReadTransport {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            lookahead: None,
            eof: false,
            open: true,
        }
    }
}

#[async_trait]
impl Transport for TcpReadTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.lookahead.take() {
            buf[0] = byte;
            return Ok(1);
        }
        if !self.open {
            return Err(TransportError::new(
                TransportErrorKind::NotOpen,
                "transport is closed",
            ));
        }
        if self.eof {
            return Err(TransportError::new(
                TransportErrorKind::EndOfFile,
                "no more data available",
            ));
        }
        let n = self.half.read(buf).await.map_err(TransportError::from)?;
        if n == 0 {
            self.eof = true;
            return Err(TransportError::new(
                TransportErrorKind::EndOfFile,
                "no more data available",
            ));
        }
        Ok(n)
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::new(
            TransportErrorKind::NotOpen,
            "read half is not writable",
        ))
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn peek(&mut self) -> Result<bool, TransportError> {
        if self.lookahead.is_some() {
            return Ok(true);
        }
        if self.eof || !self.open {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        match self.read(&mut byte).await {
            Ok(_) => {
                self.lookahead = Some(byte[0]);
                Ok(true)
            }
            Err(e) if e.kind() == TransportErrorKind::EndOfFile => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Write side of an accepted connection.
pub struct TcpWriteTransport {
    half: OwnedWriteHalf,
    open: bool,
}

impl TcpWriteTransport {
    fn new(half: OwnedWriteHalf) -> Self {
        Self { half, open: true }
    }
}

#[async_trait]
impl Transport for TcpWriteTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            let _ = self.half.shutdown().await;
        }
        Ok(())
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Err(TransportError::new(
            TransportErrorKind::NotOpen,
            "write half is not readable",
        ))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::new(
                TransportErrorKind::NotOpen,
                "transport is closed",
            ));
        }
        self.half.write_all(buf).await.map_err(TransportError::from)
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::new(
                TransportErrorKind::NotOpen,
                "transport is closed",
            ));
        }
        self.half.flush().await.map_err(TransportError::from)
    }

    async fn peek(&mut self) -> Result<bool, TransportError> {
        Ok(false)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Split an accepted stream into the input/output transports handed to the
/// per-connection worker.
pub fn split_stream(stream: TcpStream) -> ConnectionHalves {
    let (read, write) = stream.into_split();
    (
        Box::new(TcpReadTransport::new(read)),
        Box::new(TcpWriteTransport::new(write)),
    )
}

/// The listening transport used by the server loop.
pub struct TcpServerTransport {
    addr: String,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
    interrupt: Notify,
}

impl TcpServerTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            closed: AtomicBool::new(false),
            interrupt: Notify::new(),
        }
    }

    /// The bound address, once `listen` has succeeded. Binding port 0 and
    /// reading the assigned port back is the usual test setup.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_listener(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    async fn listen(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.addr).await.map_err(|e| {
            TransportError::with_source(
                TransportErrorKind::NotOpen,
                format!("could not bind {}", self.addr),
                e,
            )
        })?;
        let local = listener.local_addr().ok();
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = local;
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
        self.closed.store(false, Ordering::SeqCst);
        tracing::info!(address = ?local, "listener bound");
        Ok(())
    }

    async fn accept(&self) -> Result<ConnectionHalves, TransportError> {
        loop {
            let notified = self.interrupt.notified();
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::new(
                    TransportErrorKind::Interrupted,
                    "listener closed",
                ));
            }
            let listener = self.current_listener().ok_or_else(|| {
                TransportError::new(TransportErrorKind::NotOpen, "listener is not listening")
            })?;

            tokio::select! {
                _ = notified => {
                    // Stale wake-ups from a previous serve cycle loop back.
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(TransportError::new(
                            TransportErrorKind::Interrupted,
                            "listener closed",
                        ));
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer_addr = %peer, "connection accepted");
                        return Ok(split_stream(stream));
                    }
                    Err(e) if self.closed.load(Ordering::SeqCst) => {
                        return Err(TransportError::with_source(
                            TransportErrorKind::Interrupted,
                            "listener closed",
                            e,
                        ));
                    }
                    Err(e) => {
                        return Err(TransportError::with_source(
                            TransportErrorKind::Unknown,
                            "accept failed",
                            e,
                        ));
                    }
                },
            }
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.interrupt.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn close_interrupts_blocked_accept() {
        let transport = Arc::new(TcpServerTransport::new("127.0.0.1:0"));
        transport.listen().await.unwrap();

        let accepting = Arc::clone(&transport);
        let handle = tokio::spawn(async move { accepting.accept().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("accept should return promptly after close")
            .unwrap()
            .err()
            .expect("accept should fail after close");
        assert_eq!(err.kind(), TransportErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn peer_close_reads_as_eof() {
        let transport = TcpServerTransport::new("127.0.0.1:0");
        transport.listen().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut input, _output) = transport.accept().await.unwrap();
        drop(client);

        assert!(!input.peek().await.unwrap());
    }
}
