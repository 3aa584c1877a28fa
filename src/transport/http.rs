//! HTTP client transport: one flush = one POST exchange.
//!
//! # Responsibilities
//! - Stage protocol writes in memory until `flush`
//! - Perform a single POST with the codec's media type on flush
//! - Drain the full response body into memory before exposing it to reads
//! - Offer a begin/end flush pair that never blocks the initiating task
//!
//! # Design Decisions
//! - The blocking `flush` is implemented as "begin the asynchronous exchange
//!   and await its completion", so the two flows share one code path and one
//!   failure classification.
//! - A pending exchange is a single-use completion (`FlushHandle` wraps a
//!   oneshot receiver); move semantics guarantee exactly one consumer.
//! - The output buffer is reset when an exchange starts, success or failure,
//!   so a failed exchange can never leak bytes into the next message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::oneshot;
use url::Url;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::Transport;

const DEFAULT_MEDIA_TYPE: &str = "application/x-thrift";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`HttpTransport`].
pub struct HttpTransportBuilder {
    url: Url,
    connect_timeout: Duration,
    read_timeout: Duration,
    headers: HashMap<String, String>,
    proxy: Option<reqwest::Proxy>,
    identity: Option<reqwest::Identity>,
    media_type: String,
}

impl HttpTransportBuilder {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            headers: HashMap::new(),
            proxy: None,
            identity: None,
            media_type: DEFAULT_MEDIA_TYPE.to_string(),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Add one custom header sent with every exchange.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn proxy(mut self, proxy: reqwest::Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Client identity certificate presented during the TLS handshake.
    pub fn identity(mut self, identity: reqwest::Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Media type for the `Content-Type` and `Accept` headers.
    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name: HeaderName = name.parse().map_err(|_| {
                TransportError::new(
                    TransportErrorKind::Unknown,
                    format!("invalid header name {name:?}"),
                )
            })?;
            let value: HeaderValue = value.parse().map_err(|_| {
                TransportError::new(
                    TransportErrorKind::Unknown,
                    format!("invalid header value for {name}"),
                )
            })?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("girder/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .default_headers(headers);
        if let Some(proxy) = self.proxy {
            builder = builder.proxy(proxy);
        }
        if let Some(identity) = self.identity {
            builder = builder.identity(identity);
        }
        let client = builder.build().map_err(TransportError::from)?;

        Ok(HttpTransport {
            client,
            url: self.url,
            media_type: self.media_type,
            wbuf: Vec::new(),
            rbuf: Vec::new(),
            rpos: 0,
            has_response: false,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Transport that exchanges each flushed message over one HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    media_type: String,
    wbuf: Vec<u8>,
    rbuf: Vec<u8>,
    rpos: usize,
    has_response: bool,
    in_flight: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn builder(url: Url) -> HttpTransportBuilder {
        HttpTransportBuilder::new(url)
    }

    /// Start one asynchronous exchange with the buffered output.
    ///
    /// The output buffer is taken and reset immediately. At most one exchange
    /// may be in flight per transport; starting a second before the first
    /// completes is an error.
    pub fn begin_flush(&mut self) -> Result<FlushHandle, TransportError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::new(
                TransportErrorKind::NotOpen,
                "an exchange is already in flight on this transport",
            ));
        }

        let body = std::mem::take(&mut self.wbuf);
        let client = self.client.clone();
        let url = self.url.clone();
        let media_type = self.media_type.clone();
        let in_flight = Arc::clone(&self.in_flight);

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = exchange(client, url, media_type, body).await;
            in_flight.store(false, Ordering::SeqCst);
            // The consumer may already be gone; completion is best-effort then.
            let _ = tx.send(outcome);
        });

        Ok(FlushHandle { rx })
    }

    /// Consume a pending exchange: wait for its completion, re-raise a
    /// captured failure, and install the response body as the read buffer.
    pub async fn end_flush(&mut self, handle: FlushHandle) -> Result<(), TransportError> {
        let body = handle.join().await?;
        self.rbuf = body;
        self.rpos = 0;
        self.has_response = true;
        Ok(())
    }
}

async fn exchange(
    client: reqwest::Client,
    url: Url,
    media_type: String,
    body: Vec<u8>,
) -> Result<Vec<u8>, TransportError> {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, &media_type)
        .header(ACCEPT, &media_type)
        .body(body)
        .send()
        .await
        .map_err(TransportError::from)?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::new(
            TransportErrorKind::Unknown,
            format!("server returned {status}"),
        ));
    }

    // Drain the body fully so the connection is released before reads begin.
    let bytes = response.bytes().await.map_err(TransportError::from)?;
    Ok(bytes.to_vec())
}

/// The single-use completion of one asynchronous flush.
///
/// Exactly one consumer observes it: either `join`/`end_flush` awaits it, or
/// `forward` hands the outcome to a callback.
#[derive(Debug)]
pub struct FlushHandle {
    rx: oneshot::Receiver<Result<Vec<u8>, TransportError>>,
}

impl FlushHandle {
    /// Wait for the exchange to complete and take its outcome.
    pub async fn join(self) -> Result<Vec<u8>, TransportError> {
        self.rx.await.map_err(|_| {
            TransportError::new(
                TransportErrorKind::Unknown,
                "exchange task ended without reporting completion",
            )
        })?
    }

    /// Deliver the outcome to `callback` once the exchange completes.
    pub fn forward<F>(self, callback: F)
    where
        F: FnOnce(Result<Vec<u8>, TransportError>) + Send + 'static,
    {
        tokio::spawn(async move {
            callback(self.join().await);
        });
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        // Connections are established per exchange.
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.wbuf.clear();
        self.rbuf.clear();
        self.rpos = 0;
        self.has_response = false;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.has_response {
            return Err(TransportError::new(
                TransportErrorKind::NotOpen,
                "no request has been sent",
            ));
        }
        if self.rpos >= self.rbuf.len() {
            return Err(TransportError::new(
                TransportErrorKind::EndOfFile,
                "no more data available",
            ));
        }
        let n = buf.len().min(self.rbuf.len() - self.rpos);
        buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
        self.rpos += n;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.wbuf.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let handle = self.begin_flush()?;
        self.end_flush(handle).await
    }

    async fn peek(&mut self) -> Result<bool, TransportError> {
        Ok(self.has_response && self.rpos < self.rbuf.len())
    }

    fn is_open(&self) -> bool {
        true
    }
}
