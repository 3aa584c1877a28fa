//! Concurrent server subsystem.
//!
//! # Data Flow
//! ```text
//! serve(): listen → pre_serve → accept loop
//!     accept → spawn one worker task per connection → keep accepting
//!
//! worker: raw halves
//!     → transport factories (buffering)
//!     → protocol factories (codec)
//!     → create_context
//!     → loop: peek → process_context → processor.process
//!     → delete_context → close both transports
//! ```
//!
//! # Design Decisions
//! - One worker task per connection; processing within a connection is
//!   strictly sequential, connections are concurrent.
//! - The stop flag is the sole cancellation mechanism. `stop()` closes the
//!   listening transport; in-flight workers drain naturally at their next
//!   iteration boundary.
//! - Failures are contained: a bad connection or a failed accept never takes
//!   the server down.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::protocol::{JsonProtocolFactory, Protocol, ProtocolFactory};
use crate::transport::{
    BufferedTransportFactory, ServerTransport, Transport, TransportFactory,
};

/// Global atomic counter for connection IDs. Relaxed ordering is enough
/// since only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one accepted connection, used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque per-connection value threaded through lifecycle notifications.
pub type ConnectionContext = Option<Box<dyn Any + Send + Sync>>;

/// External dispatcher: decodes one request from the input protocol, invokes
/// a handler, and encodes one response to the output protocol.
///
/// Returns `false` to signal the connection should close even though the
/// transport is still open.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        input: &mut dyn Protocol,
        output: &mut dyn Protocol,
    ) -> Result<bool, Error>;
}

/// Best-effort lifecycle notifications around the server and its
/// connections. All methods default to no-ops.
#[async_trait]
pub trait ServerEventHandler: Send + Sync {
    /// Fired once after the listener is ready, before any connection.
    async fn pre_serve(&self) {}

    /// Fired when a connection begins; the returned context is handed back
    /// unchanged to every later notification for this connection.
    async fn create_context(
        &self,
        _input: &mut dyn Protocol,
        _output: &mut dyn Protocol,
    ) -> ConnectionContext {
        None
    }

    /// Fired before each request on the connection. The request may still be
    /// minutes away, or never arrive at all.
    async fn process_context(&self, _context: &ConnectionContext, _input: &mut dyn Transport) {}

    /// Fired after the connection ends, before its transports close.
    async fn delete_context(
        &self,
        _context: ConnectionContext,
        _input: &mut dyn Protocol,
        _output: &mut dyn Protocol,
    ) {
    }
}

/// Task-per-connection RPC server.
///
/// `serve()` owns the accept loop; each accepted connection runs its
/// request/response loop on an independent task until the client disconnects,
/// the processor signals completion, or `stop()` is observed.
pub struct Server {
    processor: Arc<dyn Processor>,
    server_transport: Arc<dyn ServerTransport>,
    input_transport_factory: Arc<dyn TransportFactory>,
    output_transport_factory: Arc<dyn TransportFactory>,
    input_protocol_factory: Arc<dyn ProtocolFactory>,
    output_protocol_factory: Arc<dyn ProtocolFactory>,
    event_handler: Option<Arc<dyn ServerEventHandler>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    accept_failures: AtomicU64,
}

/// Builder for [`Server`]. Transport factories default to buffering, protocol
/// factories to the JSON codec.
pub struct ServerBuilder {
    processor: Arc<dyn Processor>,
    server_transport: Arc<dyn ServerTransport>,
    input_transport_factory: Arc<dyn TransportFactory>,
    output_transport_factory: Arc<dyn TransportFactory>,
    input_protocol_factory: Arc<dyn ProtocolFactory>,
    output_protocol_factory: Arc<dyn ProtocolFactory>,
    event_handler: Option<Arc<dyn ServerEventHandler>>,
}

impl ServerBuilder {
    pub fn new(processor: Arc<dyn Processor>, server_transport: Arc<dyn ServerTransport>) -> Self {
        Self {
            processor,
            server_transport,
            input_transport_factory: Arc::new(BufferedTransportFactory::new()),
            output_transport_factory: Arc::new(BufferedTransportFactory::new()),
            input_protocol_factory: Arc::new(JsonProtocolFactory::new()),
            output_protocol_factory: Arc::new(JsonProtocolFactory::new()),
            event_handler: None,
        }
    }

    pub fn transport_factories(
        mut self,
        input: Arc<dyn TransportFactory>,
        output: Arc<dyn TransportFactory>,
    ) -> Self {
        self.input_transport_factory = input;
        self.output_transport_factory = output;
        self
    }

    pub fn protocol_factories(
        mut self,
        input: Arc<dyn ProtocolFactory>,
        output: Arc<dyn ProtocolFactory>,
    ) -> Self {
        self.input_protocol_factory = input;
        self.output_protocol_factory = output;
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn ServerEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn build(self) -> Server {
        Server {
            processor: self.processor,
            server_transport: self.server_transport,
            input_transport_factory: self.input_transport_factory,
            output_transport_factory: self.output_transport_factory,
            input_protocol_factory: self.input_protocol_factory,
            output_protocol_factory: self.output_protocol_factory,
            event_handler: self.event_handler,
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            accept_failures: AtomicU64::new(0),
        }
    }
}

impl Server {
    pub fn builder(
        processor: Arc<dyn Processor>,
        server_transport: Arc<dyn ServerTransport>,
    ) -> ServerBuilder {
        ServerBuilder::new(processor, server_transport)
    }

    /// Accept connections until `stop()` is called.
    ///
    /// Returns an error only if listening cannot be established at all;
    /// isolated accept or connection failures are logged and contained.
    pub async fn serve(&self) -> Result<(), Error> {
        if let Err(e) = self.server_transport.listen().await {
            tracing::error!(error = %e, "could not listen on server transport");
            return Err(e.into());
        }

        if let Some(handler) = &self.event_handler {
            handler.pre_serve().await;
        }

        while !self.stop.load(Ordering::SeqCst) {
            match self.server_transport.accept().await {
                Ok((raw_input, raw_output)) => {
                    self.spawn_worker(raw_input, raw_output);
                }
                Err(e) => {
                    let expected_shutdown = self.stop.load(Ordering::SeqCst)
                        && e.kind() == crate::error::TransportErrorKind::Interrupted;
                    if !expected_shutdown {
                        // Counted for observability only; no backoff or abort
                        // threshold is attached to it.
                        let failures = self.accept_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::warn!(error = %e, failures, "accept failed");
                    }
                }
            }
        }

        if let Err(e) = self.server_transport.close() {
            tracing::warn!(error = %e, "server transport failed on close");
        }
        // Cleared only after shutdown completes so serve() can run again.
        self.stop.store(false, Ordering::SeqCst);
        tracing::info!("server stopped");
        Ok(())
    }

    /// Stop accepting connections and close the listening transport.
    ///
    /// In-flight workers are not terminated; they drain once their current
    /// request or peek completes.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.server_transport.close() {
            tracing::warn!(error = %e, "server transport failed on close");
        }
    }

    /// Accept failures observed since the server was built.
    pub fn accept_failures(&self) -> u64 {
        self.accept_failures.load(Ordering::Relaxed)
    }

    fn spawn_worker(&self, raw_input: Box<dyn Transport>, raw_output: Box<dyn Transport>) {
        let worker = ConnectionWorker {
            id: ConnectionId::new(),
            processor: Arc::clone(&self.processor),
            event_handler: self.event_handler.clone(),
            stop: Arc::clone(&self.stop),
        };
        let input = self.input_transport_factory.create(raw_input);
        let output = self.output_transport_factory.create(raw_output);
        let input = self.input_protocol_factory.create(input);
        let output = self.output_protocol_factory.create(output);
        tokio::spawn(worker.run(input, output));
    }
}

struct ConnectionWorker {
    id: ConnectionId,
    processor: Arc<dyn Processor>,
    event_handler: Option<Arc<dyn ServerEventHandler>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl ConnectionWorker {
    /// Process requests on one connection until it ends.
    async fn run(self, mut input: Box<dyn Protocol>, mut output: Box<dyn Protocol>) {
        tracing::debug!(connection = %self.id, "connection worker started");

        let mut context: ConnectionContext = None;
        if let Some(handler) = &self.event_handler {
            context = handler.create_context(&mut *input, &mut *output).await;
        }

        let outcome = self
            .process_until_done(&mut *input, &mut *output, &context)
            .await;

        match outcome {
            Ok(requests) => {
                tracing::debug!(connection = %self.id, requests, "connection closed");
            }
            Err(e) if e.as_transport().is_some_and(|t| t.is_disconnect()) => {
                // Usually the client hanging up between requests; expected.
                tracing::debug!(connection = %self.id, error = %e, "connection ended by transport");
            }
            Err(e) => {
                tracing::error!(connection = %self.id, error = %e, "connection worker failed");
            }
        }

        if let Some(handler) = &self.event_handler {
            handler
                .delete_context(context, &mut *input, &mut *output)
                .await;
        }

        if let Err(e) = input.transport_mut().close().await {
            tracing::debug!(connection = %self.id, error = %e, "input transport close failed");
        }
        if let Err(e) = output.transport_mut().close().await {
            tracing::debug!(connection = %self.id, error = %e, "output transport close failed");
        }
    }

    async fn process_until_done(
        &self,
        input: &mut dyn Protocol,
        output: &mut dyn Protocol,
        context: &ConnectionContext,
    ) -> Result<u64, Error> {
        let mut requests = 0u64;
        while !self.stop.load(Ordering::SeqCst) {
            if !input.transport_mut().peek().await? {
                break;
            }
            if let Some(handler) = &self.event_handler {
                handler.process_context(context, input.transport_mut()).await;
            }
            if !self.processor.process(input, output).await? {
                break;
            }
            requests += 1;
        }
        Ok(requests)
    }
}
