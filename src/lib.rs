//! Runtime core for a cross-language RPC stack.
//!
//! # Architecture Overview
//!
//! ```text
//!  Client                                   Server
//!  ──────                                   ──────
//!  Protocol (JSON codec)                    TcpServerTransport.accept()
//!      │ typed values + markers                 │ one task per connection
//!      ▼                                        ▼
//!  Transport (tcp / http / memory)          transport factories → protocols
//!      │ flush = one exchange                   │ peek → Processor.process
//!      ▼                                        ▼
//!  bytes on the wire  ────────────────────► request / response loop
//! ```
//!
//! Generated service code sits on top: a `Processor` decodes a method name
//! and arguments through the input protocol, dispatches to a handler, and
//! encodes the result through the output protocol. This crate supplies the
//! transports, the self-describing JSON codec, and the concurrent server
//! loop that composes them.

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod transport;

pub use config::RpcConfig;
pub use error::{Error, ProtocolError, TransportError, TransportErrorKind};
pub use protocol::{JsonProtocol, JsonProtocolFactory, Protocol, ProtocolFactory};
pub use server::{Processor, Server, ServerEventHandler};
pub use transport::{
    HttpTransport, HttpTransportBuilder, ServerTransport, TcpServerTransport, TcpTransport,
    Transport, TransportFactory,
};
