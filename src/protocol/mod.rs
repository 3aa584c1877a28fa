//! Structured protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Typed values + structural markers
//!     → Protocol (self-describing codec)
//!     → Transport (raw bytes)
//!
//! A request/response exchange:
//!     read_message_begin → read request struct → read_message_end
//!     write_message_begin → write result struct → write_message_end → flush
//! ```
//!
//! # Design Decisions
//! - One input and one output protocol instance exist per connection, each
//!   bound 1:1 to a transport it owns.
//! - Protocols carry only transient per-call state (the recursion depth
//!   counter); they are not reentrant and never shared across workers.
//! - Any encoded value can be skipped without being materialized, so decoders
//!   survive unknown fields and type tags.

use async_trait::async_trait;

use crate::error::ProtocolError;
use crate::transport::Transport;

pub mod json;

pub use json::{JsonProtocol, JsonProtocolFactory};

/// Self-describing type tag carried on the wire for every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Stop,
    Bool,
    I8,
    I16,
    I32,
    I64,
    Double,
    Binary,
    Struct,
    Map,
    Set,
    List,
}

/// Kind of a top-level message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Call,
    Reply,
    Exception,
    Oneway,
}

impl MessageKind {
    pub fn id(self) -> i32 {
        match self {
            MessageKind::Call => 1,
            MessageKind::Reply => 2,
            MessageKind::Exception => 3,
            MessageKind::Oneway => 4,
        }
    }

    pub fn from_id(id: i32) -> Result<Self, ProtocolError> {
        match id {
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Exception),
            4 => Ok(MessageKind::Oneway),
            other => Err(ProtocolError::invalid(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

/// Envelope of one request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub kind: MessageKind,
    pub sequence: i32,
}

/// Header of one struct field. A `wire_type` of `Stop` marks the end of the
/// enclosing struct; `id` is meaningless then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub wire_type: WireType,
    pub id: i16,
}

impl FieldHeader {
    pub const STOP: FieldHeader = FieldHeader {
        wire_type: WireType::Stop,
        id: 0,
    };

    pub fn is_stop(&self) -> bool {
        self.wire_type == WireType::Stop
    }
}

/// Header of an encoded map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub key_type: WireType,
    pub value_type: WireType,
    pub size: usize,
}

/// Header of an encoded list or set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    pub element_type: WireType,
    pub size: usize,
}

/// Typed codec over one owned transport.
///
/// Implementations pair every `*_begin` read that can recurse with a depth
/// check, so malformed input fails with `ProtocolError::DepthLimit` instead
/// of exhausting the call stack.
#[async_trait]
pub trait Protocol: Send {
    async fn write_message_begin(&mut self, header: &MessageHeader) -> Result<(), ProtocolError>;
    async fn write_message_end(&mut self) -> Result<(), ProtocolError>;
    async fn write_struct_begin(&mut self, name: &str) -> Result<(), ProtocolError>;
    async fn write_struct_end(&mut self) -> Result<(), ProtocolError>;
    async fn write_field_begin(&mut self, header: &FieldHeader) -> Result<(), ProtocolError>;
    async fn write_field_end(&mut self) -> Result<(), ProtocolError>;
    async fn write_field_stop(&mut self) -> Result<(), ProtocolError>;
    async fn write_map_begin(&mut self, header: &MapHeader) -> Result<(), ProtocolError>;
    async fn write_map_end(&mut self) -> Result<(), ProtocolError>;
    async fn write_list_begin(&mut self, header: &ListHeader) -> Result<(), ProtocolError>;
    async fn write_list_end(&mut self) -> Result<(), ProtocolError>;
    async fn write_set_begin(&mut self, header: &ListHeader) -> Result<(), ProtocolError>;
    async fn write_set_end(&mut self) -> Result<(), ProtocolError>;
    async fn write_bool(&mut self, value: bool) -> Result<(), ProtocolError>;
    async fn write_i8(&mut self, value: i8) -> Result<(), ProtocolError>;
    async fn write_i16(&mut self, value: i16) -> Result<(), ProtocolError>;
    async fn write_i32(&mut self, value: i32) -> Result<(), ProtocolError>;
    async fn write_i64(&mut self, value: i64) -> Result<(), ProtocolError>;
    async fn write_double(&mut self, value: f64) -> Result<(), ProtocolError>;
    async fn write_string(&mut self, value: &str) -> Result<(), ProtocolError>;
    async fn write_binary(&mut self, value: &[u8]) -> Result<(), ProtocolError>;

    async fn read_message_begin(&mut self) -> Result<MessageHeader, ProtocolError>;
    async fn read_message_end(&mut self) -> Result<(), ProtocolError>;
    async fn read_struct_begin(&mut self) -> Result<(), ProtocolError>;
    async fn read_struct_end(&mut self) -> Result<(), ProtocolError>;
    async fn read_field_begin(&mut self) -> Result<FieldHeader, ProtocolError>;
    async fn read_field_end(&mut self) -> Result<(), ProtocolError>;
    async fn read_map_begin(&mut self) -> Result<MapHeader, ProtocolError>;
    async fn read_map_end(&mut self) -> Result<(), ProtocolError>;
    async fn read_list_begin(&mut self) -> Result<ListHeader, ProtocolError>;
    async fn read_list_end(&mut self) -> Result<(), ProtocolError>;
    async fn read_set_begin(&mut self) -> Result<ListHeader, ProtocolError>;
    async fn read_set_end(&mut self) -> Result<(), ProtocolError>;
    async fn read_bool(&mut self) -> Result<bool, ProtocolError>;
    async fn read_i8(&mut self) -> Result<i8, ProtocolError>;
    async fn read_i16(&mut self) -> Result<i16, ProtocolError>;
    async fn read_i32(&mut self) -> Result<i32, ProtocolError>;
    async fn read_i64(&mut self) -> Result<i64, ProtocolError>;
    async fn read_double(&mut self) -> Result<f64, ProtocolError>;
    async fn read_string(&mut self) -> Result<String, ProtocolError>;
    async fn read_binary(&mut self) -> Result<Vec<u8>, ProtocolError>;

    /// Commit everything written so far as one message exchange.
    async fn flush(&mut self) -> Result<(), ProtocolError>;

    /// The transport this protocol is bound to. The server loop peeks it
    /// between requests to detect client-initiated disconnect.
    fn transport_mut(&mut self) -> &mut dyn Transport;

    /// Skip one encoded value of the given type without materializing it,
    /// leaving the stream positioned after it.
    async fn skip(&mut self, wire_type: WireType) -> Result<(), ProtocolError> {
        match wire_type {
            WireType::Bool => self.read_bool().await.map(|_| ()),
            WireType::I8 => self.read_i8().await.map(|_| ()),
            WireType::I16 => self.read_i16().await.map(|_| ()),
            WireType::I32 => self.read_i32().await.map(|_| ()),
            WireType::I64 => self.read_i64().await.map(|_| ()),
            WireType::Double => self.read_double().await.map(|_| ()),
            WireType::Binary => self.read_binary().await.map(|_| ()),
            WireType::Struct => {
                self.read_struct_begin().await?;
                loop {
                    let field = self.read_field_begin().await?;
                    if field.is_stop() {
                        break;
                    }
                    self.skip(field.wire_type).await?;
                    self.read_field_end().await?;
                }
                self.read_struct_end().await
            }
            WireType::Map => {
                let header = self.read_map_begin().await?;
                for _ in 0..header.size {
                    self.skip(header.key_type).await?;
                    self.skip(header.value_type).await?;
                }
                self.read_map_end().await
            }
            WireType::List => {
                let header = self.read_list_begin().await?;
                for _ in 0..header.size {
                    self.skip(header.element_type).await?;
                }
                self.read_list_end().await
            }
            WireType::Set => {
                let header = self.read_set_begin().await?;
                for _ in 0..header.size {
                    self.skip(header.element_type).await?;
                }
                self.read_set_end().await
            }
            WireType::Stop => Err(ProtocolError::invalid("cannot skip a stop marker")),
        }
    }
}

/// Creates protocol instances bound to transports.
pub trait ProtocolFactory: Send + Sync {
    fn create(&self, transport: Box<dyn Transport>) -> Box<dyn Protocol>;
}
