//! Self-describing JSON wire codec.
//!
//! The encoding is text over any transport: a message is
//! `[1,"name",kind,sequence]` followed by its payload, a struct is an object
//! keyed by decimal field id whose values are one-pair objects
//! `{"<type-name>": value}`, a map is `[ktype,vtype,size,{...}]`, and a
//! list or set is `[etype,size,...]`.
//!
//! # Design Decisions
//! - Strings escape `"`, `\`, control bytes, and every non-ASCII scalar as
//!   `\uXXXX` (surrogate pairs above U+FFFF); decoding reconstructs the
//!   original scalar from a well-formed pair and also accepts raw UTF-8.
//! - Binary payloads are base64 without padding, so a buffer of any length
//!   round-trips exactly and decoding never reads past the closing quote.
//! - A per-instance depth counter bounds structural recursion on the read
//!   side; crossing the limit fails with `ProtocolError::DepthLimit`.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

use async_trait::async_trait;

use crate::error::{ProtocolError, TransportErrorKind};
use crate::protocol::{
    FieldHeader, ListHeader, MapHeader, MessageHeader, MessageKind, Protocol, ProtocolFactory,
    WireType,
};
use crate::transport::Transport;

const JSON_PROTOCOL_VERSION: i64 = 1;
pub const DEFAULT_DEPTH_LIMIT: usize = 64;

const QUOTE: u8 = b'"';
const BACKSLASH: u8 = b'\\';
const LBRACE: u8 = b'{';
const RBRACE: u8 = b'}';
const LBRACKET: u8 = b'[';
const RBRACKET: u8 = b']';
const COMMA: u8 = b',';
const COLON: u8 = b':';

fn type_name(wire_type: WireType) -> Result<&'static str, ProtocolError> {
    match wire_type {
        WireType::Bool => Ok("tf"),
        WireType::I8 => Ok("i8"),
        WireType::I16 => Ok("i16"),
        WireType::I32 => Ok("i32"),
        WireType::I64 => Ok("i64"),
        WireType::Double => Ok("dbl"),
        WireType::Binary => Ok("str"),
        WireType::Struct => Ok("rec"),
        WireType::Map => Ok("map"),
        WireType::List => Ok("lst"),
        WireType::Set => Ok("set"),
        WireType::Stop => Err(ProtocolError::Unsupported(
            "stop marker has no type name".to_string(),
        )),
    }
}

fn type_from_name(name: &[u8]) -> Result<WireType, ProtocolError> {
    match name {
        b"tf" => Ok(WireType::Bool),
        b"i8" => Ok(WireType::I8),
        b"i16" => Ok(WireType::I16),
        b"i32" => Ok(WireType::I32),
        b"i64" => Ok(WireType::I64),
        b"dbl" => Ok(WireType::Double),
        b"str" => Ok(WireType::Binary),
        b"rec" => Ok(WireType::Struct),
        b"map" => Ok(WireType::Map),
        b"lst" => Ok(WireType::List),
        b"set" => Ok(WireType::Set),
        other => Err(ProtocolError::invalid(format!(
            "unknown type name {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn is_json_numeric(byte: u8) -> bool {
    matches!(byte, b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E')
}

fn hex_digit(byte: u8) -> Result<u16, ProtocolError> {
    match byte {
        b'0'..=b'9' => Ok(u16::from(byte - b'0')),
        b'a'..=b'f' => Ok(u16::from(byte - b'a' + 10)),
        b'A'..=b'F' => Ok(u16::from(byte - b'A' + 10)),
        other => Err(ProtocolError::invalid(format!(
            "expected a hex digit, found {:?}",
            other as char
        ))),
    }
}

fn push_unicode_escape(out: &mut Vec<u8>, unit: u16) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.extend_from_slice(b"\\u");
    out.push(HEX[usize::from((unit >> 12) & 0xf)]);
    out.push(HEX[usize::from((unit >> 8) & 0xf)]);
    out.push(HEX[usize::from((unit >> 4) & 0xf)]);
    out.push(HEX[usize::from(unit & 0xf)]);
}

fn encode_json_char(ch: char, out: &mut Vec<u8>) {
    match ch {
        '"' => out.extend_from_slice(b"\\\""),
        '\\' => out.extend_from_slice(b"\\\\"),
        '\u{8}' => out.extend_from_slice(b"\\b"),
        '\u{c}' => out.extend_from_slice(b"\\f"),
        '\n' => out.extend_from_slice(b"\\n"),
        '\r' => out.extend_from_slice(b"\\r"),
        '\t' => out.extend_from_slice(b"\\t"),
        c if (0x20..0x7f).contains(&(c as u32)) => out.push(c as u8),
        c => {
            let value = c as u32;
            if value > 0xffff {
                let value = value - 0x10000;
                push_unicode_escape(out, 0xd800 + (value >> 10) as u16);
                push_unicode_escape(out, 0xdc00 + (value & 0x3ff) as u16);
            } else {
                push_unicode_escape(out, value as u16);
            }
        }
    }
}

/// Separator state for one nesting level of the encoding.
#[derive(Debug, Clone, Copy)]
enum Context {
    Base,
    List { first: bool },
    Pair { first: bool, colon: bool },
}

impl Context {
    fn pair() -> Self {
        Context::Pair {
            first: true,
            colon: true,
        }
    }

    fn list() -> Self {
        Context::List { first: true }
    }

    /// Advance the state machine and return the separator byte to emit or
    /// expect, if any.
    fn step(&mut self) -> Option<u8> {
        match self {
            Context::Base => None,
            Context::List { first } => {
                if *first {
                    *first = false;
                    None
                } else {
                    Some(COMMA)
                }
            }
            Context::Pair { first, colon } => {
                if *first {
                    *first = false;
                    *colon = true;
                    None
                } else {
                    let sep = if *colon { COLON } else { COMMA };
                    *colon = !*colon;
                    Some(sep)
                }
            }
        }
    }

    /// Whether a number written or read next sits in key position and must
    /// therefore be quoted.
    fn escapes_numbers(&self) -> bool {
        matches!(self, Context::Pair { colon: true, .. })
    }
}

/// JSON codec over one owned transport.
pub struct JsonProtocol {
    transport: Box<dyn Transport>,
    write_ctx: Context,
    write_stack: Vec<Context>,
    read_ctx: Context,
    read_stack: Vec<Context>,
    lookahead: Option<u8>,
    depth: usize,
    depth_limit: usize,
}

impl JsonProtocol {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_depth_limit(transport, DEFAULT_DEPTH_LIMIT)
    }

    pub fn with_depth_limit(transport: Box<dyn Transport>, depth_limit: usize) -> Self {
        Self {
            transport,
            write_ctx: Context::Base,
            write_stack: Vec::new(),
            read_ctx: Context::Base,
            read_stack: Vec::new(),
            lookahead: None,
            depth: 0,
            depth_limit: depth_limit.max(1),
        }
    }

    fn push_write_context(&mut self, ctx: Context) {
        self.write_stack
            .push(std::mem::replace(&mut self.write_ctx, ctx));
    }

    fn pop_write_context(&mut self) {
        self.write_ctx = self.write_stack.pop().unwrap_or(Context::Base);
    }

    fn push_read_context(&mut self, ctx: Context) {
        self.read_stack
            .push(std::mem::replace(&mut self.read_ctx, ctx));
    }

    fn pop_read_context(&mut self) {
        self.read_ctx = self.read_stack.pop().unwrap_or(Context::Base);
    }

    fn enter_nesting(&mut self) -> Result<(), ProtocolError> {
        if self.depth >= self.depth_limit {
            return Err(ProtocolError::DepthLimit(self.depth_limit));
        }
        self.depth += 1;
        Ok(())
    }

    fn leave_nesting(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // ---- raw byte access with one-byte lookahead -------------------------

    async fn read_raw_byte(&mut self) -> Result<u8, ProtocolError> {
        if let Some(byte) = self.lookahead.take() {
            return Ok(byte);
        }
        let mut byte = [0u8; 1];
        self.transport.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    async fn peek_raw_byte(&mut self) -> Result<u8, ProtocolError> {
        if let Some(byte) = self.lookahead {
            return Ok(byte);
        }
        let mut byte = [0u8; 1];
        self.transport.read_exact(&mut byte).await?;
        self.lookahead = Some(byte[0]);
        Ok(byte[0])
    }

    async fn expect_byte(&mut self, expected: u8) -> Result<(), ProtocolError> {
        let found = self.read_raw_byte().await?;
        if found != expected {
            return Err(ProtocolError::invalid(format!(
                "expected {:?}, found {:?}",
                expected as char, found as char
            )));
        }
        Ok(())
    }

    // ---- separators ------------------------------------------------------

    async fn write_separator(&mut self) -> Result<(), ProtocolError> {
        if let Some(sep) = self.write_ctx.step() {
            self.transport.write(&[sep]).await?;
        }
        Ok(())
    }

    async fn read_separator(&mut self) -> Result<(), ProtocolError> {
        if let Some(sep) = self.read_ctx.step() {
            self.expect_byte(sep).await?;
        }
        Ok(())
    }

    // ---- composite tokens ------------------------------------------------

    async fn write_json_object_begin(&mut self) -> Result<(), ProtocolError> {
        self.write_separator().await?;
        self.transport.write(&[LBRACE]).await?;
        self.push_write_context(Context::pair());
        Ok(())
    }

    async fn write_json_object_end(&mut self) -> Result<(), ProtocolError> {
        self.pop_write_context();
        self.transport.write(&[RBRACE]).await?;
        Ok(())
    }

    async fn write_json_array_begin(&mut self) -> Result<(), ProtocolError> {
        self.write_separator().await?;
        self.transport.write(&[LBRACKET]).await?;
        self.push_write_context(Context::list());
        Ok(())
    }

    async fn write_json_array_end(&mut self) -> Result<(), ProtocolError> {
        self.pop_write_context();
        self.transport.write(&[RBRACKET]).await?;
        Ok(())
    }

    async fn read_json_object_begin(&mut self) -> Result<(), ProtocolError> {
        self.read_separator().await?;
        self.expect_byte(LBRACE).await?;
        self.push_read_context(Context::pair());
        Ok(())
    }

    async fn read_json_object_end(&mut self) -> Result<(), ProtocolError> {
        self.expect_byte(RBRACE).await?;
        self.pop_read_context();
        Ok(())
    }

    async fn read_json_array_begin(&mut self) -> Result<(), ProtocolError> {
        self.read_separator().await?;
        self.expect_byte(LBRACKET).await?;
        self.push_read_context(Context::list());
        Ok(())
    }

    async fn read_json_array_end(&mut self) -> Result<(), ProtocolError> {
        self.expect_byte(RBRACKET).await?;
        self.pop_read_context();
        Ok(())
    }

    // ---- scalar tokens ---------------------------------------------------

    async fn write_json_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.write_separator().await?;
        let mut out = Vec::with_capacity(value.len() + 2);
        out.push(QUOTE);
        for ch in value.chars() {
            encode_json_char(ch, &mut out);
        }
        out.push(QUOTE);
        self.transport.write(&out).await?;
        Ok(())
    }

    async fn write_json_base64(&mut self, value: &[u8]) -> Result<(), ProtocolError> {
        self.write_separator().await?;
        let mut out = Vec::with_capacity(value.len() * 4 / 3 + 4);
        out.push(QUOTE);
        out.extend_from_slice(STANDARD_NO_PAD.encode(value).as_bytes());
        out.push(QUOTE);
        self.transport.write(&out).await?;
        Ok(())
    }

    async fn write_json_integer(&mut self, value: i64) -> Result<(), ProtocolError> {
        self.write_separator().await?;
        let quoted = self.write_ctx.escapes_numbers();
        let mut out = Vec::with_capacity(24);
        if quoted {
            out.push(QUOTE);
        }
        out.extend_from_slice(value.to_string().as_bytes());
        if quoted {
            out.push(QUOTE);
        }
        self.transport.write(&out).await?;
        Ok(())
    }

    async fn write_json_double(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.write_separator().await?;
        let (text, special) = if value.is_nan() {
            ("NaN".to_string(), true)
        } else if value.is_infinite() {
            if value > 0.0 {
                ("Infinity".to_string(), true)
            } else {
                ("-Infinity".to_string(), true)
            }
        } else {
            (value.to_string(), false)
        };
        let quoted = special || self.write_ctx.escapes_numbers();
        let mut out = Vec::with_capacity(text.len() + 2);
        if quoted {
            out.push(QUOTE);
        }
        out.extend_from_slice(text.as_bytes());
        if quoted {
            out.push(QUOTE);
        }
        self.transport.write(&out).await?;
        Ok(())
    }

    /// Read a quoted string into its decoded bytes. Escapes become the bytes
    /// they denote; `\uXXXX` sequences (surrogate pairs included) become the
    /// UTF-8 encoding of the designated scalar value.
    async fn read_json_string_bytes(
        &mut self,
        skip_separator: bool,
    ) -> Result<Vec<u8>, ProtocolError> {
        if !skip_separator {
            self.read_separator().await?;
        }
        self.expect_byte(QUOTE).await?;
        let mut out = Vec::new();
        loop {
            let byte = self.read_raw_byte().await?;
            if byte == QUOTE {
                break;
            }
            if byte != BACKSLASH {
                out.push(byte);
                continue;
            }
            let escape = self.read_raw_byte().await?;
            if escape == b'u' {
                let unit = self.read_hex_unit().await?;
                let scalar = match unit {
                    0xd800..=0xdbff => {
                        // High surrogate: the low half must follow.
                        self.expect_byte(BACKSLASH).await?;
                        self.expect_byte(b'u').await?;
                        let low = self.read_hex_unit().await?;
                        if !(0xdc00..=0xdfff).contains(&low) {
                            return Err(ProtocolError::invalid(
                                "expected a low surrogate after a high surrogate",
                            ));
                        }
                        0x10000
                            + ((u32::from(unit) - 0xd800) << 10)
                            + (u32::from(low) - 0xdc00)
                    }
                    0xdc00..=0xdfff => {
                        return Err(ProtocolError::invalid(
                            "unexpected low surrogate with no high surrogate",
                        ));
                    }
                    other => u32::from(other),
                };
                let ch = char::from_u32(scalar).ok_or_else(|| {
                    ProtocolError::invalid(format!("escape denotes invalid scalar {scalar:#x}"))
                })?;
                let mut utf8 = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
            } else {
                let decoded = match escape {
                    b'"' => b'"',
                    b'\\' => b'\\',
                    b'/' => b'/',
                    b'b' => 0x08,
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    other => {
                        return Err(ProtocolError::invalid(format!(
                            "unknown escape character {:?}",
                            other as char
                        )));
                    }
                };
                out.push(decoded);
            }
        }
        Ok(out)
    }

    async fn read_hex_unit(&mut self) -> Result<u16, ProtocolError> {
        let mut unit = 0u16;
        for _ in 0..4 {
            let byte = self.read_raw_byte().await?;
            unit = (unit << 4) | hex_digit(byte)?;
        }
        Ok(unit)
    }

    /// Consume the longest run of numeric characters. End-of-stream inside a
    /// top-level number terminates the token instead of failing.
    async fn read_numeric_token(&mut self) -> Result<String, ProtocolError> {
        let mut token = String::new();
        loop {
            match self.peek_raw_byte().await {
                Ok(byte) if is_json_numeric(byte) => {
                    self.lookahead = None;
                    token.push(byte as char);
                }
                Ok(_) => break,
                Err(ProtocolError::Transport(ref e))
                    if e.kind() == TransportErrorKind::EndOfFile && !token.is_empty() =>
                {
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if token.is_empty() {
            return Err(ProtocolError::invalid("expected a numeric literal"));
        }
        Ok(token)
    }

    async fn read_json_integer(&mut self) -> Result<i64, ProtocolError> {
        self.read_separator().await?;
        let quoted = self.read_ctx.escapes_numbers();
        if quoted {
            self.expect_byte(QUOTE).await?;
        }
        let token = self.read_numeric_token().await?;
        if quoted {
            self.expect_byte(QUOTE).await?;
        }
        token
            .parse::<i64>()
            .map_err(|_| ProtocolError::invalid(format!("invalid integer literal {token:?}")))
    }

    async fn read_json_double(&mut self) -> Result<f64, ProtocolError> {
        self.read_separator().await?;
        let quoted_context = self.read_ctx.escapes_numbers();
        if self.peek_raw_byte().await? == QUOTE {
            let bytes = self.read_json_string_bytes(true).await?;
            let text = String::from_utf8(bytes)
                .map_err(|_| ProtocolError::invalid("double literal is not valid UTF-8"))?;
            let value = match text.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other.parse::<f64>().map_err(|_| {
                    ProtocolError::invalid(format!("invalid double literal {other:?}"))
                })?,
            };
            if !quoted_context && value.is_finite() {
                return Err(ProtocolError::invalid(
                    "numeric data unexpectedly quoted in this context",
                ));
            }
            Ok(value)
        } else {
            if quoted_context {
                return Err(ProtocolError::invalid(
                    "expected a quoted number in key position",
                ));
            }
            let token = self.read_numeric_token().await?;
            token
                .parse::<f64>()
                .map_err(|_| ProtocolError::invalid(format!("invalid double literal {token:?}")))
        }
    }

    async fn read_json_base64(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = self.read_json_string_bytes(false).await?;
        // Padding is optional on the wire; strip it before decoding.
        while bytes.last() == Some(&b'=') {
            bytes.pop();
        }
        STANDARD_NO_PAD
            .decode(&bytes)
            .map_err(|e| ProtocolError::invalid(format!("invalid base64 payload: {e}")))
    }

    async fn read_collection_header(&mut self) -> Result<ListHeader, ProtocolError> {
        self.read_json_array_begin().await?;
        let name = self.read_json_string_bytes(false).await?;
        let element_type = type_from_name(&name)?;
        let size = self.read_json_integer().await?;
        let size = usize::try_from(size)
            .map_err(|_| ProtocolError::invalid("negative collection size"))?;
        Ok(ListHeader { element_type, size })
    }
}

#[async_trait]
impl Protocol for JsonProtocol {
    async fn write_message_begin(&mut self, header: &MessageHeader) -> Result<(), ProtocolError> {
        self.write_json_array_begin().await?;
        self.write_json_integer(JSON_PROTOCOL_VERSION).await?;
        self.write_json_string(&header.name).await?;
        self.write_json_integer(i64::from(header.kind.id())).await?;
        self.write_json_integer(i64::from(header.sequence)).await?;
        Ok(())
    }

    async fn write_message_end(&mut self) -> Result<(), ProtocolError> {
        self.write_json_array_end().await
    }

    async fn write_struct_begin(&mut self, _name: &str) -> Result<(), ProtocolError> {
        self.write_json_object_begin().await
    }

    async fn write_struct_end(&mut self) -> Result<(), ProtocolError> {
        self.write_json_object_end().await
    }

    async fn write_field_begin(&mut self, header: &FieldHeader) -> Result<(), ProtocolError> {
        self.write_json_integer(i64::from(header.id)).await?;
        self.write_json_object_begin().await?;
        self.write_json_string(type_name(header.wire_type)?).await
    }

    async fn write_field_end(&mut self) -> Result<(), ProtocolError> {
        self.write_json_object_end().await
    }

    async fn write_field_stop(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn write_map_begin(&mut self, header: &MapHeader) -> Result<(), ProtocolError> {
        self.write_json_array_begin().await?;
        self.write_json_string(type_name(header.key_type)?).await?;
        self.write_json_string(type_name(header.value_type)?).await?;
        self.write_json_integer(header.size as i64).await?;
        self.write_json_object_begin().await
    }

    async fn write_map_end(&mut self) -> Result<(), ProtocolError> {
        self.write_json_object_end().await?;
        self.write_json_array_end().await
    }

    async fn write_list_begin(&mut self, header: &ListHeader) -> Result<(), ProtocolError> {
        self.write_json_array_begin().await?;
        self.write_json_string(type_name(header.element_type)?)
            .await?;
        self.write_json_integer(header.size as i64).await
    }

    async fn write_list_end(&mut self) -> Result<(), ProtocolError> {
        self.write_json_array_end().await
    }

    async fn write_set_begin(&mut self, header: &ListHeader) -> Result<(), ProtocolError> {
        self.write_list_begin(header).await
    }

    async fn write_set_end(&mut self) -> Result<(), ProtocolError> {
        self.write_list_end().await
    }

    async fn write_bool(&mut self, value: bool) -> Result<(), ProtocolError> {
        self.write_json_integer(if value { 1 } else { 0 }).await
    }

    async fn write_i8(&mut self, value: i8) -> Result<(), ProtocolError> {
        self.write_json_integer(i64::from(value)).await
    }

    async fn write_i16(&mut self, value: i16) -> Result<(), ProtocolError> {
        self.write_json_integer(i64::from(value)).await
    }

    async fn write_i32(&mut self, value: i32) -> Result<(), ProtocolError> {
        self.write_json_integer(i64::from(value)).await
    }

    async fn write_i64(&mut self, value: i64) -> Result<(), ProtocolError> {
        self.write_json_integer(value).await
    }

    async fn write_double(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.write_json_double(value).await
    }

    async fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.write_json_string(value).await
    }

    async fn write_binary(&mut self, value: &[u8]) -> Result<(), ProtocolError> {
        self.write_json_base64(value).await
    }

    async fn read_message_begin(&mut self) -> Result<MessageHeader, ProtocolError> {
        self.depth = 0;
        self.read_json_array_begin().await?;
        let version = self.read_json_integer().await?;
        if version != JSON_PROTOCOL_VERSION {
            return Err(ProtocolError::Unsupported(format!(
                "protocol version {version}"
            )));
        }
        let name_bytes = self.read_json_string_bytes(false).await?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| ProtocolError::invalid("message name is not valid UTF-8"))?;
        let kind = MessageKind::from_id(self.read_json_integer().await? as i32)?;
        let sequence = self.read_json_integer().await? as i32;
        Ok(MessageHeader {
            name,
            kind,
            sequence,
        })
    }

    async fn read_message_end(&mut self) -> Result<(), ProtocolError> {
        self.read_json_array_end().await
    }

    async fn read_struct_begin(&mut self) -> Result<(), ProtocolError> {
        self.enter_nesting()?;
        match self.read_json_object_begin().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.leave_nesting();
                Err(e)
            }
        }
    }

    async fn read_struct_end(&mut self) -> Result<(), ProtocolError> {
        let result = self.read_json_object_end().await;
        self.leave_nesting();
        result
    }

    async fn read_field_begin(&mut self) -> Result<FieldHeader, ProtocolError> {
        if self.peek_raw_byte().await? == RBRACE {
            return Ok(FieldHeader::STOP);
        }
        let id = self.read_json_integer().await?;
        let id = i16::try_from(id)
            .map_err(|_| ProtocolError::invalid(format!("field id {id} out of range")))?;
        self.read_json_object_begin().await?;
        let name = self.read_json_string_bytes(false).await?;
        let wire_type = type_from_name(&name)?;
        Ok(FieldHeader { wire_type, id })
    }

    async fn read_field_end(&mut self) -> Result<(), ProtocolError> {
        self.read_json_object_end().await
    }

    async fn read_map_begin(&mut self) -> Result<MapHeader, ProtocolError> {
        self.enter_nesting()?;
        let header = async {
            self.read_json_array_begin().await?;
            let key_type = type_from_name(&self.read_json_string_bytes(false).await?)?;
            let value_type = type_from_name(&self.read_json_string_bytes(false).await?)?;
            let size = self.read_json_integer().await?;
            let size = usize::try_from(size)
                .map_err(|_| ProtocolError::invalid("negative collection size"))?;
            self.read_json_object_begin().await?;
            Ok(MapHeader {
                key_type,
                value_type,
                size,
            })
        }
        .await;
        match header {
            Ok(header) => Ok(header),
            Err(e) => {
                self.leave_nesting();
                Err(e)
            }
        }
    }

    async fn read_map_end(&mut self) -> Result<(), ProtocolError> {
        let result = match self.read_json_object_end().await {
            Ok(()) => self.read_json_array_end().await,
            Err(e) => Err(e),
        };
        self.leave_nesting();
        result
    }

    async fn read_list_begin(&mut self) -> Result<ListHeader, ProtocolError> {
        self.enter_nesting()?;
        match self.read_collection_header().await {
            Ok(header) => Ok(header),
            Err(e) => {
                self.leave_nesting();
                Err(e)
            }
        }
    }

    async fn read_list_end(&mut self) -> Result<(), ProtocolError> {
        let result = self.read_json_array_end().await;
        self.leave_nesting();
        result
    }

    async fn read_set_begin(&mut self) -> Result<ListHeader, ProtocolError> {
        self.read_list_begin().await
    }

    async fn read_set_end(&mut self) -> Result<(), ProtocolError> {
        self.read_list_end().await
    }

    async fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_json_integer().await? != 0)
    }

    async fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        let value = self.read_json_integer().await?;
        i8::try_from(value)
            .map_err(|_| ProtocolError::invalid(format!("value {value} out of range for i8")))
    }

    async fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        let value = self.read_json_integer().await?;
        i16::try_from(value)
            .map_err(|_| ProtocolError::invalid(format!("value {value} out of range for i16")))
    }

    async fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let value = self.read_json_integer().await?;
        i32::try_from(value)
            .map_err(|_| ProtocolError::invalid(format!("value {value} out of range for i32")))
    }

    async fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        self.read_json_integer().await
    }

    async fn read_double(&mut self) -> Result<f64, ProtocolError> {
        self.read_json_double().await
    }

    async fn read_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_json_string_bytes(false).await?;
        String::from_utf8(bytes)
            .map_err(|_| ProtocolError::invalid("string payload is not valid UTF-8"))
    }

    async fn read_binary(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.read_json_base64().await
    }

    async fn flush(&mut self) -> Result<(), ProtocolError> {
        self.transport.flush().await.map_err(ProtocolError::from)
    }

    fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut *self.transport
    }
}

/// The default protocol factory.
pub struct JsonProtocolFactory {
    depth_limit: usize,
}

impl JsonProtocolFactory {
    pub fn new() -> Self {
        Self {
            depth_limit: DEFAULT_DEPTH_LIMIT,
        }
    }

    pub fn with_depth_limit(depth_limit: usize) -> Self {
        Self { depth_limit }
    }
}

impl Default for JsonProtocolFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolFactory for JsonProtocolFactory {
    fn create(&self, transport: Box<dyn Transport>) -> Box<dyn Protocol> {
        Box::new(JsonProtocol::with_depth_limit(transport, self.depth_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn writer() -> JsonProtocol {
        JsonProtocol::new(Box::new(MemoryTransport::new()))
    }

    fn reader(bytes: impl Into<Vec<u8>>) -> JsonProtocol {
        JsonProtocol::new(Box::new(MemoryTransport::from_bytes(bytes)))
    }

    async fn written(protocol: &mut JsonProtocol) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        while let Ok(n) = protocol.transport.read(&mut chunk).await {
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    fn pseudo_random_bytes(len: usize) -> Vec<u8> {
        let mut state = 0x2545f491_4f6cdd1du64.wrapping_add(len as u64);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn binary_round_trips_without_over_read() {
        for len in 0..16 {
            let payload = pseudo_random_bytes(len);

            let mut protocol = writer();
            protocol.write_binary(&payload).await.unwrap();
            // A trailing value that an over-reading decoder would swallow.
            protocol.write_i64(424242).await.unwrap();

            let mut protocol = reader(written(&mut protocol).await);
            assert_eq!(protocol.read_binary().await.unwrap(), payload, "len {len}");
            assert_eq!(protocol.read_i64().await.unwrap(), 424242, "len {len}");
        }
    }

    #[tokio::test]
    async fn non_latin_text_escapes_and_round_trips() {
        let russian_text = "\u{0420}\u{0443}\u{0441}\u{0441}\u{043a}\u{043e}\u{0435} \
                            \u{041d}\u{0430}\u{0437}\u{0432}\u{0430}\u{043d}\u{0438}\u{0435}";
        let russian_json = "\"\\u0420\\u0443\\u0441\\u0441\\u043a\\u043e\\u0435 \
                            \\u041d\\u0430\\u0437\\u0432\\u0430\\u043d\\u0438\\u0435\"";

        let mut protocol = writer();
        protocol.write_string(russian_text).await.unwrap();
        assert_eq!(written(&mut protocol).await, russian_json.as_bytes());

        let mut protocol = reader(russian_json.as_bytes().to_vec());
        assert_eq!(protocol.read_string().await.unwrap(), russian_text);
    }

    #[tokio::test]
    async fn surrogate_pair_reconstructs_full_scalar() {
        let text = "clef: \u{1d11e}";

        let mut protocol = writer();
        protocol.write_string(text).await.unwrap();
        let encoded = written(&mut protocol).await;
        assert_eq!(encoded, b"\"clef: \\ud834\\udd1e\"");

        let mut protocol = reader(encoded);
        assert_eq!(protocol.read_string().await.unwrap(), text);
    }

    #[tokio::test]
    async fn nesting_beyond_limit_fails_with_depth_error() {
        let limit = 5;
        let levels = limit + 3;
        let mut encoded = Vec::new();
        for _ in 0..levels {
            encoded.extend_from_slice(b"{\"1\":{\"rec\":");
        }
        let mut protocol = JsonProtocol::with_depth_limit(
            Box::new(MemoryTransport::from_bytes(encoded)),
            limit,
        );
        let err = protocol.skip(WireType::Struct).await.unwrap_err();
        assert!(matches!(err, ProtocolError::DepthLimit(l) if l == limit));
    }

    #[tokio::test]
    async fn unknown_field_is_skippable() {
        let mut protocol = writer();
        protocol.write_struct_begin("args").await.unwrap();
        protocol
            .write_field_begin(&FieldHeader {
                wire_type: WireType::List,
                id: 1,
            })
            .await
            .unwrap();
        protocol
            .write_list_begin(&ListHeader {
                element_type: WireType::I32,
                size: 3,
            })
            .await
            .unwrap();
        for v in [10, 20, 30] {
            protocol.write_i32(v).await.unwrap();
        }
        protocol.write_list_end().await.unwrap();
        protocol.write_field_end().await.unwrap();
        protocol
            .write_field_begin(&FieldHeader {
                wire_type: WireType::Binary,
                id: 2,
            })
            .await
            .unwrap();
        protocol.write_string("kept").await.unwrap();
        protocol.write_field_end().await.unwrap();
        protocol.write_field_stop().await.unwrap();
        protocol.write_struct_end().await.unwrap();

        let mut protocol = reader(written(&mut protocol).await);
        protocol.read_struct_begin().await.unwrap();
        let first = protocol.read_field_begin().await.unwrap();
        assert_eq!(first.id, 1);
        // Decoder does not understand field 1; skip must leave the stream
        // positioned exactly at field 2.
        protocol.skip(first.wire_type).await.unwrap();
        protocol.read_field_end().await.unwrap();
        let second = protocol.read_field_begin().await.unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(protocol.read_string().await.unwrap(), "kept");
        protocol.read_field_end().await.unwrap();
        assert!(protocol.read_field_begin().await.unwrap().is_stop());
        protocol.read_struct_end().await.unwrap();
    }

    #[tokio::test]
    async fn message_envelope_round_trips() {
        let header = MessageHeader {
            name: "ping".to_string(),
            kind: MessageKind::Call,
            sequence: 7,
        };

        let mut protocol = writer();
        protocol.write_message_begin(&header).await.unwrap();
        protocol.write_struct_begin("args").await.unwrap();
        protocol.write_field_stop().await.unwrap();
        protocol.write_struct_end().await.unwrap();
        protocol.write_message_end().await.unwrap();

        let encoded = written(&mut protocol).await;
        assert_eq!(encoded, b"[1,\"ping\",1,7,{}]");

        let mut protocol = reader(encoded);
        assert_eq!(protocol.read_message_begin().await.unwrap(), header);
        protocol.read_struct_begin().await.unwrap();
        assert!(protocol.read_field_begin().await.unwrap().is_stop());
        protocol.read_struct_end().await.unwrap();
        protocol.read_message_end().await.unwrap();
    }

    #[tokio::test]
    async fn map_with_integer_keys_quotes_them() {
        let mut protocol = writer();
        protocol
            .write_map_begin(&MapHeader {
                key_type: WireType::I32,
                value_type: WireType::Binary,
                size: 2,
            })
            .await
            .unwrap();
        protocol.write_i32(1).await.unwrap();
        protocol.write_string("one").await.unwrap();
        protocol.write_i32(2).await.unwrap();
        protocol.write_string("two").await.unwrap();
        protocol.write_map_end().await.unwrap();

        let encoded = written(&mut protocol).await;
        assert_eq!(encoded, b"[\"i32\",\"str\",2,{\"1\":\"one\",\"2\":\"two\"}]");

        let mut protocol = reader(encoded);
        let header = protocol.read_map_begin().await.unwrap();
        assert_eq!(header.size, 2);
        assert_eq!(protocol.read_i32().await.unwrap(), 1);
        assert_eq!(protocol.read_string().await.unwrap(), "one");
        assert_eq!(protocol.read_i32().await.unwrap(), 2);
        assert_eq!(protocol.read_string().await.unwrap(), "two");
        protocol.read_map_end().await.unwrap();
    }

    #[tokio::test]
    async fn doubles_round_trip_including_specials() {
        for value in [0.0, 3.25, -1.5e10, f64::INFINITY, f64::NEG_INFINITY] {
            let mut protocol = writer();
            protocol.write_double(value).await.unwrap();
            let mut protocol = reader(written(&mut protocol).await);
            assert_eq!(protocol.read_double().await.unwrap(), value);
        }

        let mut protocol = writer();
        protocol.write_double(f64::NAN).await.unwrap();
        let mut protocol = reader(written(&mut protocol).await);
        assert!(protocol.read_double().await.unwrap().is_nan());
    }

    #[tokio::test]
    async fn depth_returns_to_zero_after_balanced_reads() {
        let mut protocol = writer();
        protocol.write_struct_begin("outer").await.unwrap();
        protocol
            .write_field_begin(&FieldHeader {
                wire_type: WireType::Struct,
                id: 1,
            })
            .await
            .unwrap();
        protocol.write_struct_begin("inner").await.unwrap();
        protocol.write_field_stop().await.unwrap();
        protocol.write_struct_end().await.unwrap();
        protocol.write_field_end().await.unwrap();
        protocol.write_field_stop().await.unwrap();
        protocol.write_struct_end().await.unwrap();

        let mut protocol = reader(written(&mut protocol).await);
        protocol.skip(WireType::Struct).await.unwrap();
        assert_eq!(protocol.depth, 0);
    }
}
