//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the RPC runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RpcConfig {
    /// Server settings (bind address).
    pub server: ServerConfig,

    /// Codec settings shared by all protocol instances.
    pub codec: CodecConfig,

    /// HTTP client transport settings.
    pub http_client: HttpClientConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:9090").
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Codec configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Maximum structural nesting depth accepted while decoding.
    pub depth_limit: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            depth_limit: crate::protocol::json::DEFAULT_DEPTH_LIMIT,
        }
    }
}

/// HTTP client transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Endpoint URL for the POST exchanges.
    pub url: String,

    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds.
    pub read_timeout_secs: u64,

    /// Custom headers attached to every exchange.
    pub headers: HashMap<String, String>,

    /// Optional proxy URL.
    pub proxy: Option<String>,

    /// Media type for `Content-Type`/`Accept`.
    pub media_type: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9090/rpc".to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            headers: HashMap::new(),
            proxy: None,
            media_type: "application/x-thrift".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log level filter (overridable via `RUST_LOG`).
    pub log_level: String,

    /// Output format.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output for development.
    Pretty,
    /// JSON lines for machine parsing.
    Json,
}
