//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → semantic validation
//!     → RpcConfig (immutable)
//! ```
//!
//! # Design Decisions
//! - Every field has a default so a minimal (or empty) file is valid.
//! - Validation separates syntactic (serde) from semantic checks.

pub mod loader;
pub mod schema;

pub use loader::{load_config, ConfigError};
pub use schema::{CodecConfig, HttpClientConfig, ObservabilityConfig, RpcConfig, ServerConfig};
