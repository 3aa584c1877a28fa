//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;
use url::Url;

use crate::config::schema::RpcConfig;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<RpcConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: RpcConfig = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &RpcConfig) -> Result<(), ConfigError> {
    if config.server.bind_address.is_empty() {
        return Err(ConfigError::Invalid(
            "server.bind_address must not be empty".to_string(),
        ));
    }
    if config.codec.depth_limit == 0 {
        return Err(ConfigError::Invalid(
            "codec.depth_limit must be at least 1".to_string(),
        ));
    }
    Url::parse(&config.http_client.url).map_err(|e| {
        ConfigError::Invalid(format!(
            "http_client.url {:?} is not a valid URL: {e}",
            config.http_client.url
        ))
    })?;
    if let Some(proxy) = &config.http_client.proxy {
        Url::parse(proxy).map_err(|e| {
            ConfigError::Invalid(format!("http_client.proxy {proxy:?} is not a valid URL: {e}"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let config: RpcConfig = toml::from_str(
            r#"
            [server]
            bind_address = "0.0.0.0:7000"

            [codec]
            depth_limit = 16
            "#,
        )
        .unwrap();
        validate(&config).unwrap();

        assert_eq!(config.server.bind_address, "0.0.0.0:7000");
        assert_eq!(config.codec.depth_limit, 16);
        assert_eq!(config.http_client.connect_timeout_secs, 30);
        assert_eq!(config.http_client.media_type, "application/x-thrift");
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn empty_file_is_valid() {
        let config: RpcConfig = toml::from_str("").unwrap();
        validate(&config).unwrap();
    }

    #[test]
    fn zero_depth_limit_rejected() {
        let config: RpcConfig = toml::from_str("[codec]\ndepth_limit = 0\n").unwrap();
        assert!(matches!(validate(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_url_rejected() {
        let config: RpcConfig = toml::from_str("[http_client]\nurl = \"not a url\"\n").unwrap();
        assert!(matches!(validate(&config), Err(ConfigError::Invalid(_))));
    }
}
