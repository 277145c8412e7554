//! Server configuration, parsed from the body of a [`ConfigInput`].
//!
//! The same bytes travel to the new process on a restart, so whatever the
//! parent accepted here the child parses identically.
//!
//! # Format
//!
//! ```toml
//! [[listener]]
//! address = "127.0.0.1:8080"
//! body = "hello from molt"
//! ```

use molt_handover::ConfigInput;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

fn default_body() -> String {
    "molt\n".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not valid UTF-8")]
    NotUtf8,

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no listeners configured")]
    NoListeners,

    #[error("invalid listener address {0:?}")]
    InvalidAddress(String),

    #[error("listener address {0} configured more than once")]
    DuplicateAddress(String),
}

/// One HTTP listener and what it serves.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:8080`. Also the key under
    /// which the socket is handed to the next process.
    pub address: String,

    /// Response body for `GET /`.
    #[serde(default = "default_body")]
    pub body: String,
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(rename = "listener", default)]
    pub listeners: Vec<ListenerConfig>,
}

impl ServerConfig {
    /// Parse and validate raw config bytes.
    pub fn parse(body: &[u8]) -> Result<Self, ConfigError> {
        let text = std::str::from_utf8(body).map_err(|_| ConfigError::NotUtf8)?;
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_input(input: &dyn ConfigInput) -> Result<Self, ConfigError> {
        Self::parse(input.body())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let mut seen = HashSet::new();
        for listener in &self.listeners {
            listener.socket_addr()?;
            if !seen.insert(listener.address.as_str()) {
                return Err(ConfigError::DuplicateAddress(listener.address.clone()));
            }
        }
        Ok(())
    }

    /// Log the configured listeners.
    pub fn log_config(&self) {
        info!("Configured listeners: {}", self.listeners.len());
        for listener in &self.listeners {
            info!(address = %listener.address, body_len = listener.body.len(), "Listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_handover::FileInput;

    #[test]
    fn test_parse_listeners() {
        let config = ServerConfig::parse(
            br#"
            [[listener]]
            address = "127.0.0.1:8080"
            body = "hello"

            [[listener]]
            address = "[::1]:8443"
            "#,
        )
        .unwrap();

        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].address, "127.0.0.1:8080");
        assert_eq!(config.listeners[0].body, "hello");
        assert_eq!(config.listeners[1].body, default_body());
        assert_eq!(
            config.listeners[1].socket_addr().unwrap(),
            "[::1]:8443".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_from_file_input() {
        let input = FileInput::new(
            "molt.toml",
            b"[[listener]]\naddress = \"0.0.0.0:80\"\n".to_vec(),
        );
        let config = ServerConfig::from_input(&input).unwrap();
        assert_eq!(config.listeners[0].address, "0.0.0.0:80");
    }

    #[test]
    fn test_no_listeners() {
        let err = ServerConfig::parse(b"").unwrap_err();
        assert!(matches!(err, ConfigError::NoListeners));
    }

    #[test]
    fn test_invalid_address() {
        let err = ServerConfig::parse(b"[[listener]]\naddress = \":8080\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(a) if a == ":8080"));
    }

    #[test]
    fn test_duplicate_address() {
        let err = ServerConfig::parse(
            b"[[listener]]\naddress = \"127.0.0.1:80\"\n[[listener]]\naddress = \"127.0.0.1:80\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAddress(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ServerConfig::parse(
            b"[[listener]]\naddress = \"127.0.0.1:80\"\nport = 80\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_not_utf8() {
        let err = ServerConfig::parse(b"\xff\xfe").unwrap_err();
        assert!(matches!(err, ConfigError::NotUtf8));
    }
}
