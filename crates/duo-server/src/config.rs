//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use duo_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_OUTBOUND_BUFFER, MAX_UPLOAD_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3001`
    pub http_addr: SocketAddr,

    /// Directory where uploaded files are stored and served from.
    /// Env: `UPLOAD_PATH`
    /// Default: `./uploads`
    pub upload_path: PathBuf,

    /// Maximum upload size in bytes.
    /// Env: `MAX_UPLOAD_SIZE`
    /// Default: 50 MiB
    pub max_upload_size: usize,

    /// Base URL used when building links to uploaded files. When unset the
    /// request's `Host` header is used.
    /// Env: `PUBLIC_URL`
    pub public_url: Option<String>,

    /// Capacity of each connection's outbound event queue.
    /// Env: `OUTBOUND_BUFFER`
    /// Default: `256`
    pub outbound_buffer: usize,

    /// Per-IP HTTP request budget.
    /// Env: `RATE_LIMIT_PER_SEC`, `RATE_LIMIT_BURST`
    /// Default: 10/s, burst 30
    pub http_rate_per_sec: f64,
    pub http_rate_burst: f64,

    /// Per-connection WebSocket event budget.
    /// Env: `EVENT_RATE_PER_SEC`, `EVENT_RATE_BURST`
    /// Default: 20/s, burst 60
    pub event_rate_per_sec: f64,
    pub event_rate_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            upload_path: PathBuf::from("./uploads"),
            max_upload_size: MAX_UPLOAD_SIZE,
            public_url: None,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            http_rate_per_sec: 10.0,
            http_rate_burst: 30.0,
            event_rate_per_sec: 20.0,
            event_rate_burst: 60.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("UPLOAD_PATH") {
            config.upload_path = PathBuf::from(path);
        }

        parse_into(&lookup, "MAX_UPLOAD_SIZE", &mut config.max_upload_size);

        if let Some(url) = lookup("PUBLIC_URL") {
            let url = url.trim().trim_end_matches('/');
            if !url.is_empty() {
                config.public_url = Some(url.to_string());
            }
        }

        parse_into(&lookup, "OUTBOUND_BUFFER", &mut config.outbound_buffer);
        if config.outbound_buffer == 0 {
            tracing::warn!("OUTBOUND_BUFFER must be positive, using default");
            config.outbound_buffer = DEFAULT_OUTBOUND_BUFFER;
        }

        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.http_rate_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.http_rate_burst);
        parse_into(&lookup, "EVENT_RATE_PER_SEC", &mut config.event_rate_per_sec);
        parse_into(&lookup, "EVENT_RATE_BURST", &mut config.event_rate_burst);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

/// Overwrite `slot` with the parsed value of `key`, keeping the default (and
/// warning) when the value does not parse.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 3001).into());
        assert_eq!(config.max_upload_size, 50 * 1024 * 1024);
        assert!(config.public_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("UPLOAD_PATH", "/tmp/duo"),
            ("PUBLIC_URL", "https://chat.example.com/"),
            ("OUTBOUND_BUFFER", "32"),
            ("EVENT_RATE_BURST", "5"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.upload_path, PathBuf::from("/tmp/duo"));
        assert_eq!(config.public_url.as_deref(), Some("https://chat.example.com"));
        assert_eq!(config.outbound_buffer, 32);
        assert_eq!(config.event_rate_burst, 5.0);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("HTTP_ADDR", "not-an-address"),
            ("MAX_UPLOAD_SIZE", "huge"),
            ("OUTBOUND_BUFFER", "0"),
            ("PUBLIC_URL", "   "),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.max_upload_size, defaults.max_upload_size);
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
        assert!(config.public_url.is_none());
    }
}
