//! Server, room and persistence configuration.
//!
//! Every struct has a `Default`; [`ServerConfig::from_env`] overlays the
//! process environment on top of it.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration errors (environment parsing).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Per-room limits and defaults.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Upper bound on the serialized document size. `<= 0` means unlimited.
    pub max_document_bytes: i64,
    /// How long a room with no sessions stays cached before eviction.
    pub idle_grace: Duration,
    /// Password given to rooms that have never been persisted (None = open)
    pub default_password: Option<String>,
    /// Lifetime of a one-time credential
    pub one_time_pass_ttl: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: 5000,
            idle_grace: Duration::from_secs(10),
            default_password: None,
            one_time_pass_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Persistence queue tuning.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Outstanding writes buffered before new ones are dropped
    pub queue_capacity: usize,
    /// Write attempts per record, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on each further retry
    pub retry_base: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            retry_base: Duration::from_millis(100),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound messages buffered per session before a lagging peer drops them
    pub outbound_capacity: usize,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub room: RoomConfig,
    pub persist: PersistConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            outbound_capacity: 256,
            storage_path: None,
            room: RoomConfig::default(),
            persist: PersistConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            let host = config
                .bind_addr
                .rsplit_once(':')
                .map_or(config.bind_addr.as_str(), |(host, _)| host);
            config.bind_addr = format!("{host}:{port}");
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(bytes) = lookup("ROOM_MAX_BYTES") {
            config.room.max_document_bytes = parse("ROOM_MAX_BYTES", &bytes)?;
        }
        if let Some(secs) = lookup("ROOM_IDLE_SECS") {
            config.room.idle_grace = Duration::from_secs(parse("ROOM_IDLE_SECS", &secs)?);
        }
        if let Some(password) = lookup("ROOM_DEFAULT_PASSWORD") {
            config.room.default_password = Some(password);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.outbound_capacity, 256);
        assert!(config.storage_path.is_none());
        assert_eq!(config.room.max_document_bytes, 5000);
        assert_eq!(config.room.idle_grace, Duration::from_secs(10));
        assert!(config.room.default_password.is_none());
        assert_eq!(config.persist.max_attempts, 5);
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(env(&[
            ("PORT", "9000"),
            ("STORAGE_PATH", "/tmp/rooms"),
            ("ROOM_MAX_BYTES", "0"),
            ("ROOM_IDLE_SECS", "3"),
            ("ROOM_DEFAULT_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/rooms")));
        assert_eq!(config.room.max_document_bytes, 0);
        assert_eq!(config.room.idle_grace, Duration::from_secs(3));
        assert_eq!(config.room.default_password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_port_applies_to_bind_addr() {
        let config =
            ServerConfig::from_lookup(env(&[("BIND_ADDR", "0.0.0.0:1"), ("PORT", "4242")])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:4242");
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = ServerConfig::from_lookup(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "PORT", .. }));
    }
}
