//! Cluster tunables shared by the master, chunkservers and clients.

use std::time::Duration;

use byte_unit::Byte;
use serde::{Deserialize, Serialize};

use crate::core::{GfsError, Result};

// Chunk size is 64MB.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of a single chunk in bytes.
    pub chunk_size: u64,
    /// Number of replicas allocated for a new chunk.
    pub replication: usize,
    pub lease_duration_ms: u64,
    /// Bound on clock skew between any two machines. The master waits this
    /// long past an old lease's expiry before granting a new one.
    pub clock_skew_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Chunkservers not heard from for this long are evicted from the live set.
    pub liveness_timeout_ms: u64,
    pub push_buffer_capacity: usize,
    /// Pushed data not consumed within this window is garbage-collected.
    pub push_buffer_ttl_ms: u64,
    pub gc_interval_ms: u64,
    pub client_max_attempts: usize,
    pub client_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: DEFAULT_CHUNK_SIZE,
            replication: 3,
            lease_duration_ms: 60_000,
            clock_skew_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            liveness_timeout_ms: 5_000,
            push_buffer_capacity: 1024,
            push_buffer_ttl_ms: 60_000,
            gc_interval_ms: 10_000,
            client_max_attempts: 8,
            client_backoff_ms: 50,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by `GFS_*` environment variables.
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let mut config = Config::default();

        if let Some(size) = lookup("GFS_CHUNK_SIZE") {
            config.chunk_size = parse_size(&size)?;
        }
        set_parsed(&lookup, "GFS_REPLICATION", &mut config.replication)?;
        set_parsed(&lookup, "GFS_LEASE_DURATION_MS", &mut config.lease_duration_ms)?;
        set_parsed(&lookup, "GFS_CLOCK_SKEW_MS", &mut config.clock_skew_ms)?;
        set_parsed(&lookup, "GFS_HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval_ms)?;
        set_parsed(&lookup, "GFS_LIVENESS_TIMEOUT_MS", &mut config.liveness_timeout_ms)?;
        set_parsed(&lookup, "GFS_PUSH_BUFFER_CAPACITY", &mut config.push_buffer_capacity)?;
        set_parsed(&lookup, "GFS_PUSH_BUFFER_TTL_MS", &mut config.push_buffer_ttl_ms)?;
        set_parsed(&lookup, "GFS_GC_INTERVAL_MS", &mut config.gc_interval_ms)?;
        set_parsed(&lookup, "GFS_CLIENT_MAX_ATTEMPTS", &mut config.client_max_attempts)?;
        set_parsed(&lookup, "GFS_CLIENT_BACKOFF_MS", &mut config.client_backoff_ms)?;

        Ok(config)
    }

    /// Largest record a client may append; a quarter chunk bounds the padding waste.
    pub fn max_append(&self) -> u64 {
        self.chunk_size / 4
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn client_backoff(&self) -> Duration {
        Duration::from_millis(self.client_backoff_ms)
    }
}

/// Parse a size such as `64 MiB`, `1024` or `4kb`.
pub fn parse_size(size: &str) -> Result<u64> {
    Byte::parse_str(size.trim(), true)
        .map(|b| b.as_u64())
        .map_err(|e| GfsError::Codec(format!("invalid size {size:?}: {e}")))
}

fn set_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| GfsError::Codec(format!("invalid {key}={raw:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn sizes_parse_with_units() {
        assert_eq!(parse_size("64 MiB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> =
            [("GFS_CHUNK_SIZE", "1 KiB"), ("GFS_REPLICATION", "2")].into_iter().collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.replication, 2);
        assert_eq!(config.lease_duration_ms, Config::default().lease_duration_ms);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let result = Config::from_lookup(|k| (k == "GFS_REPLICATION").then(|| "three".to_string()));
        assert!(matches!(result, Err(GfsError::Codec(_))));
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = Config::from_json(r#"{"chunk_size": 4096}"#).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.replication, 3);
    }
}
