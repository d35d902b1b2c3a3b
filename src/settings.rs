//! Runtime tuning knobs, populated from the environment.
//!
//! Connection-level options (host, port, user, password) live on the CLI
//! structs; everything here is a behavioral knob with a sensible default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Server cursor fetch size.
    pub query_chunk_size: usize,
    /// Replication slot poll period.
    pub poll_timeout: Duration,
    /// Primary-key IN-list chunk size for pointed syncs.
    pub filter_chunk_size: usize,

    pub elasticsearch_url: String,
    pub elasticsearch_user: Option<String>,
    pub elasticsearch_password: Option<String>,
    pub elasticsearch_timeout: Duration,
    /// Documents per bulk request.
    pub elasticsearch_chunk_size: usize,
    /// Maximum bulk request body in bytes.
    pub elasticsearch_max_chunk_bytes: usize,
    /// Concurrent bulk submitters.
    pub elasticsearch_thread_count: usize,
    pub elasticsearch_max_retries: usize,
    pub elasticsearch_initial_backoff: Duration,
    pub elasticsearch_max_backoff: Duration,

    pub redis_url: String,
    /// Events popped from the queue per engine step.
    pub redis_read_chunk_size: usize,
    /// Notification payloads buffered before a queue write.
    pub redis_write_chunk_size: usize,
    pub redis_socket_timeout: Duration,
    pub redis_poll_interval: Duration,
    /// Store the checkpoint in the broker instead of the filesystem.
    pub redis_checkpoint: bool,

    /// Rows per parallel-sync work unit.
    pub block_size: u64,
    /// WAL rows fetched per slot poll.
    pub logical_slot_chunk_size: i64,
    /// Directory for checkpoint files.
    pub checkpoint_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            query_chunk_size: 10_000,
            poll_timeout: Duration::from_millis(100),
            filter_chunk_size: 5_000,
            elasticsearch_url: "http://localhost:9200".to_string(),
            elasticsearch_user: None,
            elasticsearch_password: None,
            elasticsearch_timeout: Duration::from_secs(10),
            elasticsearch_chunk_size: 2_000,
            elasticsearch_max_chunk_bytes: 104_857_600,
            elasticsearch_thread_count: 4,
            elasticsearch_max_retries: 0,
            elasticsearch_initial_backoff: Duration::from_secs(2),
            elasticsearch_max_backoff: Duration::from_secs(600),
            redis_url: "redis://localhost:6379/0".to_string(),
            redis_read_chunk_size: 1_000,
            redis_write_chunk_size: 1_000,
            redis_socket_timeout: Duration::from_secs(5),
            redis_poll_interval: Duration::from_millis(10),
            redis_checkpoint: false,
            block_size: 20_480,
            logical_slot_chunk_size: 5_000,
            checkpoint_path: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, SyncError> {
        let defaults = Settings::default();
        Ok(Settings {
            query_chunk_size: env_parse("QUERY_CHUNK_SIZE", defaults.query_chunk_size)?,
            poll_timeout: env_secs("POLL_TIMEOUT", defaults.poll_timeout)?,
            filter_chunk_size: env_parse("FILTER_CHUNK_SIZE", defaults.filter_chunk_size)?,
            elasticsearch_url: env_parse("ELASTICSEARCH_URL", defaults.elasticsearch_url)?,
            elasticsearch_user: std::env::var("ELASTICSEARCH_USER").ok(),
            elasticsearch_password: std::env::var("ELASTICSEARCH_PASSWORD").ok(),
            elasticsearch_timeout: env_secs(
                "ELASTICSEARCH_TIMEOUT",
                defaults.elasticsearch_timeout,
            )?,
            elasticsearch_chunk_size: env_parse(
                "ELASTICSEARCH_CHUNK_SIZE",
                defaults.elasticsearch_chunk_size,
            )?,
            elasticsearch_max_chunk_bytes: env_parse(
                "ELASTICSEARCH_MAX_CHUNK_BYTES",
                defaults.elasticsearch_max_chunk_bytes,
            )?,
            elasticsearch_thread_count: env_parse(
                "ELASTICSEARCH_THREAD_COUNT",
                defaults.elasticsearch_thread_count,
            )?,
            elasticsearch_max_retries: env_parse(
                "ELASTICSEARCH_MAX_RETRIES",
                defaults.elasticsearch_max_retries,
            )?,
            elasticsearch_initial_backoff: env_secs(
                "ELASTICSEARCH_INITIAL_BACKOFF",
                defaults.elasticsearch_initial_backoff,
            )?,
            elasticsearch_max_backoff: env_secs(
                "ELASTICSEARCH_MAX_BACKOFF",
                defaults.elasticsearch_max_backoff,
            )?,
            redis_url: env_parse("REDIS_URL", defaults.redis_url)?,
            redis_read_chunk_size: env_parse(
                "REDIS_READ_CHUNK_SIZE",
                defaults.redis_read_chunk_size,
            )?,
            redis_write_chunk_size: env_parse(
                "REDIS_WRITE_CHUNK_SIZE",
                defaults.redis_write_chunk_size,
            )?,
            redis_socket_timeout: env_secs("REDIS_SOCKET_TIMEOUT", defaults.redis_socket_timeout)?,
            redis_poll_interval: env_secs("REDIS_POLL_INTERVAL", defaults.redis_poll_interval)?,
            redis_checkpoint: env_parse("REDIS_CHECKPOINT", defaults.redis_checkpoint)?,
            block_size: env_parse("BLOCK_SIZE", defaults.block_size)?,
            logical_slot_chunk_size: env_parse(
                "LOGICAL_SLOT_CHUNK_SIZE",
                defaults.logical_slot_chunk_size,
            )?,
            checkpoint_path: std::env::var("CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_path),
        })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, SyncError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| SyncError::InvalidSchema(format!("cannot parse ${key}={raw}"))),
        Err(_) => Ok(default),
    }
}

/// Durations are given in (possibly fractional) seconds, e.g. `POLL_TIMEOUT=0.1`.
fn env_secs(key: &str, default: Duration) -> Result<Duration, SyncError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<f64>()
            .map(Duration::from_secs_f64)
            .map_err(|_| SyncError::InvalidSchema(format!("cannot parse ${key}={raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.query_chunk_size, 10_000);
        assert_eq!(settings.poll_timeout, Duration::from_millis(100));
        assert_eq!(settings.elasticsearch_chunk_size, 2_000);
        assert_eq!(settings.elasticsearch_max_chunk_bytes, 104_857_600);
        assert_eq!(settings.elasticsearch_thread_count, 4);
        assert_eq!(settings.elasticsearch_max_backoff, Duration::from_secs(600));
        assert_eq!(settings.redis_read_chunk_size, 1_000);
        assert!(!settings.redis_checkpoint);
        assert_eq!(settings.block_size, 20_480);
        assert_eq!(settings.logical_slot_chunk_size, 5_000);
    }
}
