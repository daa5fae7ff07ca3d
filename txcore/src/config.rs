//! Runtime configuration for a database instance.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, DbResult};
use crate::wal::MIN_BLOCK_SIZE;

/// Configuration for opening a [`Database`](crate::Database).
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding every data file and the log.
    pub data_dir: PathBuf,
    /// Size in bytes of every block, data and log alike.
    pub block_size: usize,
    /// Number of buffers in the pool.
    pub buffer_count: usize,
    /// Name of the log file inside `data_dir`.
    pub log_file: String,
    /// How long a shared or exclusive lock request may wait.
    pub lock_timeout: Duration,
    /// How long `pin` may wait for an unpinned buffer.
    pub pin_timeout: Duration,
    /// Re-check interval while `pin` waits.
    pub pin_retry_interval: Duration,
    /// Minimum time a buffer stays cold before a repeated access promotes it.
    pub hot_dwell: Duration,
    /// Accesses to buffers in this leading fraction of the hot region do not
    /// move them.
    pub hot_front_fraction: f64,
    /// Load the next sequential block into a free buffer after each pin.
    pub read_ahead: bool,
    /// Unpinned dirty buffers queued before a deferred flush runs. `None`
    /// means a tenth of the pool.
    pub flush_batch: Option<usize>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("txcore-data"),
            block_size: 400,
            buffer_count: 8,
            log_file: "txcore.log".to_string(),
            lock_timeout: Duration::from_secs(3),
            pin_timeout: Duration::from_secs(3),
            pin_retry_interval: Duration::from_millis(100),
            hot_dwell: Duration::from_secs(1),
            hot_front_fraction: 0.25,
            read_ahead: true,
            flush_batch: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

impl DbConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Builds a configuration from `TXCORE_*` environment variables, falling
    /// back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os("TXCORE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(log_file) = std::env::var("TXCORE_LOG_FILE") {
            config.log_file = log_file;
        }
        if let Some(size) = env_parse("TXCORE_BLOCK_SIZE") {
            config.block_size = size;
        }
        if let Some(count) = env_parse("TXCORE_BUFFERS") {
            config.buffer_count = count;
        }
        if let Some(ms) = env_parse("TXCORE_LOCK_TIMEOUT_MS") {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TXCORE_PIN_TIMEOUT_MS") {
            config.pin_timeout = Duration::from_millis(ms);
        }
        if let Some(read_ahead) = env_parse("TXCORE_READ_AHEAD") {
            config.read_ahead = read_ahead;
        }
        config
    }

    /// Rejects settings the pool and log cannot work with.
    pub fn validate(&self) -> DbResult<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "block size {} is below the minimum of {MIN_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.buffer_count == 0 {
            return Err(DbError::InvalidConfig("buffer pool needs at least one buffer".into()));
        }
        if !(0.0..=1.0).contains(&self.hot_front_fraction) {
            return Err(DbError::InvalidConfig(format!(
                "hot front fraction {} is outside 0..=1",
                self.hot_front_fraction
            )));
        }
        Ok(())
    }

    pub fn flush_batch(&self) -> usize {
        self.flush_batch
            .unwrap_or(self.buffer_count / 10)
            .max(1)
    }
}
