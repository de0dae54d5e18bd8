//! Client configuration.

use crate::error::ConnectionError;
use crate::provider::RoundRobinSocketProvider;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default limit for requests queued while no session is ready.
pub const DEFAULT_MAX_QUEUED_REQUESTS: usize = 1024;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// User to authenticate as. `None` keeps the guest session.
    pub username: Option<String>,
    /// Password for `username`.
    pub password: Option<String>,
    /// Timeout for opening a socket, reading the greeting and authenticating.
    pub connect_timeout_ms: u64,
    /// Timeout applied by the blocking view to each operation.
    pub operation_timeout_ms: Option<u64>,
    /// Delay before the first retry after a failed connect attempt.
    pub reconnect_backoff_ms: u64,
    /// Upper bound for the reconnect delay.
    pub max_reconnect_backoff_ms: u64,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Server addresses (`host:port`), tried in round-robin order.
    pub addresses: Vec<String>,
    /// Consecutive failed connect attempts before giving up (`None` = never).
    pub retries_limit: Option<u32>,
    /// Requests that may wait for a session while the client is not ready.
    pub max_queued_requests: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            connect_timeout_ms: 2000,
            operation_timeout_ms: None,
            reconnect_backoff_ms: 100,
            max_reconnect_backoff_ms: 5000,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            addresses: vec!["127.0.0.1:3301".to_string()],
            retries_limit: None,
            max_queued_requests: DEFAULT_MAX_QUEUED_REQUESTS,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `TNTC_*` environment variables on top of the current values.
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("TNTC_USER") {
            self.username = Some(user);
        }

        if let Ok(password) = std::env::var("TNTC_PASSWORD") {
            self.password = Some(password);
        }

        if let Ok(timeout) = std::env::var("TNTC_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("TNTC_OPERATION_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.operation_timeout_ms = Some(ms);
            }
        }

        if let Ok(backoff) = std::env::var("TNTC_RECONNECT_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse() {
                self.reconnect_backoff_ms = ms;
            }
        }

        if let Ok(addresses) = std::env::var("TNTC_ADDRESSES") {
            let parsed = parse_address_list(&addresses);
            if !parsed.is_empty() {
                self.addresses = parsed;
            }
        }

        if let Ok(limit) = std::env::var("TNTC_RETRIES_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.retries_limit = Some(n);
            }
        }

        if let Ok(limit) = std::env::var("TNTC_MAX_QUEUED_REQUESTS") {
            if let Ok(n) = limit.parse() {
                self.max_queued_requests = n;
            }
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff_ms = initial.as_millis() as u64;
        self.max_reconnect_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries_limit(mut self, limit: Option<u32>) -> Self {
        self.retries_limit = limit;
        self
    }

    pub fn with_max_queued_requests(mut self, limit: usize) -> Self {
        self.max_queued_requests = limit;
        self
    }

    /// Returns the connect timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the blocking operation timeout, if any.
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// Returns the read buffer size clamped to the supported range.
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
            .clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE)
    }

    /// Delay before connect attempt `attempt` (1-indexed), doubling from
    /// `reconnect_backoff_ms` up to `max_reconnect_backoff_ms`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.reconnect_backoff_ms);
        let max = Duration::from_millis(self.max_reconnect_backoff_ms);
        let multiplier = 2f64.powi(attempt.saturating_sub(1).min(32) as i32);
        initial.mul_f64(multiplier).min(max)
    }

    /// Builds the round-robin provider for the configured addresses.
    pub fn provider(&self) -> Result<RoundRobinSocketProvider, ConnectionError> {
        Ok(RoundRobinSocketProvider::new(&self.addresses)?
            .with_connect_timeout(self.connect_timeout())
            .with_retries_limit(self.retries_limit))
    }
}

fn parse_address_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
