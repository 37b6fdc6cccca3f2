//! Client configuration.
//!
//! [`ClientConfig`] can be deserialized from an application's own config
//! file and turned into a builder with
//! [`crate::ResilientClientBuilder::from_config`].

use std::time::Duration;

use backon::ExponentialBuilder;
use mongodb::options::ClientOptions;
use serde::Deserialize;

/// Default number of retries while establishing a connection.
pub const DEFAULT_RETRIES: usize = 100;
/// Default delay before the first retry.
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(1_000);
/// Default ceiling on the delay between retries.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Default growth factor of the delay between retries.
pub const DEFAULT_FACTOR: f32 = 2.0;

/// Backoff policy for initial connection establishment.
///
/// Only timeout-class failures are retried. The delay starts at
/// `min_timeout_ms`, grows by `factor` after each attempt and never exceeds
/// `max_timeout_ms`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub retries: usize,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub factor: f32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            min_timeout_ms: DEFAULT_MIN_TIMEOUT.as_millis() as u64,
            max_timeout_ms: DEFAULT_MAX_TIMEOUT.as_millis() as u64,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl RetryOptions {
    pub fn new(retries: usize, max_timeout: Duration) -> Self {
        Self {
            retries,
            max_timeout_ms: max_timeout.as_millis() as u64,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout_ms = min_timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn factor(mut self, factor: f32) -> Self {
        self.factor = factor;
        self
    }

    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        let max_delay = Duration::from_millis(self.max_timeout_ms);
        let min_delay = Duration::from_millis(self.min_timeout_ms).min(max_delay);
        ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(max_delay)
            .with_factor(self.factor)
            .with_max_times(self.retries)
    }
}

/// Driver settings layered over the options parsed from the connection URL.
///
/// Unset fields keep whatever the URL (or the driver default) says.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub app_name: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub server_selection_timeout_ms: Option<u64>,
    pub max_pool_size: Option<u32>,
    pub min_pool_size: Option<u32>,
    pub direct_connection: Option<bool>,
    pub retry_reads: Option<bool>,
    pub retry_writes: Option<bool>,
}

impl ClientSettings {
    /// Overwrites every field of `options` that is set here.
    pub fn apply(&self, options: &mut ClientOptions) {
        if let Some(app_name) = &self.app_name {
            options.app_name = Some(app_name.clone());
        }
        if let Some(ms) = self.connect_timeout_ms {
            options.connect_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.server_selection_timeout_ms {
            options.server_selection_timeout = Some(Duration::from_millis(ms));
        }
        if self.max_pool_size.is_some() {
            options.max_pool_size = self.max_pool_size;
        }
        if self.min_pool_size.is_some() {
            options.min_pool_size = self.min_pool_size;
        }
        if self.direct_connection.is_some() {
            options.direct_connection = self.direct_connection;
        }
        if self.retry_reads.is_some() {
            options.retry_reads = self.retry_reads;
        }
        if self.retry_writes.is_some() {
            options.retry_writes = self.retry_writes;
        }
    }
}

/// Serializable form of everything a [`crate::ResilientClient`] needs except
/// the error sink.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    pub url: String,
    #[serde(default = "default_watch")]
    pub watch: bool,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default)]
    pub client: ClientSettings,
    /// Operation names enabled on top of the defaults.
    #[serde(default)]
    pub to_wrap: Vec<String>,
}

fn default_watch() -> bool {
    true
}
