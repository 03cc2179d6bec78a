pub mod store;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use store::ConfigStore;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: String, value: String },
}

/// Bounded exponential backoff for backend writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Tracer settings. Every field has a default, so partial documents
/// deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub sample_rate: f64,
    /// Sampler seed; `None` uses the seed drawn once per process.
    pub seed: Option<u64>,
    pub max_payload_bytes: usize,
    /// Inline snapshots larger than this move to the blob store at flush.
    pub inline_threshold_bytes: usize,
    /// Capacity of each consumer lane of the event buffer.
    pub buffer_capacity: usize,
    pub flush_interval_ms: u64,
    pub flush_batch_size: usize,
    pub retry: RetryPolicy,
    pub drain_timeout_ms: u64,
    pub observer_queue_capacity: usize,
    pub backfill_tail_capacity: usize,
    /// Relative duration change the comparator reports.
    pub duration_threshold: f64,
    pub store_url: Option<String>,
    pub blob_path: Option<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            sample_rate: 1.0,
            seed: None,
            max_payload_bytes: 4096,
            inline_threshold_bytes: 1024,
            buffer_capacity: 10_000,
            flush_interval_ms: 200,
            flush_batch_size: 512,
            retry: RetryPolicy::default(),
            drain_timeout_ms: 5000,
            observer_queue_capacity: 256,
            backfill_tail_capacity: 4096,
            duration_threshold: 0.2,
            store_url: None,
            blob_path: None,
        }
    }
}

impl TracerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Reads `traced.*` keys over the defaults.
    pub fn from_store(store: &ConfigStore) -> Result<Self, ConfigError> {
        let mut config = TracerConfig::default();
        let d = &mut config;

        if let Some(rate) = float(store, "traced.sample_rate")? {
            if !(0.0..=1.0).contains(&rate) {
                return Err(invalid(store, "traced.sample_rate"));
            }
            d.sample_rate = rate;
        }
        d.seed = unsigned(store, "traced.seed")?.or(d.seed);
        set_usize(store, "traced.max_payload_bytes", &mut d.max_payload_bytes)?;
        set_usize(
            store,
            "traced.inline_threshold_bytes",
            &mut d.inline_threshold_bytes,
        )?;
        set_usize(store, "traced.buffer_capacity", &mut d.buffer_capacity)?;
        set_u64(store, "traced.flush_interval_ms", &mut d.flush_interval_ms)?;
        set_usize(store, "traced.flush_batch_size", &mut d.flush_batch_size)?;
        if let Some(attempts) = unsigned(store, "traced.retry_max_attempts")? {
            d.retry.max_attempts =
                u32::try_from(attempts).map_err(|_| invalid(store, "traced.retry_max_attempts"))?;
        }
        set_u64(
            store,
            "traced.retry_initial_backoff_ms",
            &mut d.retry.initial_backoff_ms,
        )?;
        set_u64(
            store,
            "traced.retry_max_backoff_ms",
            &mut d.retry.max_backoff_ms,
        )?;
        set_u64(store, "traced.drain_timeout_ms", &mut d.drain_timeout_ms)?;
        set_usize(
            store,
            "traced.observer_queue_capacity",
            &mut d.observer_queue_capacity,
        )?;
        set_usize(
            store,
            "traced.backfill_tail_capacity",
            &mut d.backfill_tail_capacity,
        )?;
        if let Some(threshold) = float(store, "traced.duration_threshold")? {
            d.duration_threshold = threshold;
        }
        d.store_url = store.get_str("traced.store_url").or(d.store_url.take());
        d.blob_path = store.get_str("traced.blob_path").or(d.blob_path.take());

        Ok(config)
    }
}

fn invalid(store: &ConfigStore, key: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: store.get_str(key).unwrap_or_default(),
    }
}

fn float(store: &ConfigStore, key: &str) -> Result<Option<f64>, ConfigError> {
    if !store.contains_key(key) {
        return Ok(None);
    }
    store
        .get_f64(key)
        .map(Some)
        .ok_or_else(|| invalid(store, key))
}

fn unsigned(store: &ConfigStore, key: &str) -> Result<Option<u64>, ConfigError> {
    if !store.contains_key(key) {
        return Ok(None);
    }
    store
        .get_u64(key)
        .map(Some)
        .ok_or_else(|| invalid(store, key))
}

fn set_u64(store: &ConfigStore, key: &str, slot: &mut u64) -> Result<(), ConfigError> {
    if let Some(v) = unsigned(store, key)? {
        *slot = v;
    }
    Ok(())
}

fn set_usize(store: &ConfigStore, key: &str, slot: &mut usize) -> Result<(), ConfigError> {
    if let Some(v) = unsigned(store, key)? {
        *slot = usize::try_from(v).map_err(|_| invalid(store, key))?;
    }
    Ok(())
}
