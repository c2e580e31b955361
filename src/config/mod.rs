use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};

/// Environment variable naming the config file, checked by [`load_config_from_env`].
pub const CONFIG_ENV: &str = "BLIPQ_CONFIG";

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CursorKind {
    /// Every pending message stays in memory.
    #[default]
    Vm,
    /// Pending persistent messages are paged in from the store in batches.
    Store,
}

/// Per-queue dispatch and flow-control policy.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueuePolicy {
    pub max_page_size: usize,
    pub max_browse_page_size: usize,
    pub max_expire_page_size: usize,
    pub lazy_dispatch: bool,
    pub strict_order_dispatch: bool,
    pub optimized_dispatch: bool,
    pub prioritized_consumers: bool,
    pub all_consumers_exclusive_by_default: bool,
    pub consumers_before_dispatch_starts: usize,
    pub time_before_dispatch_starts_ms: u64,
    /// `0` disables the periodic expiry sweep.
    pub expire_messages_period_ms: u64,
    pub producer_flow_control: bool,
    pub send_fail_if_no_space: bool,
    /// Fail a blocked send after this long. `0` waits indefinitely.
    pub send_fail_if_no_space_after_timeout_ms: u64,
    pub blocked_producer_warning_interval_ms: u64,
    pub cursor: CursorKind,
    pub max_audit_depth: usize,
    pub dead_letter_queue: Option<String>,
    pub dead_letter_expired: bool,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_page_size: 200,
            max_browse_page_size: 400,
            max_expire_page_size: 400,
            lazy_dispatch: false,
            strict_order_dispatch: false,
            optimized_dispatch: false,
            prioritized_consumers: true,
            all_consumers_exclusive_by_default: false,
            consumers_before_dispatch_starts: 0,
            time_before_dispatch_starts_ms: 0,
            expire_messages_period_ms: 30_000,
            producer_flow_control: true,
            send_fail_if_no_space: false,
            send_fail_if_no_space_after_timeout_ms: 0,
            blocked_producer_warning_interval_ms: 30_000,
            cursor: CursorKind::Vm,
            max_audit_depth: 2048,
            dead_letter_queue: None,
            dead_letter_expired: true,
        }
    }
}

impl QueuePolicy {
    pub fn expire_messages_period(&self) -> Option<Duration> {
        (self.expire_messages_period_ms > 0)
            .then(|| Duration::from_millis(self.expire_messages_period_ms))
    }

    pub fn time_before_dispatch_starts(&self) -> Option<Duration> {
        (self.time_before_dispatch_starts_ms > 0)
            .then(|| Duration::from_millis(self.time_before_dispatch_starts_ms))
    }

    pub fn send_fail_if_no_space_after_timeout(&self) -> Option<Duration> {
        (self.send_fail_if_no_space_after_timeout_ms > 0)
            .then(|| Duration::from_millis(self.send_fail_if_no_space_after_timeout_ms))
    }

    pub fn blocked_producer_warning_interval(&self) -> Duration {
        Duration::from_millis(self.blocked_producer_warning_interval_ms)
    }
}

/// Byte limits for the usage gates. `0` means unlimited.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UsageConfig {
    pub memory_limit_bytes: u64,
    pub store_limit_bytes: u64,
    pub temp_limit_bytes: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub queue: QueuePolicy,
    pub usage: UsageConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}

/// Load from the file named by `BLIPQ_CONFIG`, or defaults when unset.
pub fn load_config_from_env() -> Result<Config, anyhow::Error> {
    match env::var(CONFIG_ENV) {
        Ok(path) => load_config(path),
        Err(_) => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [queue]
            lazy_dispatch = true
            cursor = "store"
            dead_letter_queue = "DLQ"

            [usage]
            memory_limit_bytes = 1024
            "#,
        )
        .unwrap();

        assert!(config.queue.lazy_dispatch);
        assert_eq!(config.queue.cursor, CursorKind::Store);
        assert_eq!(config.queue.dead_letter_queue.as_deref(), Some("DLQ"));
        assert_eq!(config.queue.max_page_size, 200);
        assert!(config.queue.producer_flow_control);
        assert_eq!(config.usage.memory_limit_bytes, 1024);
        assert_eq!(config.usage.store_limit_bytes, 0);
    }

    #[test]
    fn zero_periods_disable_timers() {
        let policy = QueuePolicy {
            expire_messages_period_ms: 0,
            ..QueuePolicy::default()
        };
        assert!(policy.expire_messages_period().is_none());
        assert!(policy.time_before_dispatch_starts().is_none());
        assert!(policy.send_fail_if_no_space_after_timeout().is_none());
    }
}
