use crate::backoff::{BackoffPolicy, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;

pub const MAX_THREAD_PAGE_SIZE: u32 = 100;
pub const MAX_MESSAGE_PAGE_SIZE: u32 = 200;

/// Tunables for the sync engine. Every field has a default; values can be
/// overridden from `PARLEY__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    #[serde(default = "default_thread_page_size")]
    pub thread_page_size: u32,
    #[serde(default = "default_message_page_size")]
    pub message_page_size: u32,
    /// Upper bound on message pages fetched for one thread in a single sync.
    #[serde(default = "default_max_message_pages")]
    pub max_message_pages: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// A live channel with no inbound frame for this long is considered dead.
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: u32,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_outbox_max_retries")]
    pub outbox_max_retries: u32,
    /// Re-sync threads whose message history failed on the previous refresh
    /// even when the new page no longer lists them.
    #[serde(default = "default_true")]
    pub retry_failed_threads_on_refresh: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_base_url: default_ws_base_url(),
            thread_page_size: default_thread_page_size(),
            message_page_size: default_message_page_size(),
            max_message_pages: default_max_message_pages(),
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_retries: default_reconnect_max_retries(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            outbox_max_retries: default_outbox_max_retries(),
            retry_failed_threads_on_refresh: true,
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

impl SyncConfig {
    /// Loads from `PARLEY__<FIELD>` variables, falling back to defaults when
    /// the environment cannot be deserialized.
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(SyncConfig::normalize)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid PARLEY__ configuration; using defaults");
                SyncConfig::default().normalize()
            })
    }

    pub fn normalize(mut self) -> Self {
        self.api_base_url = Self::normalize_url(&self.api_base_url, default_api_base_url());
        self.ws_base_url = Self::normalize_url(&self.ws_base_url, default_ws_base_url());
        self.thread_page_size = self.thread_page_size.clamp(1, MAX_THREAD_PAGE_SIZE);
        self.message_page_size = self.message_page_size.clamp(1, MAX_MESSAGE_PAGE_SIZE);
        self.max_message_pages = self.max_message_pages.max(1);
        self.retry_max_attempts = self.retry_max_attempts.max(1);
        self.retry_multiplier = self.retry_multiplier.max(1);
        self.request_timeout_ms = self.request_timeout_ms.max(1);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(1);
        self.connect_timeout_ms = self.connect_timeout_ms.max(1);
        self.liveness_timeout_ms = self.liveness_timeout_ms.max(1);
        self.sync_interval_secs = self.sync_interval_secs.max(1);
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            self.reconnect_max_delay_ms = self.reconnect_base_delay_ms;
        }
        self
    }

    fn normalize_url(value: &str, fallback: String) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            fallback
        } else {
            trimmed.to_string()
        }
    }

    pub fn reconnect_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
            self.reconnect_max_retries,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_ws_base_url() -> String {
    "ws://127.0.0.1:8000/ws/".to_string()
}

fn default_thread_page_size() -> u32 {
    20
}

fn default_message_page_size() -> u32 {
    50
}

fn default_max_message_pages() -> u32 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_liveness_timeout_ms() -> u64 {
    90_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_max_retries() -> u32 {
    10
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    1_000
}

fn default_retry_multiplier() -> u32 {
    2
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_outbox_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SyncConfig::default().normalize();
        assert_eq!(cfg.thread_page_size, 20);
        assert_eq!(cfg.message_page_size, 50);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.reconnect_max_retries, 10);
        assert_eq!(cfg.outbox_max_retries, 3);
        assert!(cfg.retry_failed_threads_on_refresh);
    }

    #[test]
    fn page_sizes_are_clamped() {
        let cfg = SyncConfig {
            thread_page_size: 500,
            message_page_size: 0,
            ..SyncConfig::default()
        }
        .normalize();
        assert_eq!(cfg.thread_page_size, MAX_THREAD_PAGE_SIZE);
        assert_eq!(cfg.message_page_size, 1);
    }

    #[test]
    fn zero_periods_are_raised_to_the_minimum() {
        let cfg = SyncConfig {
            request_timeout_ms: 0,
            heartbeat_interval_ms: 0,
            connect_timeout_ms: 0,
            liveness_timeout_ms: 0,
            sync_interval_secs: 0,
            ..SyncConfig::default()
        }
        .normalize();
        assert_eq!(cfg.request_timeout(), Duration::from_millis(1));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(1));
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(1));
        assert_eq!(cfg.liveness_timeout(), Duration::from_millis(1));
        assert_eq!(cfg.sync_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_heartbeat_from_env_is_usable() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("PARLEY__HEARTBEAT_INTERVAL_MS", "0");
        env::set_var("PARLEY__SYNC_INTERVAL_SECS", "0");

        let cfg = SyncConfig::from_env();

        env::remove_var("PARLEY__HEARTBEAT_INTERVAL_MS");
        env::remove_var("PARLEY__SYNC_INTERVAL_SECS");

        assert_eq!(cfg.heartbeat_interval_ms, 1);
        assert_eq!(cfg.sync_interval_secs, 1);
    }

    #[test]
    fn env_overrides_are_applied() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("PARLEY__THREAD_PAGE_SIZE", "40");
        env::set_var("PARLEY__API_BASE_URL", "  https://threads.example.com  ");
        env::set_var("PARLEY__RETRY_FAILED_THREADS_ON_REFRESH", "false");

        let cfg = SyncConfig::from_env();

        env::remove_var("PARLEY__THREAD_PAGE_SIZE");
        env::remove_var("PARLEY__API_BASE_URL");
        env::remove_var("PARLEY__RETRY_FAILED_THREADS_ON_REFRESH");

        assert_eq!(cfg.thread_page_size, 40);
        assert_eq!(cfg.api_base_url, "https://threads.example.com");
        assert!(!cfg.retry_failed_threads_on_refresh);
    }
}
