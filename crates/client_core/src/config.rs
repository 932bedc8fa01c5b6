use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

/// Exponential backoff for reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
    /// Window in which a confirmed message may replace a pending one.
    pub match_window: Duration,
    /// Window in which same sender+content is treated as a network duplicate.
    pub duplicate_window: Duration,
    pub typing_debounce: Duration,
    /// Added to the debounce window before a remote typing entry expires.
    pub typing_grace: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub resend_grace: Duration,
    pub confirm_timeout: Duration,
    pub history_page_size: u32,
    pub tick_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            reconnect: ReconnectPolicy::default(),
            match_window: Duration::from_secs(10),
            duplicate_window: Duration::from_secs(1),
            typing_debounce: Duration::from_secs(3),
            typing_grace: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            resend_grace: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(10),
            history_page_size: 50,
            tick_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    match_window_ms: Option<u64>,
    duplicate_window_ms: Option<u64>,
    typing_debounce_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    resend_grace_ms: Option<u64>,
    confirm_timeout_ms: Option<u64>,
    history_page_size: Option<u32>,
}

pub fn load_sync_settings() -> SyncSettings {
    load_sync_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file (if present), then `APP__*` environment overrides.
pub fn load_sync_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut file_cfg = FileSettings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(parsed) => file_cfg = parsed,
            Err(error) => warn!(path = %path.display(), %error, "ignoring malformed client settings"),
        }
    }

    let ms = |file: Option<u64>, key: &str| -> Option<Duration> {
        env(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .or(file)
            .map(Duration::from_millis)
    };

    let mut settings = SyncSettings::default();
    if let Some(v) = env("APP__SERVER_URL").or(file_cfg.server_url) {
        settings.server_url = v;
    }
    if let Some(v) = ms(file_cfg.reconnect_base_ms, "APP__RECONNECT_BASE_MS") {
        settings.reconnect.base_delay = v;
    }
    if let Some(v) = ms(file_cfg.reconnect_max_ms, "APP__RECONNECT_MAX_MS") {
        settings.reconnect.max_delay = v;
    }
    if let Some(v) = env("APP__RECONNECT_MAX_ATTEMPTS")
        .and_then(|v| v.trim().parse().ok())
        .or(file_cfg.reconnect_max_attempts)
    {
        settings.reconnect.max_attempts = v;
    }
    if let Some(v) = ms(file_cfg.match_window_ms, "APP__MATCH_WINDOW_MS") {
        settings.match_window = v;
    }
    if let Some(v) = ms(file_cfg.duplicate_window_ms, "APP__DUPLICATE_WINDOW_MS") {
        settings.duplicate_window = v;
    }
    if let Some(v) = ms(file_cfg.typing_debounce_ms, "APP__TYPING_DEBOUNCE_MS") {
        settings.typing_debounce = v;
    }
    if let Some(v) = ms(file_cfg.heartbeat_interval_ms, "APP__HEARTBEAT_INTERVAL_MS") {
        settings.heartbeat_interval = v;
    }
    if let Some(v) = ms(file_cfg.heartbeat_timeout_ms, "APP__HEARTBEAT_TIMEOUT_MS") {
        settings.heartbeat_timeout = v;
    }
    if let Some(v) = ms(file_cfg.resend_grace_ms, "APP__RESEND_GRACE_MS") {
        settings.resend_grace = v;
    }
    if let Some(v) = ms(file_cfg.confirm_timeout_ms, "APP__CONFIRM_TIMEOUT_MS") {
        settings.confirm_timeout = v;
    }
    if let Some(v) = env("APP__HISTORY_PAGE_SIZE")
        .and_then(|v| v.trim().parse().ok())
        .or(file_cfg.history_page_size)
    {
        settings.history_page_size = v;
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
