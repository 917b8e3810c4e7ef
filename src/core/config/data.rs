use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::message::MessageOrigin;

/// On-disk configuration. Every key is optional; unset keys fall back to the
/// values in [`super::defaults`].
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// REST base for conventional history and presence.
    pub api_base_url: Option<String>,
    /// Websocket endpoint for the conventional live channel.
    pub socket_url: Option<String>,
    pub ledger_base_url: Option<String>,
    /// Transport a chat opens in ("conventional" or "ledger").
    pub default_mode: Option<MessageOrigin>,
    pub poll_interval_ms: Option<u64>,
    pub ledger_poll_interval_ms: Option<u64>,
    pub presence_interval_ms: Option<u64>,
    pub typing_expiry_ms: Option<u64>,
    pub typing_throttle_ms: Option<u64>,
    pub ledger_confirmation_timeout_ms: Option<u64>,
    pub ledger_confirmation_poll_ms: Option<u64>,
    /// Consecutive failed history loads before the error is shown.
    pub failure_threshold: Option<u32>,
    pub request_timeout_ms: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    /// Store identity in the platform keyring. When off, identity only lives
    /// for the current process.
    pub use_keyring: Option<bool>,
}

/// Keys accepted by `sparkchat set` / `sparkchat unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    ApiBaseUrl,
    SocketUrl,
    LedgerBaseUrl,
    DefaultMode,
    PollIntervalMs,
    LedgerPollIntervalMs,
    PresenceIntervalMs,
    TypingExpiryMs,
    TypingThrottleMs,
    LedgerConfirmationTimeoutMs,
    LedgerConfirmationPollMs,
    FailureThreshold,
    RequestTimeoutMs,
    ReconnectDelayMs,
    UseKeyring,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 15] = [
        ConfigKey::ApiBaseUrl,
        ConfigKey::SocketUrl,
        ConfigKey::LedgerBaseUrl,
        ConfigKey::DefaultMode,
        ConfigKey::PollIntervalMs,
        ConfigKey::LedgerPollIntervalMs,
        ConfigKey::PresenceIntervalMs,
        ConfigKey::TypingExpiryMs,
        ConfigKey::TypingThrottleMs,
        ConfigKey::LedgerConfirmationTimeoutMs,
        ConfigKey::LedgerConfirmationPollMs,
        ConfigKey::FailureThreshold,
        ConfigKey::RequestTimeoutMs,
        ConfigKey::ReconnectDelayMs,
        ConfigKey::UseKeyring,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::ApiBaseUrl => "api_base_url",
            ConfigKey::SocketUrl => "socket_url",
            ConfigKey::LedgerBaseUrl => "ledger_base_url",
            ConfigKey::DefaultMode => "default_mode",
            ConfigKey::PollIntervalMs => "poll_interval_ms",
            ConfigKey::LedgerPollIntervalMs => "ledger_poll_interval_ms",
            ConfigKey::PresenceIntervalMs => "presence_interval_ms",
            ConfigKey::TypingExpiryMs => "typing_expiry_ms",
            ConfigKey::TypingThrottleMs => "typing_throttle_ms",
            ConfigKey::LedgerConfirmationTimeoutMs => "ledger_confirmation_timeout_ms",
            ConfigKey::LedgerConfirmationPollMs => "ledger_confirmation_poll_ms",
            ConfigKey::FailureThreshold => "failure_threshold",
            ConfigKey::RequestTimeoutMs => "request_timeout_ms",
            ConfigKey::ReconnectDelayMs => "reconnect_delay_ms",
            ConfigKey::UseKeyring => "use_keyring",
        }
    }

    /// Accepts both `snake_case` and `kebab-case` spellings.
    pub fn parse(raw: &str) -> Option<ConfigKey> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Config {
    /// Parses and stores `value` under `key`.
    pub fn set_value(&mut self, key: ConfigKey, value: &str) -> Result<(), String> {
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("{key} needs a value"));
        }
        match key {
            ConfigKey::ApiBaseUrl => self.api_base_url = Some(parse_http_url(key, value)?),
            ConfigKey::SocketUrl => {
                if !crate::utils::url::is_websocket_url(value) {
                    return Err(format!("{key} must start with ws:// or wss://"));
                }
                self.socket_url = Some(value.to_string());
            }
            ConfigKey::LedgerBaseUrl => self.ledger_base_url = Some(parse_http_url(key, value)?),
            ConfigKey::DefaultMode => self.default_mode = Some(MessageOrigin::try_from(value)?),
            ConfigKey::PollIntervalMs => self.poll_interval_ms = Some(parse_millis(key, value)?),
            ConfigKey::LedgerPollIntervalMs => {
                self.ledger_poll_interval_ms = Some(parse_millis(key, value)?)
            }
            ConfigKey::PresenceIntervalMs => {
                self.presence_interval_ms = Some(parse_millis(key, value)?)
            }
            ConfigKey::TypingExpiryMs => self.typing_expiry_ms = Some(parse_millis(key, value)?),
            ConfigKey::TypingThrottleMs => {
                self.typing_throttle_ms = Some(parse_millis(key, value)?)
            }
            ConfigKey::LedgerConfirmationTimeoutMs => {
                self.ledger_confirmation_timeout_ms = Some(parse_millis(key, value)?)
            }
            ConfigKey::LedgerConfirmationPollMs => {
                self.ledger_confirmation_poll_ms = Some(parse_millis(key, value)?)
            }
            ConfigKey::FailureThreshold => {
                let threshold: u32 = value
                    .parse()
                    .map_err(|_| format!("{key} must be a whole number"))?;
                if threshold == 0 {
                    return Err(format!("{key} must be at least 1"));
                }
                self.failure_threshold = Some(threshold);
            }
            ConfigKey::RequestTimeoutMs => {
                self.request_timeout_ms = Some(parse_millis(key, value)?)
            }
            ConfigKey::ReconnectDelayMs => {
                self.reconnect_delay_ms = Some(parse_millis(key, value)?)
            }
            ConfigKey::UseKeyring => self.use_keyring = Some(parse_bool(key, value)?),
        }
        Ok(())
    }

    pub fn unset_value(&mut self, key: ConfigKey) {
        match key {
            ConfigKey::ApiBaseUrl => self.api_base_url = None,
            ConfigKey::SocketUrl => self.socket_url = None,
            ConfigKey::LedgerBaseUrl => self.ledger_base_url = None,
            ConfigKey::DefaultMode => self.default_mode = None,
            ConfigKey::PollIntervalMs => self.poll_interval_ms = None,
            ConfigKey::LedgerPollIntervalMs => self.ledger_poll_interval_ms = None,
            ConfigKey::PresenceIntervalMs => self.presence_interval_ms = None,
            ConfigKey::TypingExpiryMs => self.typing_expiry_ms = None,
            ConfigKey::TypingThrottleMs => self.typing_throttle_ms = None,
            ConfigKey::LedgerConfirmationTimeoutMs => self.ledger_confirmation_timeout_ms = None,
            ConfigKey::LedgerConfirmationPollMs => self.ledger_confirmation_poll_ms = None,
            ConfigKey::FailureThreshold => self.failure_threshold = None,
            ConfigKey::RequestTimeoutMs => self.request_timeout_ms = None,
            ConfigKey::ReconnectDelayMs => self.reconnect_delay_ms = None,
            ConfigKey::UseKeyring => self.use_keyring = None,
        }
    }

    /// Stored value for `key`, `None` when unset.
    pub fn raw_value(&self, key: ConfigKey) -> Option<String> {
        match key {
            ConfigKey::ApiBaseUrl => self.api_base_url.clone(),
            ConfigKey::SocketUrl => self.socket_url.clone(),
            ConfigKey::LedgerBaseUrl => self.ledger_base_url.clone(),
            ConfigKey::DefaultMode => self.default_mode.map(|mode| mode.to_string()),
            ConfigKey::PollIntervalMs => self.poll_interval_ms.map(|v| v.to_string()),
            ConfigKey::LedgerPollIntervalMs => self.ledger_poll_interval_ms.map(|v| v.to_string()),
            ConfigKey::PresenceIntervalMs => self.presence_interval_ms.map(|v| v.to_string()),
            ConfigKey::TypingExpiryMs => self.typing_expiry_ms.map(|v| v.to_string()),
            ConfigKey::TypingThrottleMs => self.typing_throttle_ms.map(|v| v.to_string()),
            ConfigKey::LedgerConfirmationTimeoutMs => {
                self.ledger_confirmation_timeout_ms.map(|v| v.to_string())
            }
            ConfigKey::LedgerConfirmationPollMs => {
                self.ledger_confirmation_poll_ms.map(|v| v.to_string())
            }
            ConfigKey::FailureThreshold => self.failure_threshold.map(|v| v.to_string()),
            ConfigKey::RequestTimeoutMs => self.request_timeout_ms.map(|v| v.to_string()),
            ConfigKey::ReconnectDelayMs => self.reconnect_delay_ms.map(|v| v.to_string()),
            ConfigKey::UseKeyring => self.use_keyring.map(|v| v.to_string()),
        }
    }
}

fn parse_http_url(key: ConfigKey, value: &str) -> Result<String, String> {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(value.to_string())
    } else {
        Err(format!("{key} must start with http:// or https://"))
    }
}

fn parse_millis(key: ConfigKey, value: &str) -> Result<u64, String> {
    match value.parse::<u64>() {
        Ok(0) => Err(format!("{key} must be greater than zero")),
        Ok(millis) => Ok(millis),
        Err(_) => Err(format!("{key} must be a number of milliseconds")),
    }
}

fn parse_bool(key: ConfigKey, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(format!("{key} must be on or off")),
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/sparkchat/config.toml` → `~/.config/sparkchat/config.toml`
/// - macOS: `/Users/user/Library/Application Support/...` → `~/Library/Application Support/...`
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
