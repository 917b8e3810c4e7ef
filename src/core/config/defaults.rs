use std::time::Duration;

use crate::core::config::data::Config;
use crate::core::message::MessageOrigin;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_SOCKET_URL: &str = "ws://localhost:3000/ws";
pub const DEFAULT_LEDGER_BASE_URL: &str = "http://localhost:3001";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_LEDGER_POLL_INTERVAL_MS: u64 = 4_000;
pub const DEFAULT_PRESENCE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_TYPING_EXPIRY_MS: u64 = 3_000;
pub const DEFAULT_TYPING_THROTTLE_MS: u64 = 2_000;
pub const DEFAULT_LEDGER_CONFIRMATION_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_LEDGER_CONFIRMATION_POLL_MS: u64 = 500;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;

/// Timing knobs for one chat session, resolved from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub default_mode: MessageOrigin,
    pub poll_interval: Duration,
    pub ledger_poll_interval: Duration,
    pub presence_interval: Duration,
    pub typing_expiry: Duration,
    pub typing_throttle: Duration,
    pub ledger_confirmation_timeout: Duration,
    pub ledger_confirmation_poll: Duration,
    pub failure_threshold: u32,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl SessionSettings {
    /// History poll cadence for the given mode. The ledger is polled on its
    /// own interval because it has no push channel.
    pub fn poll_interval_for(&self, mode: MessageOrigin) -> Duration {
        match mode {
            MessageOrigin::Conventional => self.poll_interval,
            MessageOrigin::LedgerBacked => self.ledger_poll_interval,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Config::default().session_settings()
    }
}

/// Where each backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api_base_url: String,
    pub socket_url: String,
    pub ledger_base_url: String,
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.filter(|v| *v > 0).unwrap_or(default))
}

impl Config {
    pub fn default_mode(&self) -> MessageOrigin {
        self.default_mode.unwrap_or(MessageOrigin::Conventional)
    }

    pub fn use_keyring(&self) -> bool {
        self.use_keyring.unwrap_or(true)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            api_base_url: self
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            socket_url: self
                .socket_url
                .clone()
                .unwrap_or_else(|| DEFAULT_SOCKET_URL.to_string()),
            ledger_base_url: self
                .ledger_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_LEDGER_BASE_URL.to_string()),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            default_mode: self.default_mode(),
            poll_interval: millis(self.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS),
            ledger_poll_interval: millis(
                self.ledger_poll_interval_ms,
                DEFAULT_LEDGER_POLL_INTERVAL_MS,
            ),
            presence_interval: millis(self.presence_interval_ms, DEFAULT_PRESENCE_INTERVAL_MS),
            typing_expiry: millis(self.typing_expiry_ms, DEFAULT_TYPING_EXPIRY_MS),
            typing_throttle: millis(self.typing_throttle_ms, DEFAULT_TYPING_THROTTLE_MS),
            ledger_confirmation_timeout: millis(
                self.ledger_confirmation_timeout_ms,
                DEFAULT_LEDGER_CONFIRMATION_TIMEOUT_MS,
            ),
            ledger_confirmation_poll: millis(
                self.ledger_confirmation_poll_ms,
                DEFAULT_LEDGER_CONFIRMATION_POLL_MS,
            ),
            failure_threshold: self
                .failure_threshold
                .filter(|threshold| *threshold > 0)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            request_timeout: millis(self.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect_delay: millis(self.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY_MS),
        }
    }
}
