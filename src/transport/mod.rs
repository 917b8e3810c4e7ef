//! Message delivery backends.
//!
//! Both backends implement [`Transport`] so the session controller is written
//! once against the trait:
//! - [`conventional::ConventionalTransport`] pulls history over REST and pushes
//!   sends, typing signals and inbound messages over a websocket.
//! - [`ledger::LedgerTransport`] submits each message as a ledger transaction
//!   and waits for confirmation; it has no push channel and is polled.
//! - [`memory_ledger::MemoryLedger`] is an in-process ledger with the same
//!   two-phase semantics, used offline and in tests.
//!
//! Every network or decoding failure is converted to [`TransportError`] here;
//! callers never see a raw `reqwest` or websocket error.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::message::{ClientKey, Message, MessageOrigin, TransactionRef};

pub mod conventional;
pub mod ledger;
pub mod live;
pub mod memory_ledger;
pub mod wire;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connectivity problem or timeout. Retried on the next poll tick.
    NetworkFailure(String),
    /// The server answered with a non-success response.
    ServerRejected {
        status: Option<u16>,
        message: String,
    },
    /// The result belongs to a mode/session generation that is no longer current.
    StaleGeneration,
    /// The response arrived but could not be decoded.
    Malformed(String),
    /// A ledger transaction was submitted but never confirmed within the bounded wait.
    ConfirmationTimeout { transaction: TransactionRef },
    /// A conventional send was attempted while the live socket is down.
    LiveChannelClosed,
}

impl TransportError {
    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        TransportError::ServerRejected {
            status,
            message: message.into(),
        }
    }

    /// Failures the poll loop expects to clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::NetworkFailure(_) | TransportError::LiveChannelClosed
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NetworkFailure(detail) => write!(f, "network failure: {detail}"),
            TransportError::ServerRejected {
                status: Some(status),
                message,
            } => write!(f, "server rejected request ({status}): {message}"),
            TransportError::ServerRejected {
                status: None,
                message,
            } => write!(f, "server rejected request: {message}"),
            TransportError::StaleGeneration => f.write_str("result belongs to a previous session"),
            TransportError::Malformed(detail) => write!(f, "malformed response: {detail}"),
            TransportError::ConfirmationTimeout { transaction } => {
                write!(f, "transaction {transaction} was not confirmed in time")
            }
            TransportError::LiveChannelClosed => f.write_str("live channel is not connected"),
        }
    }
}

impl StdError for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::rejected(Some(status.as_u16()), err.to_string())
        } else {
            TransportError::NetworkFailure(err.to_string())
        }
    }
}

/// Maps a non-2xx answer to `ServerRejected` and decodes the body otherwise.
pub(crate) async fn decode_json_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(TransportError::rejected(Some(status.as_u16()), error_text));
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| TransportError::Malformed(err.to_string()))
}

/// One locally initiated send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub body: String,
    pub client_key: ClientKey,
}

/// Acknowledgement of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub accepted_at: DateTime<Utc>,
    /// Present for ledger sends.
    pub transaction: Option<TransactionRef>,
}

type MessageCallback = dyn Fn(Message) + Send + Sync;
type SignalCallback = dyn Fn() + Send + Sync;
type ConnectionCallback = dyn Fn(bool) + Send + Sync;

/// Callbacks invoked by a live subscription.
#[derive(Clone)]
pub struct LiveHandlers {
    pub on_message: Arc<MessageCallback>,
    pub on_typing: Arc<SignalCallback>,
    pub on_connection: Arc<ConnectionCallback>,
}

impl LiveHandlers {
    pub fn new(
        on_message: impl Fn(Message) + Send + Sync + 'static,
        on_typing: impl Fn() + Send + Sync + 'static,
        on_connection: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_message: Arc::new(on_message),
            on_typing: Arc::new(on_typing),
            on_connection: Arc::new(on_connection),
        }
    }
}

impl fmt::Debug for LiveHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveHandlers").finish_non_exhaustive()
    }
}

/// How long `Subscription::close` waits for the channel task before aborting it.
pub const SUBSCRIPTION_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Handle to an open live channel. Closing or dropping it tears the channel down.
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels the channel and waits for its task to wind down, aborting it
    /// after [`SUBSCRIPTION_CLOSE_GRACE`].
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SUBSCRIPTION_CLOSE_GRACE, &mut task)
                .await
                .is_err()
            {
                warn!("Live channel task ignored cancellation; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The narrow contract both delivery backends satisfy.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> MessageOrigin;

    async fn send_message(&self, message: &OutgoingMessage)
        -> Result<Confirmation, TransportError>;

    /// Full history for a conversation, oldest first. Safe to call repeatedly.
    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError>;

    /// Opens a push channel. `Ok(None)` means the backend has none and must be polled.
    async fn subscribe_live(
        &self,
        _user_id: &str,
        _handlers: LiveHandlers,
    ) -> Result<Option<Subscription>, TransportError> {
        Ok(None)
    }

    /// Fire-and-forget partner typing notification.
    async fn signal_typing(&self, _receiver_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// `Ok(None)` when the backend cannot report presence.
    async fn fetch_presence(&self, _user_id: &str) -> Result<Option<bool>, TransportError> {
        Ok(None)
    }
}

/// The pair of backends a session can switch between.
#[derive(Clone)]
pub struct TransportSet {
    pub conventional: Arc<dyn Transport>,
    pub ledger: Arc<dyn Transport>,
}

impl TransportSet {
    pub fn new(conventional: Arc<dyn Transport>, ledger: Arc<dyn Transport>) -> Self {
        Self {
            conventional,
            ledger,
        }
    }

    pub fn for_mode(&self, mode: MessageOrigin) -> Arc<dyn Transport> {
        match mode {
            MessageOrigin::Conventional => Arc::clone(&self.conventional),
            MessageOrigin::LedgerBacked => Arc::clone(&self.ledger),
        }
    }
}
