//! In-process ledger with the same submit/confirm semantics as the HTTP one.
//!
//! Handles are cheap clones of shared state, so a test can keep one to steer
//! confirmations while the session owns another. Backs `chat --offline`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::core::message::{ClientKey, Message, MessageOrigin, TransactionRef};
use crate::transport::{Confirmation, OutgoingMessage, Transport, TransportError};

/// What happens to the next submitted transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationBehavior {
    #[default]
    Confirm,
    Fail,
    NeverConfirm,
}

#[derive(Debug, Default)]
struct LedgerState {
    confirmation_delay: Duration,
    confirmation_timeout: Duration,
    behavior: ConfirmationBehavior,
    next_transaction: u64,
    pending: HashMap<TransactionRef, OutgoingMessage>,
    chats: HashMap<String, Vec<Message>>,
}

impl LedgerState {
    fn next_transaction(&mut self) -> TransactionRef {
        self.next_transaction += 1;
        TransactionRef(format!("0x{:016x}", self.next_transaction))
    }

    fn append(&mut self, chat_id: &str, message: Message) {
        let entries = self.chats.entry(chat_id.to_string()).or_default();
        let at = entries.partition_point(|entry| entry.timestamp <= message.timestamp);
        entries.insert(at, message);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new(confirmation_delay: Duration, confirmation_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                confirmation_delay,
                confirmation_timeout,
                ..LedgerState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_behavior(&self, behavior: ConfirmationBehavior) {
        self.state().behavior = behavior;
    }

    /// Transactions submitted but not yet settled.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Writes an already-confirmed message, as if another client had sent it.
    pub fn record(&self, chat_id: &str, sender_id: &str, body: &str) -> TransactionRef {
        let mut state = self.state();
        let transaction = state.next_transaction();
        let message = Message::confirmed(sender_id, body, Utc::now(), MessageOrigin::LedgerBacked)
            .with_transaction(transaction.clone());
        state.append(chat_id, message);
        transaction
    }

    fn settle(&self, transaction: &TransactionRef) -> Option<Confirmation> {
        let mut state = self.state();
        let message = state.pending.remove(transaction)?;
        let accepted_at = Utc::now();
        let entry = Message::confirmed(
            message.sender_id,
            message.body,
            accepted_at,
            MessageOrigin::LedgerBacked,
        )
        .with_transaction(transaction.clone())
        .with_client_key(ClientKey(message.client_key.0));
        state.append(&message.conversation_id, entry);
        Some(Confirmation {
            accepted_at,
            transaction: Some(transaction.clone()),
        })
    }

    fn discard(&self, transaction: &TransactionRef) {
        self.state().pending.remove(transaction);
    }
}

/// Drops a submission from `pending` when its send future goes away, whether
/// it settled or was cancelled mid-wait.
struct PendingGuard<'a> {
    ledger: &'a MemoryLedger,
    transaction: TransactionRef,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.ledger.discard(&self.transaction);
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(Duration::from_millis(800), Duration::from_secs(15))
    }
}

#[async_trait]
impl Transport for MemoryLedger {
    fn kind(&self) -> MessageOrigin {
        MessageOrigin::LedgerBacked
    }

    async fn send_message(
        &self,
        message: &OutgoingMessage,
    ) -> Result<Confirmation, TransportError> {
        let (transaction, behavior, delay, timeout) = {
            let mut state = self.state();
            let transaction = state.next_transaction();
            state.pending.insert(transaction.clone(), message.clone());
            (
                transaction,
                state.behavior,
                state.confirmation_delay,
                state.confirmation_timeout,
            )
        };
        debug!(%transaction, ?behavior, "Simulated ledger accepted submission");
        let _guard = PendingGuard {
            ledger: self,
            transaction: transaction.clone(),
        };

        match behavior {
            ConfirmationBehavior::Confirm => {
                tokio::time::sleep(delay).await;
                self.settle(&transaction).ok_or_else(|| {
                    TransportError::rejected(None, "transaction dropped before confirmation")
                })
            }
            ConfirmationBehavior::Fail => {
                tokio::time::sleep(delay).await;
                Err(TransportError::rejected(
                    None,
                    "simulated ledger rejected the transaction",
                ))
            }
            ConfirmationBehavior::NeverConfirm => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::ConfirmationTimeout { transaction })
            }
        }
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError> {
        Ok(self
            .state()
            .chats
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
