//! HTTP ledger backend: signed submit, then poll the transaction until it settles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::config::{Endpoints, SessionSettings};
use crate::core::credentials::{ledger_signing_payload, CredentialCache};
use crate::core::identity::IdentityStore;
use crate::core::message::{Message, MessageOrigin, TransactionRef};
use crate::transport::wire::{
    messages_from_wire, HistoryResponse, LedgerStatus, LedgerSubmitRequest,
    LedgerSubmitResponse, LedgerTransactionStatus,
};
use crate::transport::{
    decode_json_response, Confirmation, OutgoingMessage, Transport, TransportError,
};
use crate::utils::url::{construct_api_url, encode_path_segment};

pub struct LedgerTransport {
    client: reqwest::Client,
    ledger_base_url: String,
    store: Arc<dyn IdentityStore>,
    credentials: Arc<CredentialCache>,
    confirmation_timeout: Duration,
    confirmation_poll: Duration,
}

impl LedgerTransport {
    pub fn new(
        client: reqwest::Client,
        endpoints: &Endpoints,
        settings: &SessionSettings,
        store: Arc<dyn IdentityStore>,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            client,
            ledger_base_url: endpoints.ledger_base_url.clone(),
            store,
            credentials,
            confirmation_timeout: settings.ledger_confirmation_timeout,
            confirmation_poll: settings.ledger_confirmation_poll,
        }
    }

    async fn submit(&self, message: &OutgoingMessage) -> Result<LedgerSubmitResponse, TransportError> {
        let keypair = self
            .credentials
            .get_or_init(self.store.as_ref())
            .await
            .map_err(|err| {
                TransportError::rejected(None, format!("ledger credentials unavailable: {err}"))
            })?;
        let payload = ledger_signing_payload(
            &message.conversation_id,
            &message.sender_id,
            &message.body,
            message.client_key.as_str(),
        );
        let request = LedgerSubmitRequest {
            chat_id: &message.conversation_id,
            sender_id: &message.sender_id,
            content: &message.body,
            client_key: message.client_key.as_str(),
            public_key: keypair.public_key_b64(),
            signature: keypair.sign_b64(&payload),
        };

        let response = self
            .client
            .post(construct_api_url(&self.ledger_base_url, "messages"))
            .json(&request)
            .send()
            .await?;
        decode_json_response(response).await
    }

    async fn transaction_status(
        &self,
        transaction: &TransactionRef,
    ) -> Result<LedgerTransactionStatus, TransportError> {
        let endpoint = format!("transactions/{}", encode_path_segment(&transaction.0));
        let response = self
            .client
            .get(construct_api_url(&self.ledger_base_url, &endpoint))
            .send()
            .await?;
        decode_json_response(response).await
    }

    /// Polls until the transaction is confirmed or failed. Lookup errors are
    /// treated as "still pending"; the caller bounds the wait.
    async fn await_settlement(
        &self,
        transaction: &TransactionRef,
    ) -> Result<Confirmation, TransportError> {
        loop {
            tokio::time::sleep(self.confirmation_poll).await;
            let status = match self.transaction_status(transaction).await {
                Ok(status) => status,
                Err(err) => {
                    debug!(%transaction, error = %err, "Transaction lookup failed, retrying");
                    continue;
                }
            };
            match LedgerStatus::parse(status.status.as_deref()) {
                LedgerStatus::Pending => continue,
                LedgerStatus::Confirmed => {
                    let accepted_at = status
                        .timestamp
                        .as_ref()
                        .and_then(|timestamp| timestamp.to_datetime())
                        .unwrap_or_else(Utc::now);
                    return Ok(Confirmation {
                        accepted_at,
                        transaction: Some(transaction.clone()),
                    });
                }
                LedgerStatus::Failed => {
                    let reason = status
                        .error
                        .unwrap_or_else(|| "transaction failed".to_string());
                    return Err(TransportError::rejected(None, reason));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LedgerTransport {
    fn kind(&self) -> MessageOrigin {
        MessageOrigin::LedgerBacked
    }

    async fn send_message(
        &self,
        message: &OutgoingMessage,
    ) -> Result<Confirmation, TransportError> {
        let submitted = self.submit(message).await?;
        let transaction = TransactionRef(submitted.transaction_id);
        info!(%transaction, client_key = %message.client_key, "Submitted ledger transaction");

        match LedgerStatus::parse(submitted.status.as_deref()) {
            LedgerStatus::Confirmed => {
                return Ok(Confirmation {
                    accepted_at: Utc::now(),
                    transaction: Some(transaction),
                })
            }
            LedgerStatus::Failed => {
                return Err(TransportError::rejected(None, "transaction rejected on submit"))
            }
            LedgerStatus::Pending => {}
        }

        match tokio::time::timeout(
            self.confirmation_timeout,
            self.await_settlement(&transaction),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    %transaction,
                    timeout_ms = self.confirmation_timeout.as_millis() as u64,
                    "Ledger confirmation timed out"
                );
                Err(TransportError::ConfirmationTimeout { transaction })
            }
        }
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError> {
        let endpoint = format!("chats/{}/messages", encode_path_segment(conversation_id));
        let response = self
            .client
            .get(construct_api_url(&self.ledger_base_url, &endpoint))
            .send()
            .await?;
        let history: HistoryResponse = decode_json_response(response).await?;
        Ok(messages_from_wire(
            history.into_entries(),
            MessageOrigin::LedgerBacked,
        ))
    }
}
