//! JSON shapes exchanged with the chat backend, the live socket and the ledger.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::core::message::{ClientKey, Message, MessageOrigin, Reactions, TransactionRef};

/// Identifier the backend may send as either a string or a number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Text(String),
    Integer(i64),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            IdValue::Text(text) => text,
            IdValue::Integer(number) => number.to_string(),
        }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdValue::deserialize(deserializer).map(IdValue::into_string)
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<IdValue>::deserialize(deserializer).map(|value| value.map(IdValue::into_string))
}

/// Timestamp as RFC 3339 text, epoch milliseconds, or numeric text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TimestampValue {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl TimestampValue {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            TimestampValue::Millis(millis) => Utc.timestamp_millis_opt(*millis).single(),
            TimestampValue::Fractional(millis) => {
                Utc.timestamp_millis_opt(millis.round() as i64).single()
            }
            TimestampValue::Text(text) => {
                let trimmed = text.trim();
                DateTime::parse_from_rfc3339(trimmed)
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .ok()
                    .or_else(|| {
                        trimmed
                            .parse::<i64>()
                            .ok()
                            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                    })
            }
        }
    }
}

/// A message as returned by history endpoints and the `receive_message` event.
///
/// The body is accepted under either `message` or `content`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(deserialize_with = "deserialize_id")]
    pub sender_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<TimestampValue>,
    #[serde(default)]
    pub reactions: Option<HashMap<String, u32>>,
    #[serde(default, alias = "transaction", alias = "tx_hash")]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
}

impl WireMessage {
    pub fn body(&self) -> Option<&str> {
        self.message.as_deref().or(self.content.as_deref())
    }

    pub fn into_message(self, origin: MessageOrigin) -> Result<Message, String> {
        let body = self
            .body()
            .map(str::to_string)
            .ok_or_else(|| "message has no body".to_string())?;
        let timestamp = self
            .timestamp
            .as_ref()
            .and_then(TimestampValue::to_datetime)
            .ok_or_else(|| "message has no usable timestamp".to_string())?;

        let mut message = Message::confirmed(self.sender_id, body, timestamp, origin);
        if let Some(reactions) = self.reactions {
            message.reactions = reactions.into_iter().collect::<Reactions>();
        }
        if let Some(transaction) = self.transaction_id.filter(|tx| !tx.trim().is_empty()) {
            message.transaction = Some(TransactionRef(transaction));
        }
        if let Some(key) = self.client_key.filter(|key| !key.trim().is_empty()) {
            message.client_key = Some(ClientKey(key));
        }
        Ok(message)
    }
}

/// Converts a history payload, skipping entries that cannot be rendered.
pub fn messages_from_wire(entries: Vec<WireMessage>, origin: MessageOrigin) -> Vec<Message> {
    entries
        .into_iter()
        .filter_map(|entry| match entry.into_message(origin) {
            Ok(message) => Some(message),
            Err(reason) => {
                warn!(%origin, %reason, "Skipping history entry");
                None
            }
        })
        .collect()
}

/// History endpoints answer with either a bare list or `{ "messages": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum HistoryResponse {
    List(Vec<WireMessage>),
    Wrapped { messages: Vec<WireMessage> },
}

impl HistoryResponse {
    pub fn into_entries(self) -> Vec<WireMessage> {
        match self {
            HistoryResponse::List(entries) => entries,
            HistoryResponse::Wrapped { messages } => messages,
        }
    }
}

/// Envelope for every websocket frame in both directions.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a, T: Serialize> {
    pub event: &'a str,
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub const EVENT_REGISTER: &str = "register";
pub const EVENT_SEND_MESSAGE: &str = "send_message";
pub const EVENT_RECEIVE_MESSAGE: &str = "receive_message";
pub const EVENT_TYPING: &str = "typing";

#[derive(Debug, Serialize)]
pub struct RegisterPayload<'a> {
    #[serde(rename = "userId")]
    pub user_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SendMessagePayload<'a> {
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<&'a str>,
    pub content: &'a str,
    pub client_key: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TypingPayload<'a> {
    pub receiver_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct LedgerSubmitRequest<'a> {
    pub chat_id: &'a str,
    pub sender_id: &'a str,
    pub content: &'a str,
    pub client_key: &'a str,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct LedgerSubmitResponse {
    #[serde(alias = "transaction", alias = "tx_hash")]
    pub transaction_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Pending,
    Confirmed,
    Failed,
}

impl LedgerStatus {
    pub fn parse(raw: Option<&str>) -> LedgerStatus {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("confirmed") | Some("success") | Some("finalized") => LedgerStatus::Confirmed,
            Some("failed") | Some("rejected") | Some("dropped") => LedgerStatus::Failed,
            _ => LedgerStatus::Pending,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LedgerTransactionStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<TimestampValue>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PresenceResponse {
    #[serde(alias = "isOnline", alias = "is_online")]
    pub online: bool,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub user_id: Option<String>,
}
