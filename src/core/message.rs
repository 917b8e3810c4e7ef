use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which delivery backend produced (or will produce) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MessageOrigin {
    Conventional,
    LedgerBacked,
}

impl MessageOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageOrigin::Conventional => "conventional",
            MessageOrigin::LedgerBacked => "ledger",
        }
    }

    /// The other backend; toggling twice is the identity.
    pub fn toggled(self) -> Self {
        match self {
            MessageOrigin::Conventional => MessageOrigin::LedgerBacked,
            MessageOrigin::LedgerBacked => MessageOrigin::Conventional,
        }
    }
}

impl fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MessageOrigin {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "conventional" | "standard" | "socket" => Ok(MessageOrigin::Conventional),
            "ledger" | "ledger-backed" | "ledger_backed" | "decentralized" => {
                Ok(MessageOrigin::LedgerBacked)
            }
            other => Err(format!("invalid transport mode: {other}")),
        }
    }
}

impl TryFrom<String> for MessageOrigin {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<MessageOrigin> for String {
    fn from(value: MessageOrigin) -> Self {
        value.as_str().to_string()
    }
}

/// Reference to a ledger transaction carrying one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionRef(pub String);

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-generated idempotency key attached to every locally initiated send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(pub String);

impl ClientKey {
    /// Generates a fresh key from 16 bytes of OS randomness.
    ///
    /// Falls back to a clock-derived key when the OS source is unavailable so a
    /// send is never blocked on entropy; uniqueness within one client is all the
    /// reconciliation path relies on.
    pub fn generate() -> Self {
        let mut bytes = [0_u8; 16];
        if getrandom::fill(&mut bytes).is_err() {
            let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            bytes[..8].copy_from_slice(&nanos.to_le_bytes());
        }
        ClientKey(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Emoji → count. Keys are unique; iteration order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<String, u32>);

impl Reactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, emoji: &str) -> u32 {
        let count = self.0.entry(emoji.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn count(&self, emoji: &str) -> u32 {
        self.0.get(emoji).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(emoji, count)| (emoji.as_str(), *count))
    }
}

impl FromIterator<(String, u32)> for Reactions {
    fn from_iter<I: IntoIterator<Item = (String, u32)>>(iter: I) -> Self {
        let mut map = BTreeMap::new();
        for (emoji, count) in iter {
            if count > 0 {
                *map.entry(emoji).or_insert(0) += count;
            }
        }
        Reactions(map)
    }
}

/// Stable identity of a confirmed message, used to deduplicate merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageIdentity {
    /// Conventional transport: author, server timestamp and text. The body
    /// keeps two messages stamped within the same second apart.
    Server {
        sender_id: String,
        timestamp_millis: i64,
        body: String,
    },
    /// Ledger transport: the transaction that recorded the message.
    Transaction(TransactionRef),
}

/// A single chat entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub origin: MessageOrigin,
    /// True from local optimistic insertion until the send resolves.
    #[serde(default)]
    pub pending: bool,
    /// Ledger send whose confirmation never resolved; still shown.
    #[serde(default)]
    pub unconfirmed: bool,
    #[serde(default)]
    pub reactions: Reactions,
    #[serde(default)]
    pub transaction: Option<TransactionRef>,
    #[serde(default)]
    pub client_key: Option<ClientKey>,
}

impl Message {
    /// A confirmed entry as delivered by history or the live channel.
    pub fn confirmed(
        sender_id: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
        origin: MessageOrigin,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            body: body.into(),
            timestamp,
            origin,
            pending: false,
            unconfirmed: false,
            reactions: Reactions::new(),
            transaction: None,
            client_key: None,
        }
    }

    /// An optimistic local echo for a send that has not resolved yet.
    pub fn pending_echo(
        sender_id: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
        origin: MessageOrigin,
        client_key: ClientKey,
    ) -> Self {
        Self {
            pending: true,
            client_key: Some(client_key),
            ..Self::confirmed(sender_id, body, timestamp, origin)
        }
    }

    pub fn with_transaction(mut self, transaction: TransactionRef) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_client_key(mut self, client_key: ClientKey) -> Self {
        self.client_key = Some(client_key);
        self
    }

    pub fn with_reactions(mut self, reactions: Reactions) -> Self {
        self.reactions = reactions;
        self
    }

    /// Locally created entry that has no canonical server counterpart yet.
    pub fn is_local_echo(&self) -> bool {
        self.pending || self.unconfirmed
    }

    /// Identity used for deduplication; local echoes have none.
    pub fn identity(&self) -> Option<MessageIdentity> {
        if self.is_local_echo() {
            return None;
        }
        if self.origin == MessageOrigin::LedgerBacked {
            if let Some(transaction) = &self.transaction {
                return Some(MessageIdentity::Transaction(transaction.clone()));
            }
        }
        Some(MessageIdentity::Server {
            sender_id: self.sender_id.clone(),
            timestamp_millis: self.timestamp.timestamp_millis(),
            body: self.body.clone(),
        })
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}
