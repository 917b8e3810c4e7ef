//! The per-conversation message log and the merge that folds poll results and
//! live pushes into it.
//!
//! Merging is a pure function of (log, incoming batch) so it can be exercised
//! without timers or sockets. Two invariants hold after every merge:
//! - entries are sorted by timestamp ascending;
//! - entries already in the log keep their relative order; a merge only
//!   inserts confirmed entries or removes local echoes.

use std::collections::HashSet;

use crate::core::message::{ClientKey, Message, MessageIdentity};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationLog {
    entries: Vec<Message>,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Confirmed entries that were new to the log.
    pub inserted: usize,
    /// Incoming entries already present by identity.
    pub duplicates: usize,
    /// Client keys of local echoes replaced by their canonical entry.
    pub reconciled: Vec<ClientKey>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || !self.reconciled.is_empty()
    }
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a fresh log from a history response.
    pub fn from_history(history: Vec<Message>) -> Self {
        merge(Self::new(), history).0
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.entries.get(index)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Inserts an optimistic local echo at its timestamp position.
    pub fn push_local_echo(&mut self, echo: Message) {
        let position = insertion_point(&self.entries, &echo);
        self.entries.insert(position, echo);
    }

    pub fn position_of_client_key(&self, key: &ClientKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_local_echo() && entry.client_key.as_ref() == Some(key))
    }

    /// Removes the local echo created for `key`, if it is still in the log.
    pub fn remove_local_echo(&mut self, key: &ClientKey) -> Option<Message> {
        self.position_of_client_key(key)
            .map(|index| self.entries.remove(index))
    }

    /// Flips a pending echo to "unconfirmed": still visible, no longer pending.
    pub fn mark_unconfirmed(&mut self, key: &ClientKey) -> bool {
        match self.position_of_client_key(key) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.pending = false;
                entry.unconfirmed = true;
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self, sender_id: &str, body: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.pending && entry.sender_id == sender_id && entry.body == body)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.pending).count()
    }

    /// Local-first reaction; returns the new count for `emoji`.
    pub fn add_reaction(&mut self, index: usize, emoji: &str) -> Option<u32> {
        self.entries
            .get_mut(index)
            .map(|entry| entry.reactions.add(emoji))
    }

    pub fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    }
}

/// Folds `incoming` confirmed entries into `log`.
///
/// For each incoming entry, in timestamp order:
/// 1. skip it if an entry with the same identity is already present;
/// 2. otherwise drop the local echo it confirms (only the echo with the same
///    client key when the server echoed one, else the oldest echo with the
///    same sender and body);
/// 3. insert it after every entry with an equal or earlier timestamp.
///
/// Reconciliation only runs for entries that are new to the log, so a poll
/// repeating an older identical message never swallows a fresh pending send.
pub fn merge(
    log: ConversationLog,
    incoming: impl IntoIterator<Item = Message>,
) -> (ConversationLog, MergeOutcome) {
    let mut entries = log.entries;
    let mut outcome = MergeOutcome::default();
    let mut seen: HashSet<MessageIdentity> =
        entries.iter().filter_map(Message::identity).collect();

    let mut batch: Vec<Message> = incoming.into_iter().collect();
    batch.sort_by_key(|message| message.timestamp);

    for mut message in batch {
        message.pending = false;
        message.unconfirmed = false;

        let Some(identity) = message.identity() else {
            continue;
        };
        if seen.contains(&identity) {
            outcome.duplicates += 1;
            continue;
        }

        if let Some(index) = find_echo_for(&entries, &message) {
            let echo = entries.remove(index);
            if message.reactions.is_empty() && !echo.reactions.is_empty() {
                message.reactions = echo.reactions.clone();
            }
            if let Some(key) = echo.client_key {
                if message.client_key.is_none() {
                    message.client_key = Some(key.clone());
                }
                outcome.reconciled.push(key);
            }
        }

        let position = insertion_point(&entries, &message);
        entries.insert(position, message);
        seen.insert(identity);
        outcome.inserted += 1;
    }

    (ConversationLog { entries }, outcome)
}

fn find_echo_for(entries: &[Message], confirmed: &Message) -> Option<usize> {
    // A keyed entry only ever confirms the send that carried that key.
    if let Some(key) = &confirmed.client_key {
        return entries
            .iter()
            .position(|entry| entry.is_local_echo() && entry.client_key.as_ref() == Some(key));
    }

    entries.iter().position(|entry| {
        entry.is_local_echo()
            && entry.sender_id == confirmed.sender_id
            && entry.body == confirmed.body
    })
}

fn insertion_point(entries: &[Message], message: &Message) -> usize {
    entries.partition_point(|entry| entry.timestamp <= message.timestamp)
}
