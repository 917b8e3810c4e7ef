use std::time::Instant;

use chrono::{DateTime, Utc};

use super::{ChatSession, SessionMode};
use crate::core::message::{ClientKey, MessageOrigin};

/// Everything a rendering layer needs to draw one chat screen.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub state: &'static str,
    pub mode: SessionMode,
    pub generation: u64,
    pub messages: Vec<MessageView>,
    pub partner_typing: bool,
    pub partner_online: Option<bool>,
    pub live_connected: bool,
    /// Set when the user must re-authenticate before anything loads.
    pub identity_missing: bool,
    pub load_error: Option<String>,
    pub failed_sends: Vec<FailedSendView>,
    /// Target mode while a switch awaits confirmation.
    pub mode_switch_prompt: Option<SessionMode>,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub is_me: bool,
    pub sender_id: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub pending: bool,
    pub unconfirmed: bool,
    pub reactions: Vec<(String, u32)>,
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedSendView {
    pub client_key: ClientKey,
    pub body: String,
    pub error: String,
    pub unconfirmed: bool,
}

impl SessionSnapshot {
    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|message| message.pending).count()
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            conversation_id: String::new(),
            state: "uninitialized",
            mode: MessageOrigin::Conventional,
            generation: 0,
            messages: Vec::new(),
            partner_typing: false,
            partner_online: None,
            live_connected: false,
            identity_missing: false,
            load_error: None,
            failed_sends: Vec::new(),
            mode_switch_prompt: None,
            notice: None,
        }
    }
}

impl ChatSession {
    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let me = self.local_user().unwrap_or_default();
        let messages = self
            .log()
            .iter()
            .map(|message| MessageView {
                is_me: !me.is_empty() && message.is_from(me),
                sender_id: message.sender_id.clone(),
                body: message.body.clone(),
                timestamp: message.timestamp,
                pending: message.pending,
                unconfirmed: message.unconfirmed,
                reactions: message
                    .reactions
                    .iter()
                    .map(|(emoji, count)| (emoji.to_string(), count))
                    .collect(),
                origin: message.origin,
            })
            .collect();

        SessionSnapshot {
            conversation_id: self.conversation_id().to_string(),
            state: self.state().label(),
            mode: self.mode(),
            generation: self.generation(),
            messages,
            partner_typing: self.partner_typing(now),
            partner_online: self.partner_online(),
            live_connected: self.live_connected(),
            identity_missing: self.identity_missing(),
            load_error: self.visible_load_error().map(ToString::to_string),
            failed_sends: self
                .failed_sends()
                .iter()
                .map(|failed| FailedSendView {
                    client_key: failed.client_key.clone(),
                    body: failed.body.clone(),
                    error: failed.error.to_string(),
                    unconfirmed: failed.unconfirmed,
                })
                .collect(),
            mode_switch_prompt: self.mode_switch_prompt(),
            notice: self.notice().map(ToString::to_string),
        }
    }
}
