//! The chat session controller.
//!
//! [`ChatSession`] owns one conversation log and the state machine around it:
//!
//! ```text
//! Uninitialized → Loading(mode) → Ready(mode) ⟲ (polls, pushes, sends)
//!                                   ↓ request
//!                          SwitchingMode{from, to} → confirm → Loading(to)
//! any state → Closed
//! ```
//!
//! The controller performs no I/O. It is driven by [`SessionAction`]s and
//! answers with [`SessionCommand`]s that the runtime executes. Every command
//! that starts asynchronous work carries the generation it was issued under;
//! a result tagged with any other generation is dropped on arrival.

pub mod actions;
pub mod snapshot;
pub mod typing;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::config::SessionSettings;
use crate::core::conversation::{merge, ConversationLog};
use crate::core::message::{ClientKey, Message, MessageOrigin};
use crate::transport::{Confirmation, OutgoingMessage, TransportError};

pub use actions::{
    apply_action, apply_actions, send_resolved_action, SessionAction, SessionActionContext,
    SessionActionDispatcher, SessionActionEnvelope, SessionCommand,
};
pub use snapshot::{FailedSendView, MessageView, SessionSnapshot};
pub use typing::TypingIndicator;

/// The transport a session is currently bound to.
pub type SessionMode = MessageOrigin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Loading(SessionMode),
    Ready(SessionMode),
    /// Awaiting user confirmation. `loaded` remembers whether the state being
    /// left was `Ready`, so cancelling returns there.
    SwitchingMode {
        from: SessionMode,
        to: SessionMode,
        loaded: bool,
    },
    Closed,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Loading(_) => "loading",
            SessionState::Ready(_) => "ready",
            SessionState::SwitchingMode { .. } => "switching-mode",
            SessionState::Closed => "closed",
        }
    }
}

/// Errors returned to the user for actions they initiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No local user id; the session cannot start until the user logs in.
    IdentityUnavailable,
    /// The action needs a loaded session.
    NotReady,
    EmptyMessage,
    /// The same text is already waiting for delivery.
    DuplicatePending,
    Closed,
    /// No message or failed send at the given position / key.
    UnknownMessage,
    InvalidReaction,
    NoModeSwitchPending,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::IdentityUnavailable => {
                f.write_str("no signed-in user; run `sparkchat login <user-id>` first")
            }
            SessionError::NotReady => f.write_str("conversation is still loading"),
            SessionError::EmptyMessage => f.write_str("message is empty"),
            SessionError::DuplicatePending => {
                f.write_str("an identical message is still being delivered")
            }
            SessionError::Closed => f.write_str("conversation is closed"),
            SessionError::UnknownMessage => f.write_str("no such message"),
            SessionError::InvalidReaction => f.write_str("reaction must not be blank"),
            SessionError::NoModeSwitchPending => f.write_str("no mode switch to confirm"),
        }
    }
}

impl StdError for SessionError {}

/// A send that did not go through. Kept so the text can be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedSend {
    pub client_key: ClientKey,
    pub body: String,
    pub error: TransportError,
    /// The entry is still in the log, marked unconfirmed.
    pub unconfirmed: bool,
}

pub struct ChatSession {
    conversation_id: String,
    partner_id: Option<String>,
    settings: SessionSettings,
    local_user: Option<String>,
    identity_missing: bool,
    state: SessionState,
    mode: SessionMode,
    generation: u64,
    log: ConversationLog,
    typing: TypingIndicator,
    partner_online: Option<bool>,
    live_open: bool,
    live_supported: bool,
    live_connected: bool,
    history_in_flight: bool,
    loaded_once: bool,
    consecutive_failures: u32,
    last_load_error: Option<TransportError>,
    /// Body of every unresolved send, by client key.
    in_flight_sends: HashMap<ClientKey, String>,
    failed_sends: Vec<FailedSend>,
    last_typing_sent: Option<Instant>,
    notice: Option<SessionError>,
}

impl ChatSession {
    pub fn new(
        conversation_id: impl Into<String>,
        partner_id: Option<String>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            partner_id: partner_id.filter(|id| !id.trim().is_empty()),
            mode: settings.default_mode,
            settings,
            local_user: None,
            identity_missing: false,
            state: SessionState::Uninitialized,
            generation: 0,
            log: ConversationLog::new(),
            typing: TypingIndicator::new(),
            partner_online: None,
            live_open: false,
            live_supported: true,
            live_connected: false,
            history_in_flight: false,
            loaded_once: false,
            consecutive_failures: 0,
            last_load_error: None,
            in_flight_sends: HashMap::new(),
            failed_sends: Vec::new(),
            last_typing_sent: None,
            notice: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn partner_id(&self) -> Option<&str> {
        self.partner_id.as_deref()
    }

    pub fn local_user(&self) -> Option<&str> {
        self.local_user.as_deref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current_generation(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn failed_sends(&self) -> &[FailedSend] {
        &self.failed_sends
    }

    pub fn partner_typing(&self, now: Instant) -> bool {
        self.typing.is_active(now)
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing.deadline()
    }

    pub fn partner_online(&self) -> Option<bool> {
        self.partner_online
    }

    pub fn live_connected(&self) -> bool {
        self.live_connected
    }

    pub fn identity_missing(&self) -> bool {
        self.identity_missing
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn history_in_flight(&self) -> bool {
        self.history_in_flight
    }

    pub fn notice(&self) -> Option<&SessionError> {
        self.notice.as_ref()
    }

    pub(crate) fn set_notice(&mut self, notice: Option<SessionError>) {
        self.notice = notice;
    }

    /// The load error the user should see, if any. A failed first load and a
    /// non-transient failure show at once; transient poll failures only after
    /// `failure_threshold` in a row.
    pub fn visible_load_error(&self) -> Option<&TransportError> {
        let error = self.last_load_error.as_ref()?;
        if !self.loaded_once
            || !error.is_transient()
            || self.consecutive_failures >= self.settings.failure_threshold
        {
            Some(error)
        } else {
            None
        }
    }

    /// The pending mode-switch target, while awaiting confirmation.
    pub fn mode_switch_prompt(&self) -> Option<SessionMode> {
        match self.state {
            SessionState::SwitchingMode { to, .. } => Some(to),
            _ => None,
        }
    }

    fn fetch_history_command(&mut self) -> SessionCommand {
        self.history_in_flight = true;
        SessionCommand::FetchHistory {
            generation: self.generation,
            mode: self.mode,
            conversation_id: self.conversation_id.clone(),
        }
    }

    fn open_live_command(&mut self) -> Option<SessionCommand> {
        if self.mode != MessageOrigin::Conventional || self.live_open || !self.live_supported {
            return None;
        }
        let user_id = self.local_user.clone()?;
        if !matches!(self.state, SessionState::Ready(_)) {
            return None;
        }
        self.live_open = true;
        Some(SessionCommand::OpenLive {
            generation: self.generation,
            mode: self.mode,
            user_id,
        })
    }

    fn close_live_command(&mut self) -> Option<SessionCommand> {
        self.live_connected = false;
        if std::mem::replace(&mut self.live_open, false) {
            Some(SessionCommand::CloseLive)
        } else {
            None
        }
    }

    /// Identity resolved (or not). Without an identity no network work starts.
    pub fn open(
        &mut self,
        user_id: Result<String, SessionError>,
    ) -> Result<Vec<SessionCommand>, SessionError> {
        match self.state {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Uninitialized => {}
            _ => return Ok(Vec::new()),
        }

        let user_id = match user_id {
            Ok(user_id) if !user_id.trim().is_empty() => user_id,
            Ok(_) | Err(_) => {
                self.identity_missing = true;
                warn!(
                    conversation_id = %self.conversation_id,
                    "Local identity unavailable; session stays uninitialized"
                );
                return Err(SessionError::IdentityUnavailable);
            }
        };

        self.identity_missing = false;
        self.local_user = Some(user_id);
        self.state = SessionState::Loading(self.mode);
        info!(
            conversation_id = %self.conversation_id,
            mode = %self.mode,
            generation = self.generation,
            "Loading conversation"
        );
        Ok(vec![self.fetch_history_command()])
    }

    pub fn history_loaded(
        &mut self,
        generation: u64,
        result: Result<Vec<Message>, TransportError>,
    ) -> Vec<SessionCommand> {
        if !self.is_current_generation(generation) || self.is_closed() {
            debug!(
                generation,
                current = self.generation,
                "Dropping stale history result"
            );
            return Vec::new();
        }
        self.history_in_flight = false;

        let messages = match result {
            Ok(messages) => messages,
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(
                    conversation_id = %self.conversation_id,
                    mode = %self.mode,
                    generation,
                    failures = self.consecutive_failures,
                    error = %err,
                    "History load failed"
                );
                self.last_load_error = Some(err);
                return Vec::new();
            }
        };

        self.consecutive_failures = 0;
        self.last_load_error = None;
        self.loaded_once = true;

        let log = std::mem::take(&mut self.log);
        let (log, outcome) = merge(log, messages);
        self.log = log;
        self.drop_reconciled(&outcome.reconciled);
        if outcome.changed() {
            debug!(
                generation,
                inserted = outcome.inserted,
                reconciled = outcome.reconciled.len(),
                "Merged history"
            );
        }

        match self.state {
            SessionState::Loading(mode) => {
                self.state = SessionState::Ready(mode);
                info!(
                    conversation_id = %self.conversation_id,
                    mode = %mode,
                    generation,
                    entries = self.log.len(),
                    "Conversation ready"
                );
            }
            SessionState::SwitchingMode { from, to, .. } => {
                self.state = SessionState::SwitchingMode {
                    from,
                    to,
                    loaded: true,
                };
            }
            _ => {}
        }

        self.open_live_command().into_iter().collect()
    }

    pub fn poll_tick(&mut self, now: Instant) -> Vec<SessionCommand> {
        self.typing.clear_if_expired(now);
        if self.local_user.is_none() {
            return Vec::new();
        }
        match self.state {
            SessionState::Loading(_)
            | SessionState::Ready(_)
            | SessionState::SwitchingMode { .. } => {}
            SessionState::Uninitialized | SessionState::Closed => return Vec::new(),
        }

        let mut commands = Vec::new();
        if self.history_in_flight {
            debug!(generation = self.generation, "Poll skipped; fetch in flight");
        } else {
            commands.push(self.fetch_history_command());
        }
        commands.extend(self.open_live_command());
        commands
    }

    fn accepts_live_events(&self, generation: u64) -> bool {
        if !self.is_current_generation(generation) {
            debug!(
                generation,
                current = self.generation,
                "Dropping stale live event"
            );
            return false;
        }
        !self.is_closed()
    }

    pub fn live_message(&mut self, generation: u64, message: Message) {
        if !self.accepts_live_events(generation) {
            return;
        }
        if self.partner_id.as_deref() == Some(message.sender_id.as_str()) {
            self.typing.clear();
        }
        let log = std::mem::take(&mut self.log);
        let (log, outcome) = merge(log, [message]);
        self.log = log;
        self.drop_reconciled(&outcome.reconciled);
    }

    pub fn live_typing(&mut self, generation: u64, now: Instant) {
        if !self.accepts_live_events(generation) {
            return;
        }
        self.typing.signal(now, self.settings.typing_expiry);
    }

    pub fn live_connection(&mut self, generation: u64, connected: bool) {
        if !self.accepts_live_events(generation) {
            return;
        }
        if self.live_connected != connected {
            info!(generation, connected, "Live channel state changed");
        }
        self.live_connected = connected;
    }

    /// Outcome of an `OpenLive` command. `Ok(false)` means the backend has no
    /// push channel and is never asked again this generation.
    pub fn live_subscribed(&mut self, generation: u64, result: Result<bool, TransportError>) {
        if !self.accepts_live_events(generation) {
            return;
        }
        match result {
            Ok(true) => self.live_open = true,
            Ok(false) => {
                self.live_open = false;
                self.live_supported = false;
            }
            Err(err) => {
                self.live_open = false;
                self.live_connected = false;
                warn!(generation, error = %err, "Live subscription failed; polling only");
            }
        }
    }

    pub fn typing_expired(&mut self, now: Instant) {
        self.typing.clear_if_expired(now);
    }

    pub fn submit_message(
        &mut self,
        body: String,
        ctx: SessionActionContext,
    ) -> Result<Vec<SessionCommand>, SessionError> {
        let mode = match self.state {
            SessionState::Ready(mode) => mode,
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Uninitialized if self.identity_missing => {
                return Err(SessionError::IdentityUnavailable)
            }
            _ => return Err(SessionError::NotReady),
        };
        let sender_id = self
            .local_user
            .clone()
            .ok_or(SessionError::IdentityUnavailable)?;
        let body = body.trim().to_string();
        if body.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.log.has_pending(&sender_id, &body) {
            return Err(SessionError::DuplicatePending);
        }

        let client_key = ClientKey::generate();
        // Keep the echo at the bottom even when the local clock lags the server.
        let timestamp = self
            .log
            .entries()
            .last()
            .map(|last| last.timestamp.max(ctx.wall))
            .unwrap_or(ctx.wall);
        self.log.push_local_echo(Message::pending_echo(
            sender_id.clone(),
            body.clone(),
            timestamp,
            mode,
            client_key.clone(),
        ));
        self.in_flight_sends.insert(client_key.clone(), body.clone());
        debug!(
            generation = self.generation,
            mode = %mode,
            client_key = %client_key,
            "Queued send"
        );

        Ok(vec![SessionCommand::Send {
            generation: self.generation,
            mode,
            message: OutgoingMessage {
                conversation_id: self.conversation_id.clone(),
                sender_id,
                receiver_id: self.partner_id.clone(),
                body,
                client_key,
            },
        }])
    }

    pub fn send_resolved(
        &mut self,
        generation: u64,
        client_key: ClientKey,
        result: Result<Confirmation, TransportError>,
    ) -> Vec<SessionCommand> {
        if !self.is_current_generation(generation) || self.is_closed() {
            debug!(
                generation,
                current = self.generation,
                client_key = %client_key,
                "Dropping stale send result"
            );
            return Vec::new();
        }
        let in_flight = self.in_flight_sends.remove(&client_key);

        match result {
            Ok(confirmation) => {
                self.log.remove_local_echo(&client_key);
                debug!(
                    generation,
                    client_key = %client_key,
                    transaction = ?confirmation.transaction,
                    "Send confirmed"
                );
                if self.history_in_flight {
                    Vec::new()
                } else {
                    vec![self.fetch_history_command()]
                }
            }
            Err(err) => {
                // Already reconciled with a delivered copy; nothing failed.
                let Some(body) = in_flight else {
                    debug!(
                        generation,
                        client_key = %client_key,
                        error = %err,
                        "Ignoring failure for a delivered send"
                    );
                    return Vec::new();
                };
                let unconfirmed = matches!(err, TransportError::ConfirmationTimeout { .. })
                    && self.log.mark_unconfirmed(&client_key);
                if !unconfirmed {
                    self.log.remove_local_echo(&client_key);
                }
                warn!(
                    generation,
                    client_key = %client_key,
                    error = %err,
                    unconfirmed,
                    "Send failed"
                );
                self.failed_sends.push(FailedSend {
                    client_key,
                    body,
                    error: err,
                    unconfirmed,
                });
                Vec::new()
            }
        }
    }

    /// Re-sends a failed message as a fresh send with a new client key.
    pub fn retry_failed_send(
        &mut self,
        client_key: &ClientKey,
        ctx: SessionActionContext,
    ) -> Result<Vec<SessionCommand>, SessionError> {
        let index = self
            .failed_sends
            .iter()
            .position(|failed| &failed.client_key == client_key)
            .ok_or(SessionError::UnknownMessage)?;
        let body = self.failed_sends[index].body.clone();
        let commands = self.submit_message(body, ctx)?;
        let failed = self.failed_sends.remove(index);
        if failed.unconfirmed {
            self.log.remove_local_echo(&failed.client_key);
        }
        Ok(commands)
    }

    /// Hides the failure indicator. An unconfirmed entry stays in the log.
    pub fn dismiss_failed_send(&mut self, client_key: &ClientKey) -> Result<(), SessionError> {
        let before = self.failed_sends.len();
        self.failed_sends
            .retain(|failed| &failed.client_key != client_key);
        if self.failed_sends.len() == before {
            Err(SessionError::UnknownMessage)
        } else {
            Ok(())
        }
    }

    /// Local-only reaction; returns the new count.
    pub fn add_reaction(&mut self, index: usize, emoji: &str) -> Result<u32, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(SessionError::InvalidReaction);
        }
        self.log
            .add_reaction(index, emoji)
            .ok_or(SessionError::UnknownMessage)
    }

    /// User edited the compose field. Sends at most one typing signal per
    /// `typing_throttle`, and only over a connected live channel.
    pub fn compose_changed(&mut self, now: Instant) -> Vec<SessionCommand> {
        if self.state != SessionState::Ready(MessageOrigin::Conventional) || !self.live_connected {
            return Vec::new();
        }
        let Some(receiver_id) = self.partner_id.clone() else {
            return Vec::new();
        };
        if let Some(last) = self.last_typing_sent {
            if now.saturating_duration_since(last) < self.settings.typing_throttle {
                return Vec::new();
            }
        }
        self.last_typing_sent = Some(now);
        vec![SessionCommand::SignalTyping {
            generation: self.generation,
            mode: self.mode,
            receiver_id,
        }]
    }

    pub fn presence_tick(&mut self) -> Vec<SessionCommand> {
        if self.is_closed() || self.local_user.is_none() {
            return Vec::new();
        }
        match self.partner_id.clone() {
            Some(user_id) => vec![SessionCommand::FetchPresence { user_id }],
            None => Vec::new(),
        }
    }

    pub fn presence_updated(&mut self, result: Result<Option<bool>, TransportError>) {
        if self.is_closed() {
            return;
        }
        match result {
            Ok(Some(online)) => self.partner_online = Some(online),
            Ok(None) => {}
            Err(err) => debug!(error = %err, "Presence lookup failed"),
        }
    }

    pub fn request_mode_switch(&mut self) -> Result<(), SessionError> {
        let (from, loaded) = match self.state {
            SessionState::Ready(mode) => (mode, true),
            SessionState::Loading(mode) => (mode, false),
            SessionState::SwitchingMode { .. } => return Ok(()),
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Uninitialized => return Err(SessionError::NotReady),
        };
        self.state = SessionState::SwitchingMode {
            from,
            to: from.toggled(),
            loaded,
        };
        Ok(())
    }

    pub fn cancel_mode_switch(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::SwitchingMode { from, loaded, .. } => {
                self.state = if loaded {
                    SessionState::Ready(from)
                } else {
                    SessionState::Loading(from)
                };
                Ok(())
            }
            SessionState::Closed => Err(SessionError::Closed),
            _ => Err(SessionError::NoModeSwitchPending),
        }
    }

    /// Destructive switch: empties the log, releases the live channel and
    /// reloads from the other backend under a new generation.
    pub fn confirm_mode_switch(&mut self) -> Result<Vec<SessionCommand>, SessionError> {
        let to = match self.state {
            SessionState::SwitchingMode { to, .. } => to,
            SessionState::Closed => return Err(SessionError::Closed),
            _ => return Err(SessionError::NoModeSwitchPending),
        };

        let mut commands: Vec<SessionCommand> = self.close_live_command().into_iter().collect();
        self.begin_generation();
        self.live_supported = true;
        self.mode = to;
        self.state = SessionState::Loading(to);
        info!(
            conversation_id = %self.conversation_id,
            mode = %to,
            generation = self.generation,
            "Switched transport mode"
        );
        commands.push(self.fetch_history_command());
        Ok(commands)
    }

    pub fn close(&mut self) -> Vec<SessionCommand> {
        if self.is_closed() {
            return Vec::new();
        }
        let mut commands: Vec<SessionCommand> = self.close_live_command().into_iter().collect();
        self.begin_generation();
        self.state = SessionState::Closed;
        info!(conversation_id = %self.conversation_id, "Session closed");
        commands.push(SessionCommand::Shutdown);
        commands
    }

    /// Supersedes every in-flight request and drops per-generation state.
    fn begin_generation(&mut self) {
        self.generation += 1;
        self.log.clear();
        self.typing.clear();
        self.in_flight_sends.clear();
        self.failed_sends.clear();
        self.history_in_flight = false;
        self.loaded_once = false;
        self.consecutive_failures = 0;
        self.last_load_error = None;
        self.last_typing_sent = None;
    }

    fn drop_reconciled(&mut self, reconciled: &[ClientKey]) {
        for key in reconciled {
            self.in_flight_sends.remove(key);
            self.failed_sends.retain(|failed| &failed.client_key != key);
        }
    }
}
