use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChatSession, SessionError, SessionMode};
use crate::core::message::{ClientKey, Message};
use crate::transport::{Confirmation, OutgoingMessage, TransportError};

#[derive(Debug, Clone)]
pub enum SessionAction {
    /// Identity lookup finished; starts the first load on success.
    Open {
        user_id: Result<String, SessionError>,
    },
    HistoryLoaded {
        generation: u64,
        result: Result<Vec<Message>, TransportError>,
    },
    PollTick,
    LiveSubscribed {
        generation: u64,
        result: Result<bool, TransportError>,
    },
    LiveMessage {
        generation: u64,
        message: Message,
    },
    LiveTyping {
        generation: u64,
    },
    LiveConnection {
        generation: u64,
        connected: bool,
    },
    TypingExpired,
    SubmitMessage {
        body: String,
    },
    SendResolved {
        generation: u64,
        client_key: ClientKey,
        result: Result<Confirmation, TransportError>,
    },
    RetryFailedSend {
        client_key: ClientKey,
    },
    DismissFailedSend {
        client_key: ClientKey,
    },
    AddReaction {
        index: usize,
        emoji: String,
    },
    ComposeChanged,
    PresenceTick,
    PresenceUpdated {
        result: Result<Option<bool>, TransportError>,
    },
    RequestModeSwitch,
    ConfirmModeSwitch,
    CancelModeSwitch,
    Close,
}

impl SessionAction {
    /// Actions a person triggers directly; their errors are shown as notices.
    pub fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            SessionAction::SubmitMessage { .. }
                | SessionAction::RetryFailedSend { .. }
                | SessionAction::DismissFailedSend { .. }
                | SessionAction::AddReaction { .. }
                | SessionAction::RequestModeSwitch
                | SessionAction::ConfirmModeSwitch
                | SessionAction::CancelModeSwitch
        )
    }
}

/// Clock readings taken when an action was dispatched.
#[derive(Debug, Clone, Copy)]
pub struct SessionActionContext {
    /// Monotonic time for typing expiry and throttling.
    pub now: Instant,
    /// Wall-clock time for optimistic message timestamps.
    pub wall: DateTime<Utc>,
}

impl SessionActionContext {
    pub fn new(now: Instant, wall: DateTime<Utc>) -> Self {
        Self { now, wall }
    }

    /// Reads tokio's clock so paused-time tests see consistent instants.
    pub fn capture() -> Self {
        Self {
            now: tokio::time::Instant::now().into_std(),
            wall: Utc::now(),
        }
    }
}

pub struct SessionActionEnvelope {
    pub action: SessionAction,
    pub context: SessionActionContext,
}

#[derive(Clone)]
pub struct SessionActionDispatcher {
    tx: mpsc::UnboundedSender<SessionActionEnvelope>,
}

impl SessionActionDispatcher {
    pub fn new(tx: mpsc::UnboundedSender<SessionActionEnvelope>) -> Self {
        Self { tx }
    }

    /// Returns false once the session loop has shut down.
    pub fn dispatch(&self, action: SessionAction) -> bool {
        self.tx
            .send(SessionActionEnvelope {
                action,
                context: SessionActionContext::capture(),
            })
            .is_ok()
    }
}

/// Work the runtime performs on behalf of the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    FetchHistory {
        generation: u64,
        mode: SessionMode,
        conversation_id: String,
    },
    OpenLive {
        generation: u64,
        mode: SessionMode,
        user_id: String,
    },
    CloseLive,
    Send {
        generation: u64,
        mode: SessionMode,
        message: OutgoingMessage,
    },
    SignalTyping {
        generation: u64,
        mode: SessionMode,
        receiver_id: String,
    },
    FetchPresence {
        user_id: String,
    },
    Shutdown,
}

pub fn apply_actions(
    session: &mut ChatSession,
    envelopes: impl IntoIterator<Item = SessionActionEnvelope>,
) -> Vec<SessionCommand> {
    let mut commands = Vec::new();
    for envelope in envelopes {
        if let Ok(mut produced) = apply_action(session, envelope.action, envelope.context) {
            commands.append(&mut produced);
        }
    }
    commands
}

/// Applies one action. Errors from user-initiated actions are also kept as the
/// session notice so the rendering layer can show them.
pub fn apply_action(
    session: &mut ChatSession,
    action: SessionAction,
    ctx: SessionActionContext,
) -> Result<Vec<SessionCommand>, SessionError> {
    let user_initiated = action.is_user_initiated();
    if session.is_closed() {
        debug!(?action, "Ignoring action on closed session");
        return if user_initiated {
            Err(SessionError::Closed)
        } else {
            Ok(Vec::new())
        };
    }

    let result = dispatch(session, action, ctx);
    if user_initiated {
        session.set_notice(result.as_ref().err().cloned());
    } else if let Err(err) = &result {
        session.set_notice(Some(err.clone()));
    }
    result
}

fn dispatch(
    session: &mut ChatSession,
    action: SessionAction,
    ctx: SessionActionContext,
) -> Result<Vec<SessionCommand>, SessionError> {
    match action {
        SessionAction::Open { user_id } => session.open(user_id),
        SessionAction::HistoryLoaded { generation, result } => {
            Ok(session.history_loaded(generation, result))
        }
        SessionAction::PollTick => Ok(session.poll_tick(ctx.now)),
        SessionAction::LiveSubscribed { generation, result } => {
            session.live_subscribed(generation, result);
            Ok(Vec::new())
        }
        SessionAction::LiveMessage {
            generation,
            message,
        } => {
            session.live_message(generation, message);
            Ok(Vec::new())
        }
        SessionAction::LiveTyping { generation } => {
            session.live_typing(generation, ctx.now);
            Ok(Vec::new())
        }
        SessionAction::LiveConnection {
            generation,
            connected,
        } => {
            session.live_connection(generation, connected);
            Ok(Vec::new())
        }
        SessionAction::TypingExpired => {
            session.typing_expired(ctx.now);
            Ok(Vec::new())
        }
        SessionAction::SubmitMessage { body } => session.submit_message(body, ctx),
        SessionAction::SendResolved {
            generation,
            client_key,
            result,
        } => Ok(session.send_resolved(generation, client_key, result)),
        SessionAction::RetryFailedSend { client_key } => {
            session.retry_failed_send(&client_key, ctx)
        }
        SessionAction::DismissFailedSend { client_key } => {
            session.dismiss_failed_send(&client_key)?;
            Ok(Vec::new())
        }
        SessionAction::AddReaction { index, emoji } => {
            session.add_reaction(index, &emoji)?;
            Ok(Vec::new())
        }
        SessionAction::ComposeChanged => Ok(session.compose_changed(ctx.now)),
        SessionAction::PresenceTick => Ok(session.presence_tick()),
        SessionAction::PresenceUpdated { result } => {
            session.presence_updated(result);
            Ok(Vec::new())
        }
        SessionAction::RequestModeSwitch => {
            session.request_mode_switch()?;
            Ok(Vec::new())
        }
        SessionAction::ConfirmModeSwitch => session.confirm_mode_switch(),
        SessionAction::CancelModeSwitch => {
            session.cancel_mode_switch()?;
            Ok(Vec::new())
        }
        SessionAction::Close => Ok(session.close()),
    }
}

/// Builds the action reporting a finished send.
pub fn send_resolved_action(
    generation: u64,
    message: &OutgoingMessage,
    result: Result<Confirmation, TransportError>,
) -> SessionAction {
    SessionAction::SendResolved {
        generation,
        client_key: message.client_key.clone(),
        result,
    }
}
