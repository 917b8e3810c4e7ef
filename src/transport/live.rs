//! Websocket live channel for the conventional transport.
//!
//! One background task owns the socket. It registers the user on every
//! (re)connect, forwards queued outbound frames, dispatches inbound
//! `receive_message` / `typing` events to the [`LiveHandlers`], and reconnects
//! after `reconnect_delay` until the subscription is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::message::MessageOrigin;
use crate::transport::wire::{
    InboundFrame, OutboundFrame, RegisterPayload, WireMessage, EVENT_RECEIVE_MESSAGE,
    EVENT_REGISTER, EVENT_TYPING,
};
use crate::transport::{LiveHandlers, Subscription, TransportError};

/// Upper bound on the close handshake so a stalled peer cannot hold up teardown.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Outbound half of the live channel, shared by the transport and the socket
/// task. Holds a sender only while a socket is connected.
#[derive(Clone, Default)]
pub struct LiveSender {
    link: Arc<Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>>,
    next_id: Arc<AtomicU64>,
}

impl LiveSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self) -> MutexGuard<'_, Option<(u64, mpsc::UnboundedSender<String>)>> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.link()
            .as_ref()
            .is_some_and(|(_, tx)| !tx.is_closed())
    }

    /// Serializes and queues one `{event, data}` frame.
    pub fn send_frame<T: Serialize>(&self, event: &str, data: T) -> Result<(), TransportError> {
        let text = serde_json::to_string(&OutboundFrame { event, data })
            .map_err(|err| TransportError::Malformed(err.to_string()))?;
        let guard = self.link();
        let Some((_, tx)) = guard.as_ref() else {
            return Err(TransportError::LiveChannelClosed);
        };
        tx.send(text).map_err(|_| TransportError::LiveChannelClosed)
    }

    fn attach(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self.link() = Some((id, tx));
        id
    }

    /// Detaches only if `id` is still the active link, so a closing socket
    /// never clears its successor.
    fn detach(&self, id: u64) {
        let mut guard = self.link();
        if guard.as_ref().is_some_and(|(active, _)| *active == id) {
            *guard = None;
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveChannelConfig {
    pub socket_url: String,
    pub user_id: String,
    pub reconnect_delay: Duration,
}

/// Starts the socket task and returns the handle that stops it.
pub fn spawn_live_channel(
    config: LiveChannelConfig,
    handlers: LiveHandlers,
    sender: LiveSender,
) -> Subscription {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_live_channel(config, handlers, sender, cancel.clone()));
    Subscription::new(cancel, task)
}

async fn run_live_channel(
    config: LiveChannelConfig,
    handlers: LiveHandlers,
    sender: LiveSender,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let connect = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(config.socket_url.as_str()) => result,
        };

        match connect {
            Ok((ws, _response)) => {
                info!(url = %config.socket_url, "Live channel connected");
                let (tx, rx) = mpsc::unbounded_channel();
                let link_id = sender.attach(tx);
                (handlers.on_connection)(true);
                let outcome = drive_socket(ws, rx, &config.user_id, &handlers, &cancel).await;
                sender.detach(link_id);
                (handlers.on_connection)(false);
                match outcome {
                    Ok(()) => debug!("Live channel closed"),
                    Err(err) => warn!(error = %err, "Live channel dropped"),
                }
            }
            Err(err) => {
                warn!(url = %config.socket_url, error = %err, "Live channel connect failed");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        debug!(
            delay_ms = config.reconnect_delay.as_millis() as u64,
            "Reconnecting live channel"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
}

async fn drive_socket(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    user_id: &str,
    handlers: &LiveHandlers,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let register = serde_json::to_string(&OutboundFrame {
        event: EVENT_REGISTER,
        data: RegisterPayload { user_id },
    })
    .map_err(|err| TransportError::Malformed(err.to_string()))?;
    ws.send(WsMessage::Text(register.into()))
        .await
        .map_err(|err| TransportError::NetworkFailure(err.to_string()))?;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, ws.send(WsMessage::Close(None)))
                    .await
                    .is_err()
                {
                    debug!("Peer did not take the close frame in time");
                }
                return Ok(());
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                ws.send(WsMessage::Text(frame.into()))
                    .await
                    .map_err(|err| TransportError::NetworkFailure(err.to_string()))?;
            }
            msg = ws.next() => {
                let Some(msg) = msg else {
                    return Ok(());
                };
                let msg = msg.map_err(|err| TransportError::NetworkFailure(err.to_string()))?;
                match msg {
                    WsMessage::Ping(bytes) => {
                        ws.send(WsMessage::Pong(bytes))
                            .await
                            .map_err(|err| TransportError::NetworkFailure(err.to_string()))?;
                    }
                    WsMessage::Text(text) => handle_inbound_text(text.as_str(), handlers),
                    WsMessage::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

fn handle_inbound_text(text: &str, handlers: &LiveHandlers) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "Ignoring undecodable live frame");
            return;
        }
    };

    match frame.event.as_str() {
        EVENT_RECEIVE_MESSAGE => {
            let message = serde_json::from_value::<WireMessage>(frame.data)
                .map_err(|err| err.to_string())
                .and_then(|wire| wire.into_message(MessageOrigin::Conventional));
            match message {
                Ok(message) => (handlers.on_message)(message),
                Err(reason) => warn!(%reason, "Ignoring malformed receive_message"),
            }
        }
        EVENT_TYPING => (handlers.on_typing)(),
        other => debug!(event = other, "Ignoring live event"),
    }
}
