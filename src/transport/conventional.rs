//! REST history + websocket push backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::core::config::{Endpoints, SessionSettings};
use crate::core::message::{Message, MessageOrigin};
use crate::transport::live::{spawn_live_channel, LiveChannelConfig, LiveSender};
use crate::transport::wire::{
    messages_from_wire, HistoryResponse, PresenceResponse, SendMessagePayload, TypingPayload,
    EVENT_SEND_MESSAGE, EVENT_TYPING,
};
use crate::transport::{
    decode_json_response, Confirmation, LiveHandlers, OutgoingMessage, Subscription, Transport,
    TransportError,
};
use crate::utils::url::{construct_api_url, encode_path_segment, is_websocket_url};

pub struct ConventionalTransport {
    client: reqwest::Client,
    api_base_url: String,
    socket_url: String,
    auth_token: Option<String>,
    reconnect_delay: Duration,
    live: LiveSender,
}

impl ConventionalTransport {
    pub fn new(
        client: reqwest::Client,
        endpoints: &Endpoints,
        settings: &SessionSettings,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_base_url: endpoints.api_base_url.clone(),
            socket_url: endpoints.socket_url.clone(),
            auth_token: auth_token.filter(|token| !token.trim().is_empty()),
            reconnect_delay: settings.reconnect_delay,
            live: LiveSender::new(),
        }
    }

    fn get(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let url = construct_api_url(&self.api_base_url, endpoint);
        let mut request = self.client.get(url).header("Accept", "application/json");
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        request
    }
}

#[async_trait]
impl Transport for ConventionalTransport {
    fn kind(&self) -> MessageOrigin {
        MessageOrigin::Conventional
    }

    async fn send_message(
        &self,
        message: &OutgoingMessage,
    ) -> Result<Confirmation, TransportError> {
        self.live.send_frame(
            EVENT_SEND_MESSAGE,
            SendMessagePayload {
                conversation_id: &message.conversation_id,
                sender_id: &message.sender_id,
                receiver_id: message.receiver_id.as_deref(),
                content: &message.body,
                client_key: message.client_key.as_str(),
            },
        )?;
        debug!(client_key = %message.client_key, "Queued send_message frame");
        Ok(Confirmation {
            accepted_at: Utc::now(),
            transaction: None,
        })
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError> {
        let endpoint = format!("messages/{}", encode_path_segment(conversation_id));
        let response = self.get(&endpoint).send().await?;
        let history: HistoryResponse = decode_json_response(response).await?;
        Ok(messages_from_wire(
            history.into_entries(),
            MessageOrigin::Conventional,
        ))
    }

    async fn subscribe_live(
        &self,
        user_id: &str,
        handlers: LiveHandlers,
    ) -> Result<Option<Subscription>, TransportError> {
        if !is_websocket_url(&self.socket_url) {
            return Err(TransportError::Malformed(format!(
                "socket url {} is not a ws:// or wss:// url",
                self.socket_url
            )));
        }
        let config = LiveChannelConfig {
            socket_url: self.socket_url.clone(),
            user_id: user_id.to_string(),
            reconnect_delay: self.reconnect_delay,
        };
        Ok(Some(spawn_live_channel(config, handlers, self.live.clone())))
    }

    async fn signal_typing(&self, receiver_id: &str) -> Result<(), TransportError> {
        self.live
            .send_frame(EVENT_TYPING, TypingPayload { receiver_id })
    }

    async fn fetch_presence(&self, user_id: &str) -> Result<Option<bool>, TransportError> {
        let endpoint = format!("users/{}/status", encode_path_segment(user_id));
        let response = self.get(&endpoint).send().await?;
        let presence: PresenceResponse = decode_json_response(response).await?;
        Ok(Some(presence.online))
    }
}
