//! EventSub WebSocket client.
//!
//! Owns one live session at a time. Every `session_welcome` replaces the
//! session and re-creates the chat and follow subscriptions against it.
//! Decoded notifications are pushed to an unbounded channel consumed by the
//! event router. When the socket closes the client waits a fixed delay and
//! connects again, forever.

pub mod messages;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::TwitchConfig;
use crate::error::AppResult;
use crate::services::points::RosterSource;
use crate::services::presentation::ChatChannel;
use crate::services::twitch::{Chatter, HelixApi};

pub use messages::{ChannelEvent, ChatMessageEvent, FollowEvent};
pub use session::{ChannelIdentity, Session, SessionState};

use messages::{ControlMessage, EventSubMessage, SUBSCRIPTION_CHAT_MESSAGE, SUBSCRIPTION_FOLLOW};

/// Extra time allowed past the server's keepalive timeout before the
/// connection is treated as lost.
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// Subscriptions created on every welcome: (type, version).
const REQUIRED_SUBSCRIPTIONS: [(&str, &str); 2] =
    [(SUBSCRIPTION_CHAT_MESSAGE, "1"), (SUBSCRIPTION_FOLLOW, "2")];

fn subscription_condition(subscription_type: &str, identity: &ChannelIdentity) -> serde_json::Value {
    match subscription_type {
        SUBSCRIPTION_FOLLOW => serde_json::json!({
            "broadcaster_user_id": identity.channel_id,
            "moderator_user_id": identity.bot_user_id,
        }),
        _ => serde_json::json!({
            "broadcaster_user_id": identity.channel_id,
            "user_id": identity.bot_user_id,
        }),
    }
}

pub struct EventSubClient {
    api: Arc<dyn HelixApi>,
    config: TwitchConfig,
    identity: RwLock<Option<ChannelIdentity>>,
    state: RwLock<SessionState>,
    session: RwLock<Option<Session>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl EventSubClient {
    pub fn new(
        api: Arc<dyn HelixApi>,
        config: TwitchConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            api,
            config,
            identity: RwLock::new(None),
            state: RwLock::new(SessionState::Disconnected),
            session: RwLock::new(None),
            events,
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    pub async fn identity(&self) -> Option<ChannelIdentity> {
        self.identity.read().await.clone()
    }

    async fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().await;
        if *state != next {
            tracing::debug!("EventSub state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Resolve the bot user, the target channel and check token scopes.
    ///
    /// Only a failure to resolve the bot user is an error. An unknown channel
    /// falls back to the bot's own channel and missing scopes are logged.
    pub async fn resolve_identity(&self) -> AppResult<ChannelIdentity> {
        let bot = self.api.get_own_user().await?;
        tracing::info!("Authenticated as {} ({})", bot.display_name, bot.id);

        let channel_id = match self.config.channel_name.as_deref() {
            Some(login) => match self.api.get_user_by_login(login).await {
                Ok(Some(channel)) => {
                    tracing::info!("Joining channel {} ({})", channel.display_name, channel.id);
                    channel.id
                }
                Ok(None) => {
                    tracing::warn!(
                        "Channel {} not found, falling back to the bot's own channel",
                        login
                    );
                    bot.id.clone()
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to resolve channel {}: {}. Falling back to the bot's own channel",
                        login,
                        e
                    );
                    bot.id.clone()
                }
            },
            None => bot.id.clone(),
        };

        match self.api.validate_token().await {
            Ok(validation) => {
                tracing::debug!(
                    "Token for {} (client {}) expires in {}s",
                    validation.login.as_deref().unwrap_or("unknown"),
                    validation.client_id,
                    validation.expires_in
                );
                let missing = validation.missing_scopes();
                if missing.is_empty() {
                    tracing::info!("Access token has all required scopes");
                } else {
                    tracing::warn!(
                        "Access token is missing scopes: {}. Some features will not work",
                        missing.join(", ")
                    );
                }
            }
            Err(e) => tracing::warn!("Could not validate access token scopes: {}", e),
        }

        let identity = ChannelIdentity {
            bot_user_id: bot.id,
            bot_login: bot.login,
            channel_id,
        };
        *self.identity.write().await = Some(identity.clone());
        Ok(identity)
    }

    /// Resolve identity, then keep a session open until shutdown.
    ///
    /// Identity resolution is retried at the reconnect delay until it succeeds.
    pub async fn connect(&self, mut shutdown: broadcast::Receiver<()>) {
        while let Err(e) = self.resolve_identity().await {
            let delay = self.config.reconnect_delay();
            tracing::error!(
                "Failed to resolve bot identity: {}. Retrying in {}s",
                e,
                delay.as_secs()
            );
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        loop {
            self.set_state(SessionState::Connecting).await;
            tracing::info!("Connecting to EventSub at {}", self.config.eventsub_url);

            let connected = tokio::select! {
                _ = shutdown.recv() => break,
                result = tokio_tungstenite::connect_async(self.config.eventsub_url.as_str()) => result,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = self.run_session(ws_stream) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("EventSub connection failed: {}", e);
                    self.mark_reconnecting().await;
                }
            }

            let delay = self.config.reconnect_delay();
            tracing::info!("Reconnecting to EventSub in {}s", delay.as_secs());
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("EventSub client shutting down");
        *self.session.write().await = None;
        self.set_state(SessionState::Disconnected).await;
    }

    /// How long to wait for the next frame. `None` until a welcome arrives.
    async fn keepalive_window(&self) -> Option<Duration> {
        let session = self.session.read().await;
        session
            .as_ref()
            .and_then(|s| s.keepalive_timeout_seconds)
            .map(|secs| Duration::from_secs(secs).saturating_add(KEEPALIVE_GRACE))
    }

    /// Read frames until the transport closes, fails or goes silent past the
    /// keepalive window. Ends in `Reconnecting`.
    pub async fn run_session<S>(&self, mut stream: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let next = match self.keepalive_window().await {
                Some(window) => match tokio::time::timeout(window, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(
                            "No EventSub traffic for {}s, treating the connection as lost",
                            window.as_secs()
                        );
                        break;
                    }
                },
                None => stream.next().await,
            };
            let Some(frame) = next else {
                break;
            };

            match frame {
                Ok(Message::Text(text)) => self.handle_text(&text).await,
                Ok(Message::Close(frame)) => {
                    tracing::info!("EventSub closed the connection: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("EventSub transport error: {}", e);
                    break;
                }
            }
        }

        self.mark_reconnecting().await;
    }

    async fn mark_reconnecting(&self) {
        *self.session.write().await = None;
        self.set_state(SessionState::Reconnecting).await;
    }

    async fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<EventSubMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed EventSub frame: {}", e);
                return;
            }
        };
        let message_type = message.metadata.message_type.clone();
        let message_id = message.metadata.message_id.clone();

        let control = match message.classify() {
            Ok(control) => control,
            Err(e) => {
                tracing::warn!("Failed to decode EventSub {} payload: {}", message_type, e);
                return;
            }
        };

        match control {
            ControlMessage::Welcome(info) => {
                tracing::info!("EventSub session {} established", info.id);
                let session = Session::new(info.id, info.keepalive_timeout_seconds);
                *self.session.write().await = Some(session.clone());
                self.set_state(SessionState::Welcomed).await;
                self.register_subscriptions(&session.id).await;
            }
            ControlMessage::Keepalive => {}
            ControlMessage::Notification {
                subscription_type,
                event,
            } => match ChannelEvent::decode(&subscription_type, event) {
                Ok(Some(event)) => {
                    if self.events.send(event).is_err() {
                        tracing::warn!("Event router is gone, dropping {} event", subscription_type);
                    }
                }
                Ok(None) => {
                    tracing::debug!("Ignoring notification of type {}", subscription_type)
                }
                Err(e) => tracing::warn!("Failed to decode {} event: {}", subscription_type, e),
            },
            ControlMessage::Reconnect(info) => {
                tracing::info!(
                    "EventSub requested reconnect (url: {})",
                    info.reconnect_url.as_deref().unwrap_or("none")
                );
            }
            ControlMessage::Revocation(subscription) => {
                tracing::warn!(
                    "EventSub subscription {} ({}) revoked: {}",
                    subscription.id,
                    subscription.subscription_type,
                    subscription.status.as_deref().unwrap_or("unknown")
                );
            }
            ControlMessage::Unknown(kind) => {
                tracing::warn!("Unhandled EventSub message type {} ({})", kind, message_id);
            }
        }
    }

    /// Create each required subscription once for `session_id`. Failures are
    /// logged and do not stop the remaining subscriptions.
    async fn register_subscriptions(&self, session_id: &str) {
        let Some(identity) = self.identity().await else {
            tracing::warn!("No channel identity resolved, skipping subscriptions");
            return;
        };

        self.set_state(SessionState::Subscribing).await;

        for (subscription_type, version) in REQUIRED_SUBSCRIPTIONS {
            let condition = subscription_condition(subscription_type, &identity);
            match self
                .api
                .create_eventsub_subscription(subscription_type, version, condition, session_id)
                .await
            {
                Ok(subscription) => tracing::info!(
                    "Subscribed to {} v{} as {} ({}, cost {})",
                    subscription.subscription_type,
                    subscription.version,
                    subscription.id,
                    subscription.status,
                    subscription.cost
                ),
                Err(e) => tracing::warn!("Failed to subscribe to {}: {}", subscription_type, e),
            }
        }

        self.set_state(SessionState::Live).await;
    }

    /// Viewers currently in chat. Empty when the identity is unknown or the call fails.
    pub async fn query_roster(&self) -> Vec<Chatter> {
        let Some(identity) = self.identity().await else {
            return Vec::new();
        };

        match self
            .api
            .get_chatters(&identity.channel_id, &identity.bot_user_id)
            .await
        {
            Ok(chatters) => chatters,
            Err(e) => {
                tracing::warn!("Failed to fetch chatters: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn send_chat_message(&self, text: &str) -> bool {
        let Some(identity) = self.identity().await else {
            tracing::warn!("Cannot send chat message before the channel is resolved");
            return false;
        };

        match self
            .api
            .send_chat_message(&identity.channel_id, &identity.bot_user_id, text)
            .await
        {
            Ok(result) if result.is_sent => true,
            Ok(result) => {
                tracing::warn!(
                    "Chat message {} dropped: {}",
                    result.message_id,
                    result
                        .drop_reason
                        .map(|r| format!("{} ({})", r.message, r.code))
                        .unwrap_or_else(|| "no reason given".to_string())
                );
                false
            }
            Err(e) => {
                tracing::warn!("Failed to send chat message: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl ChatChannel for EventSubClient {
    async fn send_chat_message(&self, text: &str) -> bool {
        EventSubClient::send_chat_message(self, text).await
    }
}

#[async_trait]
impl RosterSource for EventSubClient {
    async fn query_roster(&self) -> Vec<Chatter> {
        EventSubClient::query_roster(self).await
    }
}
