//! Wire types for the EventSub WebSocket transport.

use serde::{Deserialize, Serialize};

pub const MESSAGE_TYPE_WELCOME: &str = "session_welcome";
pub const MESSAGE_TYPE_KEEPALIVE: &str = "session_keepalive";
pub const MESSAGE_TYPE_NOTIFICATION: &str = "notification";
pub const MESSAGE_TYPE_RECONNECT: &str = "session_reconnect";
pub const MESSAGE_TYPE_REVOCATION: &str = "revocation";

pub const SUBSCRIPTION_CHAT_MESSAGE: &str = "channel.chat.message";
pub const SUBSCRIPTION_FOLLOW: &str = "channel.follow";

#[derive(Debug, Deserialize)]
pub struct EventSubMessage {
    pub metadata: MessageMetadata,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub message_id: String,
    pub message_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    pub session: SessionInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationPayload {
    pub subscription: SubscriptionInfo,
    #[serde(default)]
    pub event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// A decoded control or data message.
#[derive(Debug)]
pub enum ControlMessage {
    Welcome(SessionInfo),
    Keepalive,
    Notification {
        subscription_type: String,
        event: serde_json::Value,
    },
    Reconnect(SessionInfo),
    Revocation(SubscriptionInfo),
    Unknown(String),
}

impl EventSubMessage {
    pub fn classify(self) -> Result<ControlMessage, serde_json::Error> {
        Ok(match self.metadata.message_type.as_str() {
            MESSAGE_TYPE_WELCOME => {
                let payload: SessionPayload = serde_json::from_value(self.payload)?;
                ControlMessage::Welcome(payload.session)
            }
            MESSAGE_TYPE_KEEPALIVE => ControlMessage::Keepalive,
            MESSAGE_TYPE_NOTIFICATION => {
                let payload: NotificationPayload = serde_json::from_value(self.payload)?;
                ControlMessage::Notification {
                    subscription_type: payload.subscription.subscription_type,
                    event: payload.event,
                }
            }
            MESSAGE_TYPE_RECONNECT => {
                let payload: SessionPayload = serde_json::from_value(self.payload)?;
                ControlMessage::Reconnect(payload.session)
            }
            MESSAGE_TYPE_REVOCATION => {
                let payload: NotificationPayload = serde_json::from_value(self.payload)?;
                ControlMessage::Revocation(payload.subscription)
            }
            other => ControlMessage::Unknown(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageBody {
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelChatMessagePayload {
    chatter_user_id: String,
    chatter_user_login: String,
    chatter_user_name: String,
    message: ChatMessageBody,
}

/// A chat line posted in the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessageEvent {
    pub chatter_user_id: String,
    pub chatter_user_login: String,
    pub chatter_user_name: String,
    pub text: String,
}

/// A new follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEvent {
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub followed_at: Option<String>,
}

/// Typed channel activity forwarded by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    ChatMessage(ChatMessageEvent),
    Follow(FollowEvent),
}

impl ChannelEvent {
    /// Decode a notification body. `Ok(None)` for subscription types that are not routed.
    pub fn decode(
        subscription_type: &str,
        event: serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error> {
        match subscription_type {
            SUBSCRIPTION_CHAT_MESSAGE => {
                let chat: ChannelChatMessagePayload = serde_json::from_value(event)?;
                Ok(Some(ChannelEvent::ChatMessage(ChatMessageEvent {
                    chatter_user_id: chat.chatter_user_id,
                    chatter_user_login: chat.chatter_user_login,
                    chatter_user_name: chat.chatter_user_name,
                    text: chat.message.text,
                })))
            }
            SUBSCRIPTION_FOLLOW => Ok(Some(ChannelEvent::Follow(serde_json::from_value(event)?))),
            _ => Ok(None),
        }
    }
}
