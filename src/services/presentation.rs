use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outbound chat channel used for scripted replies.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Post `text` to the channel. Never fails; delivery problems return `false`.
    async fn send_chat_message(&self, text: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationKind {
    Command,
    Event,
}

/// Message broadcast to overlay displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationEvent {
    #[serde(rename = "type")]
    pub kind: PresentationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_in: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_out: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl PresentationEvent {
    pub fn named(kind: PresentationKind, name: &str) -> Self {
        let (command_name, event_name) = match kind {
            PresentationKind::Command => (Some(name.to_string()), None),
            PresentationKind::Event => (None, Some(name.to_string())),
        };

        Self {
            kind,
            command_name,
            event_name,
            image: None,
            sound: None,
            video: None,
            text: String::new(),
            transition_in: None,
            transition_out: None,
            timeout: None,
        }
    }
}
