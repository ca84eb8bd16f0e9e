use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::services::dispatch::{ChatIdentity, DispatchOutcome, Dispatcher};
use crate::services::eventsub::ChannelEvent;
use crate::services::points::PointsService;

/// Feeds decoded channel events to the dispatcher and the ledger's activity signal.
pub struct EventRouter {
    dispatcher: Arc<Dispatcher>,
    points: Option<Arc<PointsService>>,
}

impl EventRouter {
    pub fn new(dispatcher: Arc<Dispatcher>, points: Option<Arc<PointsService>>) -> Self {
        Self { dispatcher, points }
    }

    /// Handle events one at a time, in arrival order, until shutdown or
    /// until the client drops its sender.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Event router shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.route(event).await;
                    }
                    None => {
                        tracing::info!("EventSub channel closed, event router exiting");
                        break;
                    }
                }
            }
        }
    }

    pub async fn route(&self, event: ChannelEvent) -> DispatchOutcome {
        match event {
            ChannelEvent::ChatMessage(chat) => {
                tracing::debug!("{}: {}", chat.chatter_user_name, chat.text);

                if let Some(points) = &self.points {
                    points
                        .record_activity(&chat.chatter_user_id, &chat.chatter_user_name)
                        .await;
                }

                if !self.dispatcher.is_command(&chat.text) {
                    return DispatchOutcome::Ignored;
                }

                let caller = ChatIdentity {
                    user_id: chat.chatter_user_id,
                    login: chat.chatter_user_login,
                    display_name: chat.chatter_user_name,
                };
                self.dispatcher.handle_chat_message(&chat.text, &caller).await
            }
            ChannelEvent::Follow(follow) => {
                tracing::info!("New follower: {} ({})", follow.user_name, follow.user_id);
                match serde_json::to_value(&follow) {
                    Ok(payload) => self.dispatcher.handle_event("follow", &payload).await,
                    Err(e) => {
                        tracing::warn!("Failed to encode follow event: {}", e);
                        DispatchOutcome::Ignored
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PointsConfig;
    use crate::db::test_pool;
    use crate::services::dispatch::{parse_table, DispatchContext};
    use crate::services::eventsub::{ChatMessageEvent, FollowEvent};
    use crate::services::overlay::OverlayBroadcaster;
    use crate::services::presentation::ChatChannel;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChat {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatChannel for RecordingChat {
        async fn send_chat_message(&self, text: &str) -> bool {
            self.sent.lock().unwrap().push(text.to_string());
            true
        }
    }

    async fn router(chat: Arc<RecordingChat>) -> (EventRouter, Arc<PointsService>) {
        let points = Arc::new(PointsService::new(
            test_pool().await,
            Arc::new(Vec::new()),
            PointsConfig::default(),
        ));
        let dispatcher = Dispatcher::with_tables(
            "!",
            parse_table(r#"{ "lurk": { "reply": "Thank you for lurking, {{username}}!" } }"#)
                .unwrap(),
            parse_table(r#"{ "follow": { "reply": "Thanks {{username}} for the follow!" } }"#)
                .unwrap(),
            DispatchContext {
                chat,
                overlay: Arc::new(OverlayBroadcaster::new()),
                points: Some(points.clone()),
            },
        );
        (
            EventRouter::new(Arc::new(dispatcher), Some(points.clone())),
            points,
        )
    }

    fn chat_event(text: &str) -> ChannelEvent {
        ChannelEvent::ChatMessage(ChatMessageEvent {
            chatter_user_id: "1".to_string(),
            chatter_user_login: "ada".to_string(),
            chatter_user_name: "Ada".to_string(),
            text: text.to_string(),
        })
    }

    #[tokio::test]
    async fn chat_commands_and_follows_reach_the_dispatcher() {
        let chat = Arc::new(RecordingChat::default());
        let (router, _) = router(chat.clone()).await;

        assert_eq!(router.route(chat_event("hello")).await, DispatchOutcome::Ignored);
        router.route(chat_event("!lurk")).await;
        router
            .route(ChannelEvent::Follow(FollowEvent {
                user_id: "2".to_string(),
                user_login: "grace".to_string(),
                user_name: "Grace".to_string(),
                followed_at: Some("2024-06-01T12:00:00Z".to_string()),
            }))
            .await;

        assert_eq!(
            chat.sent.lock().unwrap().as_slice(),
            ["Thank you for lurking, Ada!", "Thanks Grace for the follow!"]
        );
    }

    #[tokio::test]
    async fn chat_refreshes_known_accounts() {
        let chat = Arc::new(RecordingChat::default());
        let (router, points) = router(chat).await;
        points.ensure_account("1", "old name").await.unwrap();

        router.route(chat_event("hi")).await;

        let account = points.get_account("1").await.unwrap().unwrap();
        assert_eq!(account.display_name, "Ada");
    }

    #[tokio::test]
    async fn run_exits_when_sender_is_dropped() {
        let chat = Arc::new(RecordingChat::default());
        let (router, _) = router(chat.clone()).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tx.send(chat_event("!lurk")).unwrap();
        drop(tx);
        router.run(rx, shutdown_rx).await;

        assert_eq!(chat.sent.lock().unwrap().len(), 1);
    }
}
