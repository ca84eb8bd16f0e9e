//! Turns chat commands and channel events into scripted responses.
//!
//! Commands resolve through a registry keyed by lowercase name. Each entry is
//! either a static response from the command table or a built-in extension.
//! Events resolve against the event table only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DispatchConfig;
use crate::error::{AppError, AppResult};
use crate::services::overlay::OverlayBroadcaster;
use crate::services::points::PointsService;
use crate::services::presentation::{ChatChannel, PresentationEvent, PresentationKind};

const DEFAULT_COMMANDS: &str = include_str!("../../config/commands.json");
const DEFAULT_EVENTS: &str = include_str!("../../config/events.json");

/// One scripted response from the command or event table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseConfig {
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub transition_in: Option<String>,
    #[serde(default)]
    pub transition_out: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    /// Points spent per use. Zero means free.
    #[serde(default)]
    pub cost: i64,
}

impl ResponseConfig {
    fn has_presentation(&self) -> bool {
        self.image.is_some() || self.sound.is_some() || self.video.is_some() || self.text.is_some()
    }
}

pub type ResponseTable = HashMap<String, ResponseConfig>;

/// Parse a JSON table, lowercasing the keys.
pub fn parse_table(json: &str) -> AppResult<ResponseTable> {
    let raw: ResponseTable = serde_json::from_str(json)
        .map_err(|e| AppError::Config(format!("Invalid response table: {}", e)))?;
    Ok(raw
        .into_iter()
        .map(|(name, config)| (name.to_lowercase(), config))
        .collect())
}

fn load_table(path: Option<&str>, defaults: &str) -> AppResult<ResponseTable> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| AppError::Config(format!("Failed to read {}: {}", path, e)))?;
            parse_table(&json)
        }
        None => parse_table(defaults),
    }
}

/// Values available to `{{key}}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    pub username: String,
    pub display_name: String,
    pub count: String,
    pub user_id: String,
    pub followed_at: String,
    pub timestamp: String,
}

impl TemplateContext {
    pub fn for_caller(caller: &ChatIdentity) -> Self {
        let username = if caller.display_name.is_empty() {
            caller.login.clone()
        } else {
            caller.display_name.clone()
        };
        Self {
            username,
            ..Default::default()
        }
    }

    /// Build from an event payload, trying several field names for each value.
    pub fn from_event_payload(payload: &serde_json::Value) -> Self {
        let field = |keys: &[&str]| -> String {
            keys.iter()
                .filter_map(|key| match payload.get(key) {
                    Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                })
                .next()
                .unwrap_or_default()
        };

        let timestamp = field(&["timestamp"]);
        Self {
            username: field(&["username", "display_name", "user_name"]),
            display_name: field(&["display_name", "username", "user_name"]),
            count: field(&["count", "viewer_count", "viewers"]),
            user_id: field(&["user_id"]),
            followed_at: field(&["followed_at"]),
            timestamp: if timestamp.is_empty() {
                chrono::Utc::now().to_rfc3339()
            } else {
                timestamp
            },
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        match key {
            "username" => Some(&self.username),
            "display_name" => Some(&self.display_name),
            "count" => Some(&self.count),
            "user_id" => Some(&self.user_id),
            "followed_at" => Some(&self.followed_at),
            "timestamp" => Some(&self.timestamp),
            _ => None,
        }
    }
}

/// Replace every `{{key}}` with its value. Unknown keys render empty.
pub fn render_template(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                out.push_str(ctx.get(after[..end].trim()).unwrap_or(""));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// The chatter who issued a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatIdentity {
    pub user_id: String,
    pub login: String,
    pub display_name: String,
}

/// Shared collaborators handed to every handler.
#[derive(Clone)]
pub struct DispatchContext {
    pub chat: Arc<dyn ChatChannel>,
    pub overlay: Arc<OverlayBroadcaster>,
    /// Absent when the ledger could not be opened.
    pub points: Option<Arc<PointsService>>,
}

/// A command implemented in code rather than in the command table.
#[async_trait]
pub trait ExtensionCommand: Send + Sync {
    async fn execute(
        &self,
        args: &[String],
        caller: &ChatIdentity,
        ctx: &DispatchContext,
    ) -> AppResult<()>;
}

#[derive(Clone)]
pub enum CommandHandler {
    Static(ResponseConfig),
    Extension(Arc<dyn ExtensionCommand>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Text was not a command.
    Ignored,
    /// No handler under that name.
    Unknown,
    /// Cost could not be covered; nothing was sent.
    Rejected,
    Executed(Delivery),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub replied: bool,
    pub broadcast: bool,
}

/// `!points`: tells the caller their balance.
pub struct PointsCommand;

#[async_trait]
impl ExtensionCommand for PointsCommand {
    async fn execute(
        &self,
        _args: &[String],
        caller: &ChatIdentity,
        ctx: &DispatchContext,
    ) -> AppResult<()> {
        let name = TemplateContext::for_caller(caller).username;
        let enabled = match &ctx.points {
            Some(points) => points.is_enabled().await,
            None => false,
        };
        let message = match &ctx.points {
            Some(points) if enabled => {
                let balance = points.get_balance(&caller.user_id).await?;
                format!("{}, you have {} points.", name, balance)
            }
            _ => format!("Sorry {}, points are not available right now.", name),
        };
        ctx.chat.send_chat_message(&message).await;
        Ok(())
    }
}

pub struct Dispatcher {
    prefix: String,
    commands: HashMap<String, CommandHandler>,
    events: ResponseTable,
    context: DispatchContext,
}

impl Dispatcher {
    /// Build from the configured tables (built-in defaults when no path is set).
    pub fn new(config: &DispatchConfig, context: DispatchContext) -> AppResult<Self> {
        let commands = load_table(config.commands_path.as_deref(), DEFAULT_COMMANDS)?;
        let events = load_table(config.events_path.as_deref(), DEFAULT_EVENTS)?;
        tracing::info!(
            "Loaded {} commands and {} events",
            commands.len(),
            events.len()
        );
        Ok(Self::with_tables(
            &config.command_prefix,
            commands,
            events,
            context,
        ))
    }

    pub fn with_tables(
        prefix: &str,
        commands: ResponseTable,
        events: ResponseTable,
        context: DispatchContext,
    ) -> Self {
        let mut registry: HashMap<String, CommandHandler> = HashMap::new();
        registry.insert(
            "points".to_string(),
            CommandHandler::Extension(Arc::new(PointsCommand)),
        );
        // Table entries take precedence over built-ins of the same name.
        for (name, config) in commands {
            registry.insert(name, CommandHandler::Static(config));
        }

        Self {
            prefix: prefix.to_string(),
            commands: registry,
            events,
            context,
        }
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_command(&self, text: &str) -> bool {
        text.starts_with(&self.prefix)
    }

    /// Resolve and run a chat command. Unknown commands are dropped quietly.
    pub async fn handle_chat_message(&self, text: &str, caller: &ChatIdentity) -> DispatchOutcome {
        let Some(body) = text.strip_prefix(&self.prefix) else {
            return DispatchOutcome::Ignored;
        };

        let mut tokens = body.split_whitespace();
        let Some(name) = tokens.next().map(str::to_lowercase) else {
            return DispatchOutcome::Ignored;
        };
        let args: Vec<String> = tokens.map(str::to_string).collect();

        tracing::debug!(
            "Command {} from {} with args {:?}",
            name,
            caller.display_name,
            args
        );

        match self.commands.get(&name) {
            Some(CommandHandler::Static(config)) => {
                if config.cost > 0 && !self.charge(&name, config.cost, caller).await {
                    return DispatchOutcome::Rejected;
                }
                let delivery = self
                    .execute_config(
                        PresentationKind::Command,
                        &name,
                        config,
                        &TemplateContext::for_caller(caller),
                    )
                    .await;
                DispatchOutcome::Executed(delivery)
            }
            Some(CommandHandler::Extension(handler)) => {
                if let Err(e) = handler.execute(&args, caller, &self.context).await {
                    tracing::warn!("Command {} failed: {}", name, e);
                }
                DispatchOutcome::Executed(Delivery::default())
            }
            None => {
                tracing::debug!("Unknown command: {}", name);
                DispatchOutcome::Unknown
            }
        }
    }

    /// Resolve and run a channel event. Missing configuration is logged.
    pub async fn handle_event(&self, event_name: &str, payload: &serde_json::Value) -> DispatchOutcome {
        let Some(config) = self.events.get(event_name) else {
            tracing::warn!("No configuration found for event: {}", event_name);
            return DispatchOutcome::Unknown;
        };

        let ctx = TemplateContext::from_event_payload(payload);
        tracing::info!("Event {} triggered by {}", event_name, ctx.username);
        let delivery = self
            .execute_config(PresentationKind::Event, event_name, config, &ctx)
            .await;
        DispatchOutcome::Executed(delivery)
    }

    /// Check and spend the cost of a command. `false` means do nothing.
    async fn charge(&self, name: &str, cost: i64, caller: &ChatIdentity) -> bool {
        let Some(points) = &self.context.points else {
            tracing::debug!("Ledger unavailable, {} runs without cost", name);
            return true;
        };
        if !points.is_enabled().await {
            return true;
        }

        if let Err(e) = points
            .ensure_account(&caller.user_id, &caller.display_name)
            .await
        {
            tracing::warn!("Could not open account for {}: {}", caller.user_id, e);
            return false;
        }

        if !points.can_afford(&caller.user_id, cost).await {
            tracing::info!(
                "{} cannot afford {} ({} points)",
                caller.display_name,
                name,
                cost
            );
            return false;
        }

        match points
            .spend_points(&caller.user_id, cost, &format!("command:{}", name))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::info!("Spend for {} by {} refused: {}", name, caller.user_id, e);
                false
            }
        }
    }

    /// Send the reply and the overlay event of `config`. Each delivery is
    /// attempted regardless of the other.
    pub async fn execute_config(
        &self,
        kind: PresentationKind,
        name: &str,
        config: &ResponseConfig,
        ctx: &TemplateContext,
    ) -> Delivery {
        let reply = config
            .reply
            .as_deref()
            .map(|template| render_template(template, ctx));

        let presentation = config.has_presentation().then(|| {
            let mut event = PresentationEvent::named(kind, name);
            event.image = config.image.clone();
            event.sound = config.sound.clone();
            event.video = config.video.clone();
            event.text = render_template(config.text.as_deref().unwrap_or(""), ctx);
            event.transition_in = config.transition_in.clone();
            event.transition_out = config.transition_out.clone();
            event.timeout = config.timeout.clone();
            event
        });

        let send_reply = async {
            match &reply {
                Some(message) => {
                    tracing::info!("Sending chat reply: {}", message);
                    self.context.chat.send_chat_message(message).await
                }
                None => false,
            }
        };
        let send_overlay = async {
            match &presentation {
                Some(event) => self.context.overlay.broadcast(event).await,
                None => false,
            }
        };

        let (replied, broadcast) = tokio::join!(send_reply, send_overlay);
        Delivery { replied, broadcast }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PointsConfig;
    use crate::db::{test_pool, LedgerRepository};
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

    fn ada() -> ChatIdentity {
        ChatIdentity {
            user_id: "1".to_string(),
            login: "ada".to_string(),
            display_name: "Ada".to_string(),
        }
    }

    fn dispatcher(
        chat: Arc<RecordingChat>,
        overlay: Arc<OverlayBroadcaster>,
        points: Option<Arc<PointsService>>,
        commands: &str,
    ) -> Dispatcher {
        Dispatcher::with_tables(
            "!",
            parse_table(commands).unwrap(),
            parse_table(DEFAULT_EVENTS).unwrap(),
            DispatchContext {
                chat,
                overlay,
                points,
            },
        )
    }

    #[test]
    fn templates_substitute_known_and_blank_missing_values() {
        let ctx = TemplateContext {
            username: "Ada".to_string(),
            ..Default::default()
        };
        assert_eq!(
            render_template("Thank you for lurking, {{username}}!", &ctx),
            "Thank you for lurking, Ada!"
        );
        assert_eq!(
            render_template("\nJoin our Discord", &ctx),
            "\nJoin our Discord"
        );
        assert_eq!(
            render_template("Hi {{username}}, {{ unknown }} {{count", &TemplateContext::default()),
            "Hi ,  {{count"
        );
    }

    #[test]
    fn event_payload_fallbacks() {
        let ctx = TemplateContext::from_event_payload(&serde_json::json!({
            "user_id": "2",
            "user_name": "Grace",
            "viewers": 42,
            "followed_at": "2024-06-01T12:00:00Z"
        }));
        assert_eq!(ctx.username, "Grace");
        assert_eq!(ctx.display_name, "Grace");
        assert_eq!(ctx.count, "42");
        assert_eq!(ctx.user_id, "2");
        assert!(!ctx.timestamp.is_empty());
    }

    #[test]
    fn default_tables_parse() {
        let commands = parse_table(DEFAULT_COMMANDS).unwrap();
        assert_eq!(commands["lurk"].timeout.as_deref(), Some("6s"));
        assert_eq!(commands["spam"].cost, 0);
        let events = parse_table(DEFAULT_EVENTS).unwrap();
        assert!(events.contains_key("raid"));
    }

    #[tokio::test]
    async fn lurk_replies_and_broadcasts() {
        let chat = Arc::new(RecordingChat::default());
        let overlay = Arc::new(OverlayBroadcaster::new());
        let (_, mut display) = overlay.register().await;
        let dispatch = dispatcher(chat.clone(), overlay, None, DEFAULT_COMMANDS);

        let outcome = dispatch.handle_chat_message("!LURK quietly", &ada()).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Executed(Delivery {
                replied: true,
                broadcast: true
            })
        );
        assert_eq!(
            chat.sent.lock().unwrap().as_slice(),
            ["Thank you for lurking, Ada!"]
        );

        let frame: serde_json::Value =
            serde_json::from_str(&display.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "command");
        assert_eq!(frame["command_name"], "lurk");
        assert_eq!(frame["text"], "Ada");
        assert_eq!(frame["transition_in"], "fade-in");
    }

    #[tokio::test]
    async fn unknown_command_has_no_effects() {
        let chat = Arc::new(RecordingChat::default());
        let overlay = Arc::new(OverlayBroadcaster::new());
        let (_, mut display) = overlay.register().await;
        let dispatch = dispatcher(chat.clone(), overlay, None, DEFAULT_COMMANDS);

        assert_eq!(
            dispatch.handle_chat_message("!nosuchthing", &ada()).await,
            DispatchOutcome::Unknown
        );
        assert_eq!(
            dispatch.handle_chat_message("hello there", &ada()).await,
            DispatchOutcome::Ignored
        );
        assert!(chat.sent.lock().unwrap().is_empty());
        assert!(display.try_recv().is_err());
    }

    #[tokio::test]
    async fn unaffordable_command_has_no_effects() {
        let pool = test_pool().await;
        let points = Arc::new(PointsService::new(
            pool.clone(),
            Arc::new(Vec::new()),
            PointsConfig::default(),
        ));
        points.ensure_account("1", "Ada").await.unwrap();
        points.award_points("1", 40, "manual").await.unwrap();

        let chat = Arc::new(RecordingChat::default());
        let overlay = Arc::new(OverlayBroadcaster::new());
        let (_, mut display) = overlay.register().await;
        let dispatch = dispatcher(
            chat.clone(),
            overlay,
            Some(points.clone()),
            r#"{ "hug": { "reply": "{{username}} hugs chat", "image": "hug.gif", "cost": 50 } }"#,
        );

        assert_eq!(
            dispatch.handle_chat_message("!hug", &ada()).await,
            DispatchOutcome::Rejected
        );
        assert!(chat.sent.lock().unwrap().is_empty());
        assert!(display.try_recv().is_err());
        assert_eq!(points.get_balance("1").await.unwrap(), 40);
        assert_eq!(LedgerRepository::transaction_sum(&pool, "1").await.unwrap(), 40);

        points.award_points("1", 10, "manual").await.unwrap();
        assert!(matches!(
            dispatch.handle_chat_message("!hug", &ada()).await,
            DispatchOutcome::Executed(_)
        ));
        assert_eq!(points.get_balance("1").await.unwrap(), 0);
        let history = points.get_transactions("1", 1).await.unwrap();
        assert_eq!(history[0].reason, "command:hug");
        assert_eq!(chat.sent.lock().unwrap().as_slice(), ["Ada hugs chat"]);
    }

    #[tokio::test]
    async fn points_extension_reports_balance() {
        let pool = test_pool().await;
        let points = Arc::new(PointsService::new(
            pool,
            Arc::new(Vec::new()),
            PointsConfig::default(),
        ));
        points.ensure_account("1", "Ada").await.unwrap();
        points.award_points("1", 30, "manual").await.unwrap();

        let chat = Arc::new(RecordingChat::default());
        let dispatch = dispatcher(
            chat.clone(),
            Arc::new(OverlayBroadcaster::new()),
            Some(points),
            DEFAULT_COMMANDS,
        );

        dispatch.handle_chat_message("!points", &ada()).await;
        assert_eq!(
            chat.sent.lock().unwrap().as_slice(),
            ["Ada, you have 30 points."]
        );
    }

    #[tokio::test]
    async fn follow_event_uses_event_table() {
        let chat = Arc::new(RecordingChat::default());
        let overlay = Arc::new(OverlayBroadcaster::new());
        let (_, mut display) = overlay.register().await;
        let dispatch = dispatcher(chat.clone(), overlay, None, DEFAULT_COMMANDS);

        let payload = serde_json::json!({ "user_id": "2", "user_name": "Grace" });
        dispatch.handle_event("follow", &payload).await;
        assert_eq!(
            chat.sent.lock().unwrap().as_slice(),
            ["Thanks Grace for the follow!"]
        );
        let frame: serde_json::Value =
            serde_json::from_str(&display.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["event_name"], "follow");
        assert_eq!(frame["video"], "follow-dance.mp4");

        assert_eq!(
            dispatch.handle_event("cheer", &payload).await,
            DispatchOutcome::Unknown
        );
    }
}
