use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::TwitchConfig;
use crate::error::{AppError, AppResult};

/// Scopes the bot token needs for chat, follows and the chatter roster.
pub const REQUIRED_SCOPES: [&str; 5] = [
    "user:read:chat",
    "user:write:chat",
    "channel:read:subscriptions",
    "moderator:read:followers",
    "moderator:read:chatters",
];

// ============================================================================
// User Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TwitchUsersResponse {
    pub data: Vec<TwitchUser>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TwitchUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenValidation {
    pub client_id: String,
    pub login: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: i64,
}

impl TokenValidation {
    pub fn missing_scopes(&self) -> Vec<&'static str> {
        REQUIRED_SCOPES
            .iter()
            .copied()
            .filter(|required| !self.scopes.iter().any(|s| s == required))
            .collect()
    }
}

// ============================================================================
// Chatter Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChattersResponse {
    pub data: Vec<Chatter>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub cursor: Option<String>,
}

/// A viewer currently present in chat.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Chatter {
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
}

// ============================================================================
// EventSub Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CreateEventSubRequest {
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: serde_json::Value,
    pub transport: EventSubTransport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubTransport {
    pub method: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventSubResponse {
    pub data: Vec<EventSubSubscription>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventSubSubscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: serde_json::Value,
    #[serde(default)]
    pub cost: i32,
}

// ============================================================================
// Chat Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SendChatMessageRequest {
    pub broadcaster_id: String,
    pub sender_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendChatMessageResponse {
    pub data: Vec<ChatMessageResult>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageResult {
    pub message_id: String,
    pub is_sent: bool,
    pub drop_reason: Option<DropReason>,
}

#[derive(Debug, Deserialize)]
pub struct DropReason {
    pub code: String,
    pub message: String,
}

/// The slice of the Helix API the EventSub client depends on.
#[async_trait]
pub trait HelixApi: Send + Sync {
    /// The user that owns the access token.
    async fn get_own_user(&self) -> AppResult<TwitchUser>;

    async fn get_user_by_login(&self, login: &str) -> AppResult<Option<TwitchUser>>;

    async fn validate_token(&self) -> AppResult<TokenValidation>;

    async fn create_eventsub_subscription(
        &self,
        subscription_type: &str,
        version: &str,
        condition: serde_json::Value,
        session_id: &str,
    ) -> AppResult<EventSubSubscription>;

    async fn get_chatters(&self, broadcaster_id: &str, moderator_id: &str)
        -> AppResult<Vec<Chatter>>;

    async fn send_chat_message(
        &self,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
    ) -> AppResult<ChatMessageResult>;
}

/// Helix client authenticated with the bot's user access token.
#[derive(Debug, Clone)]
pub struct TwitchService {
    client: Client,
    api_url: String,
    auth_url: String,
    client_id: String,
    access_token: String,
}

impl TwitchService {
    pub fn new(config: &TwitchConfig) -> AppResult<Self> {
        let (access_token, client_id) = config
            .credentials()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let client = Client::builder()
            .timeout(config.api_timeout())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            client_id,
            access_token: access_token
                .strip_prefix("oauth:")
                .unwrap_or(&access_token)
                .to_string(),
        })
    }

    fn helix(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Client-Id", &self.client_id)
    }

    /// Send a request, retrying on 429 and 5xx responses and on network errors.
    ///
    /// Only for reads. Writes go out once, since a retry after a lost
    /// response would repeat the side effect.
    async fn send_with_backoff<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        let mut backoff_secs: u64 = 1;
        let max_backoff_secs: u64 = 8;

        for attempt in 0..MAX_RETRIES {
            match (make_request)().send().await {
                Ok(resp) => {
                    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error()
                    {
                        // Twitch sends Ratelimit-Reset as a unix timestamp
                        let mut wait_secs = backoff_secs;
                        if let Some(reset) = resp
                            .headers()
                            .get("ratelimit-reset")
                            .and_then(|h| h.to_str().ok())
                            .and_then(|s| s.parse::<i64>().ok())
                        {
                            let now = chrono::Utc::now().timestamp();
                            wait_secs = (reset - now).clamp(1, max_backoff_secs as i64) as u64;
                        }

                        tracing::warn!(
                            "Transient Twitch error (status: {}). Retrying in {}s (attempt {}/{})",
                            resp.status(),
                            wait_secs,
                            attempt + 1,
                            MAX_RETRIES
                        );

                        if attempt + 1 >= MAX_RETRIES {
                            let err_text = resp.text().await.unwrap_or_default();
                            return Err(AppError::TwitchApi(format!(
                                "Failed after {} attempts: {}",
                                attempt + 1,
                                err_text
                            )));
                        }

                        tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
                        backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                        continue;
                    }

                    // Non-2xx statuses are left for the caller
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    tracing::warn!(
                        "HTTP request failed: {}. Retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                    continue;
                }
            }
        }

        Err(AppError::TwitchApi(
            "Exceeded Twitch retry attempts".to_string(),
        ))
    }

    async fn fetch_users(&self, login: Option<&str>) -> AppResult<Vec<TwitchUser>> {
        let response = self
            .send_with_backoff(|| {
                let request = self.helix(reqwest::Method::GET, "/users");
                match login {
                    Some(login) => request.query(&[("login", login)]),
                    None => request,
                }
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to get user: {}",
                error_text
            )));
        }

        let users: TwitchUsersResponse = response
            .json()
            .await
            .map_err(|e| AppError::TwitchApi(format!("Failed to parse users response: {}", e)))?;

        Ok(users.data)
    }
}

#[async_trait]
impl HelixApi for TwitchService {
    async fn get_own_user(&self) -> AppResult<TwitchUser> {
        self.fetch_users(None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::TwitchApi("No user found".to_string()))
    }

    async fn get_user_by_login(&self, login: &str) -> AppResult<Option<TwitchUser>> {
        Ok(self.fetch_users(Some(login)).await?.into_iter().next())
    }

    async fn validate_token(&self) -> AppResult<TokenValidation> {
        let response = self
            .send_with_backoff(|| {
                self.client
                    .get(format!("{}/validate", self.auth_url))
                    .header("Authorization", format!("OAuth {}", self.access_token))
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Token validation failed: {}",
                error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::TwitchApi(format!("Failed to parse validate response: {}", e)))
    }

    async fn create_eventsub_subscription(
        &self,
        subscription_type: &str,
        version: &str,
        condition: serde_json::Value,
        session_id: &str,
    ) -> AppResult<EventSubSubscription> {
        let request = CreateEventSubRequest {
            subscription_type: subscription_type.to_string(),
            version: version.to_string(),
            condition,
            transport: EventSubTransport {
                method: "websocket".to_string(),
                session_id: session_id.to_string(),
            },
        };

        let response = self
            .helix(reqwest::Method::POST, "/eventsub/subscriptions")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to create EventSub subscription ({}): {}",
                status, error_text
            )));
        }

        let subscription: EventSubResponse = response.json().await.map_err(|e| {
            AppError::TwitchApi(format!("Failed to parse EventSub response: {}", e))
        })?;

        subscription
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::TwitchApi("No subscription created".to_string()))
    }

    /// Walks every page of the chatter list.
    async fn get_chatters(
        &self,
        broadcaster_id: &str,
        moderator_id: &str,
    ) -> AppResult<Vec<Chatter>> {
        let mut chatters = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let response = self
                .send_with_backoff(|| {
                    let mut request = self
                        .helix(reqwest::Method::GET, "/chat/chatters")
                        .query(&[
                            ("broadcaster_id", broadcaster_id),
                            ("moderator_id", moderator_id),
                            ("first", "1000"),
                        ]);
                    if let Some(ref after) = cursor {
                        request = request.query(&[("after", after.as_str())]);
                    }
                    request
                })
                .await?;

            if !response.status().is_success() {
                let error_text = response.text().await.unwrap_or_default();
                return Err(AppError::TwitchApi(format!(
                    "Failed to get chatters: {}",
                    error_text
                )));
            }

            let page: ChattersResponse = response.json().await.map_err(|e| {
                AppError::TwitchApi(format!("Failed to parse chatters response: {}", e))
            })?;

            chatters.extend(page.data);

            match page.pagination.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(chatters)
    }

    async fn send_chat_message(
        &self,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
    ) -> AppResult<ChatMessageResult> {
        let request = SendChatMessageRequest {
            broadcaster_id: broadcaster_id.to_string(),
            sender_id: sender_id.to_string(),
            message: message.to_string(),
        };

        let response = self
            .helix(reqwest::Method::POST, "/chat/messages")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::TwitchApi(format!(
                "Failed to send chat message ({}): {}",
                status, error_text
            )));
        }

        let result: SendChatMessageResponse = response.json().await.map_err(|e| {
            AppError::TwitchApi(format!("Failed to parse chat message response: {}", e))
        })?;

        result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::TwitchApi("No message result returned".to_string()))
    }
}
