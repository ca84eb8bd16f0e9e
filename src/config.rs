use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub twitch: TwitchConfig,
    pub points: PointsConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS. When unset any origin may read the API.
    pub frontend_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchConfig {
    /// User access token of the bot account. The client does not start without it.
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    /// Channel to join. Defaults to the bot's own channel.
    pub channel_name: Option<String>,
    pub eventsub_url: String,
    /// Helix base URL.
    pub api_url: String,
    /// OAuth base URL, used for token validation.
    pub auth_url: String,
    pub api_timeout_seconds: u64,
    pub reconnect_delay_seconds: u64,
}

impl TwitchConfig {
    /// Credentials the EventSub client needs; the client is not started without them.
    pub fn credentials(&self) -> Result<(String, String), ConfigError> {
        let token = self
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConfigError::MissingEnv("TWITCH_ACCESS_TOKEN".to_string()))?;
        let client_id = self
            .client_id
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ConfigError::MissingEnv("TWITCH_CLIENT_ID".to_string()))?;
        Ok((token, client_id))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsConfig {
    /// Whether the points system (accrual + spending) is enabled.
    pub enabled: bool,
    /// Points awarded to every present viewer on each accrual tick.
    pub points_per_tick: i64,
    /// Window used to count a viewer as recently active in stats.
    pub activity_timeout_seconds: u64,
    /// How often the accrual job runs.
    pub accrual_interval_seconds: u64,
}

/// Longest accepted accrual period.
pub const MAX_ACCRUAL_INTERVAL_SECONDS: u64 = 24 * 60 * 60;
/// Longest accepted activity window.
pub const MAX_ACTIVITY_TIMEOUT_SECONDS: u64 = 30 * 24 * 60 * 60;

impl PointsConfig {
    /// Range check shared by startup and runtime updates.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_ACCRUAL_INTERVAL_SECONDS).contains(&self.accrual_interval_seconds) {
            return Err(format!(
                "accrual_interval_seconds must be between 1 and {}",
                MAX_ACCRUAL_INTERVAL_SECONDS
            ));
        }
        if self.activity_timeout_seconds > MAX_ACTIVITY_TIMEOUT_SECONDS {
            return Err(format!(
                "activity_timeout_seconds must be at most {}",
                MAX_ACTIVITY_TIMEOUT_SECONDS
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    pub command_prefix: String,
    /// Optional JSON file overriding the built-in command table.
    pub commands_path: Option<String>,
    /// Optional JSON file overriding the built-in event table.
    pub events_path: Option<String>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL").ok(),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/twitch.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            twitch: TwitchConfig {
                access_token: env::var("TWITCH_ACCESS_TOKEN").ok(),
                client_id: env::var("TWITCH_CLIENT_ID").ok(),
                channel_name: env::var("TWITCH_CHANNEL_NAME")
                    .ok()
                    .filter(|name| !name.trim().is_empty()),
                eventsub_url: env::var("TWITCH_EVENTSUB_URL")
                    .unwrap_or_else(|_| "wss://eventsub.wss.twitch.tv/ws".to_string()),
                api_url: env::var("TWITCH_API_URL")
                    .unwrap_or_else(|_| "https://api.twitch.tv/helix".to_string()),
                auth_url: env::var("TWITCH_AUTH_URL")
                    .unwrap_or_else(|_| "https://id.twitch.tv/oauth2".to_string()),
                api_timeout_seconds: env::var("TWITCH_API_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                reconnect_delay_seconds: env::var("TWITCH_RECONNECT_DELAY_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            points: PointsConfig {
                enabled: env::var("POINTS_ENABLED")
                    .ok()
                    .and_then(|v| parse_bool(&v))
                    .unwrap_or(true),
                points_per_tick: env::var("POINTS_PER_TICK")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("POINTS_PER_TICK".to_string()))?,
                activity_timeout_seconds: env::var("POINTS_ACTIVITY_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
                accrual_interval_seconds: env::var("POINTS_ACCRUAL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .map_err(|_| {
                        ConfigError::InvalidValue("POINTS_ACCRUAL_INTERVAL_SECONDS".to_string())
                    })?,
            },
            dispatch: DispatchConfig {
                command_prefix: env::var("COMMAND_PREFIX").unwrap_or_else(|_| "!".to_string()),
                commands_path: env::var("COMMANDS_CONFIG_PATH").ok(),
                events_path: env::var("EVENTS_CONFIG_PATH").ok(),
            },
        };

        config.points.validate().map_err(ConfigError::InvalidValue)?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                frontend_url: None,
            },
            database: DatabaseConfig {
                url: "sqlite://data/twitch.db".to_string(),
                max_connections: 5,
            },
            twitch: TwitchConfig {
                access_token: None,
                client_id: None,
                channel_name: None,
                eventsub_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
                api_url: "https://api.twitch.tv/helix".to_string(),
                auth_url: "https://id.twitch.tv/oauth2".to_string(),
                api_timeout_seconds: 10,
                reconnect_delay_seconds: 5,
            },
            points: PointsConfig::default(),
            dispatch: DispatchConfig {
                command_prefix: "!".to_string(),
                commands_path: None,
                events_path: None,
            },
        }
    }
}

impl Default for PointsConfig {
    fn default() -> Self {
        PointsConfig {
            enabled: true,
            points_per_tick: 10,
            activity_timeout_seconds: 5 * 60,
            accrual_interval_seconds: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn credentials_require_both_values() {
        let mut twitch = Config::default().twitch;
        assert!(matches!(
            twitch.credentials(),
            Err(ConfigError::MissingEnv(ref name)) if name == "TWITCH_ACCESS_TOKEN"
        ));

        twitch.access_token = Some("token".to_string());
        assert!(matches!(
            twitch.credentials(),
            Err(ConfigError::MissingEnv(ref name)) if name == "TWITCH_CLIENT_ID"
        ));

        twitch.client_id = Some("client".to_string());
        let (token, client_id) = twitch.credentials().unwrap();
        assert_eq!(token, "token");
        assert_eq!(client_id, "client");
    }

    #[test]
    fn points_validation_bounds_interval_and_timeout() {
        let mut points = PointsConfig::default();
        assert!(points.validate().is_ok());

        points.accrual_interval_seconds = 0;
        assert!(points.validate().is_err());
        points.accrual_interval_seconds = MAX_ACCRUAL_INTERVAL_SECONDS;
        assert!(points.validate().is_ok());
        points.accrual_interval_seconds = u64::MAX;
        assert!(points.validate().is_err());

        points.accrual_interval_seconds = 60;
        points.activity_timeout_seconds = MAX_ACTIVITY_TIMEOUT_SECONDS + 1;
        assert!(points.validate().is_err());
    }
}
