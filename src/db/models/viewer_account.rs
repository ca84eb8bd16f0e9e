use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A viewer's points account. `balance` is a materialized sum of the viewer's
/// rows in `points_transactions` and is only ever changed together with one.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ViewerAccount {
    /// Twitch user id
    pub id: String,
    /// Display name as last seen in chat or in the roster
    pub display_name: String,
    pub balance: i64,
    pub last_seen: NaiveDateTime,
}
