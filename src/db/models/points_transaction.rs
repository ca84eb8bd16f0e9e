use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Reason tag used by the accrual job.
pub const REASON_ACCRUAL_WATCHING: &str = "accrual:watching";

/// One row of the append-only ledger. Positive amounts are awards, negative
/// amounts are spends.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub reason: String,
    pub created_at: NaiveDateTime,
    pub refunded: bool,
}

/// Aggregate numbers over the whole ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerStats {
    pub accounts: i64,
    pub transactions: i64,
    pub total_points: i64,
}
