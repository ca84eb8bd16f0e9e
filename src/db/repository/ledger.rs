use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{LedgerStats, PointsTransaction, ViewerAccount};
use crate::error::{AppError, AppResult};

/// Repository for viewer accounts and the points ledger.
///
/// Every balance change runs in a single SQLite transaction together with the
/// ledger row that records it, so the balance column always equals the sum
/// of the account's transaction amounts.
///
/// Spending uses a conditional `UPDATE ... WHERE balance >= ?` instead of a
/// read-then-write, so two concurrent spends on one account cannot both pass
/// the balance check.
pub struct LedgerRepository;

impl LedgerRepository {
    pub async fn find_account(pool: &SqlitePool, user_id: &str) -> AppResult<Option<ViewerAccount>> {
        sqlx::query_as::<_, ViewerAccount>(
            r#"
            SELECT id, display_name, balance, last_seen
            FROM viewer_accounts
            WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Create the account with a zero balance unless it already exists.
    ///
    /// Uses `ON CONFLICT DO NOTHING` so the accrual job and a spend creating
    /// the same account at once both succeed.
    pub async fn get_or_create_account(
        pool: &SqlitePool,
        user_id: &str,
        display_name: &str,
    ) -> AppResult<(ViewerAccount, bool)> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            INSERT INTO viewer_accounts (id, display_name, balance, last_seen)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(display_name)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        let created = result.rows_affected() > 0;

        let account = Self::find_account(pool, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Viewer account {}", user_id)))?;

        Ok((account, created))
    }

    /// Refresh `display_name` and `last_seen` of an existing account.
    /// Returns `false` when the account does not exist.
    pub async fn touch_account(
        pool: &SqlitePool,
        user_id: &str,
        display_name: &str,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE viewer_accounts
            SET display_name = ?, last_seen = ?
            WHERE id = ?
            "#,
        )
        .bind(display_name)
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Add `amount` points to an existing account and log it.
    pub async fn award(
        pool: &SqlitePool,
        user_id: &str,
        amount: i64,
        reason: &str,
    ) -> AppResult<ViewerAccount> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(amount));
        }

        let now = Utc::now().naive_utc();
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let updated = sqlx::query(
            r#"
            UPDATE viewer_accounts
            SET balance = balance + ?, last_seen = ?
            WHERE id = ?
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Viewer account {}", user_id)));
        }

        Self::insert_transaction(&mut tx, user_id, amount, reason, now).await?;

        let account = sqlx::query_as::<_, ViewerAccount>(
            "SELECT id, display_name, balance, last_seen FROM viewer_accounts WHERE id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;

        Ok(account)
    }

    /// Deduct `amount` points if the balance covers it, logging a negative row.
    ///
    /// Nothing is written when the account is missing or the balance is too low.
    pub async fn spend(
        pool: &SqlitePool,
        user_id: &str,
        amount: i64,
        reason: &str,
    ) -> AppResult<ViewerAccount> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(amount));
        }

        let now = Utc::now().naive_utc();
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let updated = sqlx::query(
            r#"
            UPDATE viewer_accounts
            SET balance = balance - ?, last_seen = ?
            WHERE id = ? AND balance >= ?
            "#,
        )
        .bind(amount)
        .bind(now)
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if updated.rows_affected() == 0 {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT balance FROM viewer_accounts WHERE id = ?")
                    .bind(user_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(AppError::Database)?;

            return Err(match available {
                Some(available) => AppError::InsufficientPoints {
                    required: amount,
                    available,
                },
                None => AppError::NotFound(format!("Viewer account {}", user_id)),
            });
        }

        Self::insert_transaction(&mut tx, user_id, -amount, reason, now).await?;

        let account = sqlx::query_as::<_, ViewerAccount>(
            "SELECT id, display_name, balance, last_seen FROM viewer_accounts WHERE id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;

        Ok(account)
    }

    async fn insert_transaction(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        amount: i64,
        reason: &str,
        at: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO points_transactions (user_id, amount, reason, created_at, refunded)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(reason)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Most recent transactions of a user, newest first.
    pub async fn transactions_for(
        pool: &SqlitePool,
        user_id: &str,
        limit: i64,
    ) -> AppResult<Vec<PointsTransaction>> {
        sqlx::query_as::<_, PointsTransaction>(
            r#"
            SELECT id, user_id, amount, reason, created_at, refunded
            FROM points_transactions
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Sum of all ledger amounts for a user.
    #[cfg(test)]
    pub async fn transaction_sum(pool: &SqlitePool, user_id: &str) -> AppResult<i64> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM points_transactions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn stats(pool: &SqlitePool) -> AppResult<LedgerStats> {
        let accounts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM viewer_accounts")
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;
        let transactions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM points_transactions")
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;
        let total_points: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(balance), 0) FROM viewer_accounts")
                .fetch_one(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(LedgerStats {
            accounts,
            transactions,
            total_points,
        })
    }

    /// Number of accounts seen at or after `since`.
    pub async fn count_seen_since(pool: &SqlitePool, since: NaiveDateTime) -> AppResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM viewer_accounts WHERE last_seen >= ?")
            .bind(since)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }
}
