use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PointsConfig;
use crate::db::models::{PointsTransaction, ViewerAccount, REASON_ACCRUAL_WATCHING};
use crate::db::LedgerRepository;
use crate::error::{AppError, AppResult};
use crate::services::twitch::Chatter;

/// Source of "who is watching right now".
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Never fails; an unavailable roster is empty.
    async fn query_roster(&self) -> Vec<Chatter>;
}

/// Fixed roster, used when no live client is available.
#[async_trait]
impl RosterSource for Vec<Chatter> {
    async fn query_roster(&self) -> Vec<Chatter> {
        self.clone()
    }
}

/// Partial runtime update of the points settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PointsConfigUpdate {
    pub enabled: Option<bool>,
    pub points_per_tick: Option<i64>,
    pub activity_timeout_seconds: Option<u64>,
    pub accrual_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccrualSummary {
    pub viewers: usize,
    pub awarded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointsStats {
    pub enabled: bool,
    pub running: bool,
    pub points_per_tick: i64,
    pub activity_timeout_seconds: u64,
    pub accrual_interval_seconds: u64,
    pub accounts: i64,
    pub transactions: i64,
    pub total_points: i64,
    /// Accounts seen within the activity timeout.
    pub recently_active: i64,
}

struct Scheduler {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Balance semantics on top of the ledger plus the periodic accrual job.
pub struct PointsService {
    pool: SqlitePool,
    roster: Arc<dyn RosterSource>,
    settings: RwLock<PointsConfig>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl PointsService {
    pub fn new(pool: SqlitePool, roster: Arc<dyn RosterSource>, settings: PointsConfig) -> Self {
        Self {
            pool,
            roster,
            settings: RwLock::new(settings),
            scheduler: Mutex::new(None),
        }
    }

    pub async fn settings(&self) -> PointsConfig {
        self.settings.read().await.clone()
    }

    pub async fn is_enabled(&self) -> bool {
        self.settings.read().await.enabled
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    /// Arm the accrual job. No-op when disabled or already running.
    ///
    /// The first tick fires one interval after start. A tick always finishes
    /// before the next one can begin; late ticks are delayed, never bunched.
    pub async fn start(self: &Arc<Self>) {
        let settings = self.settings().await;
        if !settings.enabled {
            tracing::info!("Points system disabled, accrual not started");
            return;
        }

        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return;
        }

        let period = Duration::from_secs(settings.accrual_interval_seconds.max(1));
        let Some(first_tick) = Instant::now().checked_add(period) else {
            tracing::error!(
                "Accrual interval of {}s is out of range, accrual not started",
                period.as_secs()
            );
            return;
        };
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let service = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let summary = service.run_accrual_tick().await;
                        tracing::debug!(
                            "Accrual tick: {} viewers, {} awarded, {} failed",
                            summary.viewers,
                            summary.awarded,
                            summary.failed
                        );
                    }
                }
            }
        });

        *scheduler = Some(Scheduler {
            stop: stop_tx,
            handle,
        });
        tracing::info!(
            "Points accrual started: {} points every {}s",
            settings.points_per_tick,
            period.as_secs()
        );
    }

    /// Disarm the accrual job and wait for an in-flight tick. Idempotent.
    pub async fn stop(&self) {
        let scheduler = self.scheduler.lock().await.take();
        if let Some(scheduler) = scheduler {
            let _ = scheduler.stop.send(());
            if let Err(e) = scheduler.handle.await {
                tracing::warn!("Accrual task ended abnormally: {}", e);
            }
            tracing::info!("Points accrual stopped");
        }
    }

    /// Award the per-tick amount to every viewer in the current roster.
    pub async fn run_accrual_tick(&self) -> AccrualSummary {
        let amount = self.settings.read().await.points_per_tick;
        let roster = self.roster.query_roster().await;

        let mut seen = HashSet::new();
        let mut summary = AccrualSummary::default();

        for chatter in roster {
            if !seen.insert(chatter.user_id.clone()) {
                continue;
            }
            summary.viewers += 1;

            match self.accrue(&chatter, amount).await {
                Ok(_) => summary.awarded += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        "Failed to award {} points to {} ({}): {}",
                        amount,
                        chatter.user_name,
                        chatter.user_id,
                        e
                    );
                }
            }
        }

        summary
    }

    async fn accrue(&self, chatter: &Chatter, amount: i64) -> AppResult<ViewerAccount> {
        let account = self.ensure_account(&chatter.user_id, &chatter.user_name).await?;
        if account.display_name != chatter.user_name {
            LedgerRepository::touch_account(&self.pool, &chatter.user_id, &chatter.user_name)
                .await?;
        }
        LedgerRepository::award(&self.pool, &chatter.user_id, amount, REASON_ACCRUAL_WATCHING)
            .await
    }

    /// Create the account with a zero balance if it does not exist yet.
    pub async fn ensure_account(&self, user_id: &str, display_name: &str) -> AppResult<ViewerAccount> {
        let (account, created) =
            LedgerRepository::get_or_create_account(&self.pool, user_id, display_name).await?;
        if created {
            tracing::info!("Created points account for {} ({})", display_name, user_id);
        }
        Ok(account)
    }

    pub async fn award_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
    ) -> AppResult<ViewerAccount> {
        let account = LedgerRepository::award(&self.pool, user_id, amount, reason).await?;
        tracing::debug!("Awarded {} points to {} ({})", amount, user_id, reason);
        Ok(account)
    }

    pub async fn spend_points(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
    ) -> AppResult<ViewerAccount> {
        let account = LedgerRepository::spend(&self.pool, user_id, amount, reason).await?;
        tracing::info!(
            "{} spent {} points ({}), {} left",
            user_id,
            amount,
            reason,
            account.balance
        );
        Ok(account)
    }

    /// Point-in-time check, not a reservation. Always true while disabled.
    pub async fn can_afford(&self, user_id: &str, cost: i64) -> bool {
        if !self.is_enabled().await {
            return true;
        }

        match self.get_balance(user_id).await {
            Ok(balance) => balance >= cost,
            Err(e) => {
                tracing::warn!("Could not read balance of {}: {}", user_id, e);
                false
            }
        }
    }

    pub async fn get_account(&self, user_id: &str) -> AppResult<Option<ViewerAccount>> {
        LedgerRepository::find_account(&self.pool, user_id).await
    }

    /// Current balance; unknown viewers have zero.
    pub async fn get_balance(&self, user_id: &str) -> AppResult<i64> {
        Ok(self
            .get_account(user_id)
            .await?
            .map(|account| account.balance)
            .unwrap_or(0))
    }

    pub async fn get_transactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> AppResult<Vec<PointsTransaction>> {
        LedgerRepository::transactions_for(&self.pool, user_id, limit.clamp(1, 500)).await
    }

    /// Chat activity refreshes name and last-seen of a known account.
    pub async fn record_activity(&self, user_id: &str, display_name: &str) {
        match LedgerRepository::touch_account(&self.pool, user_id, display_name).await {
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to record activity for {}: {}", user_id, e),
        }
    }

    pub async fn stats(&self) -> AppResult<PointsStats> {
        let settings = self.settings().await;
        let ledger = LedgerRepository::stats(&self.pool).await?;
        let since = i64::try_from(settings.activity_timeout_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|window| chrono::Utc::now().naive_utc().checked_sub_signed(window))
            .unwrap_or(chrono::NaiveDateTime::MIN);
        let recently_active = LedgerRepository::count_seen_since(&self.pool, since).await?;

        Ok(PointsStats {
            enabled: settings.enabled,
            running: self.is_running().await,
            points_per_tick: settings.points_per_tick,
            activity_timeout_seconds: settings.activity_timeout_seconds,
            accrual_interval_seconds: settings.accrual_interval_seconds,
            accounts: ledger.accounts,
            transactions: ledger.transactions,
            total_points: ledger.total_points,
            recently_active,
        })
    }

    /// Apply a runtime settings change. A new interval restarts the scheduler;
    /// toggling `enabled` starts or stops it.
    pub async fn update_config(self: &Arc<Self>, update: PointsConfigUpdate) -> AppResult<PointsConfig> {
        if let Some(points) = update.points_per_tick {
            if points <= 0 {
                return Err(AppError::InvalidAmount(points));
            }
        }

        let (before, after) = {
            let mut settings = self.settings.write().await;
            let before = settings.clone();
            let mut next = before.clone();
            if let Some(enabled) = update.enabled {
                next.enabled = enabled;
            }
            if let Some(points) = update.points_per_tick {
                next.points_per_tick = points;
            }
            if let Some(timeout) = update.activity_timeout_seconds {
                next.activity_timeout_seconds = timeout;
            }
            if let Some(interval) = update.accrual_interval_seconds {
                next.accrual_interval_seconds = interval;
            }
            next.validate().map_err(AppError::BadRequest)?;
            *settings = next.clone();
            (before, next)
        };

        tracing::info!(
            "Points config updated: enabled={}, {} points every {}s, activity timeout {}s",
            after.enabled,
            after.points_per_tick,
            after.accrual_interval_seconds,
            after.activity_timeout_seconds
        );

        if !after.enabled {
            self.stop().await;
        } else if !before.enabled {
            self.start().await;
        } else if before.accrual_interval_seconds != after.accrual_interval_seconds
            && self.is_running().await
        {
            self.stop().await;
            self.start().await;
        }

        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn chatter(id: &str, name: &str) -> Chatter {
        Chatter {
            user_id: id.to_string(),
            user_login: name.to_lowercase(),
            user_name: name.to_string(),
        }
    }

    fn service(pool: SqlitePool, roster: Vec<Chatter>, settings: PointsConfig) -> Arc<PointsService> {
        Arc::new(PointsService::new(pool, Arc::new(roster), settings))
    }

    #[tokio::test]
    async fn accrual_awards_each_viewer_once_and_creates_accounts() {
        let pool = test_pool().await;
        LedgerRepository::get_or_create_account(&pool, "1", "Ada").await.unwrap();
        LedgerRepository::award(&pool, "1", 5, "manual").await.unwrap();

        let roster = vec![
            chatter("1", "Ada"),
            chatter("2", "Grace"),
            chatter("3", "Linus"),
            chatter("2", "Grace"),
        ];
        let points = service(pool.clone(), roster, PointsConfig::default());

        let summary = points.run_accrual_tick().await;
        assert_eq!(
            summary,
            AccrualSummary {
                viewers: 3,
                awarded: 3,
                failed: 0
            }
        );

        assert_eq!(points.get_balance("1").await.unwrap(), 15);
        assert_eq!(points.get_balance("2").await.unwrap(), 10);
        assert_eq!(points.get_balance("3").await.unwrap(), 10);

        let history = points.get_transactions("2", 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, REASON_ACCRUAL_WATCHING);
    }

    #[tokio::test]
    async fn accrual_continues_past_a_failing_viewer() {
        let pool = test_pool().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_viewer_two BEFORE UPDATE OF balance ON viewer_accounts
            WHEN NEW.id = '2'
            BEGIN
                SELECT RAISE(ABORT, 'rejected');
            END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let roster = vec![chatter("1", "Ada"), chatter("2", "Grace"), chatter("3", "Linus")];
        let points = service(pool.clone(), roster, PointsConfig::default());

        let summary = points.run_accrual_tick().await;
        assert_eq!(summary.awarded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(points.get_balance("1").await.unwrap(), 10);
        assert_eq!(points.get_balance("2").await.unwrap(), 0);
        assert_eq!(points.get_balance("3").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn can_afford_ignores_balance_when_disabled() {
        let pool = test_pool().await;
        let disabled = PointsConfig {
            enabled: false,
            ..PointsConfig::default()
        };
        let points = service(pool.clone(), Vec::new(), disabled);
        assert!(points.can_afford("nobody", 1_000).await);

        let points = service(pool, Vec::new(), PointsConfig::default());
        assert!(!points.can_afford("nobody", 1).await);
        assert!(points.can_afford("nobody", 0).await);
    }

    #[tokio::test]
    async fn start_is_noop_when_disabled_and_stop_is_idempotent() {
        let pool = test_pool().await;
        let points = service(
            pool,
            Vec::new(),
            PointsConfig {
                enabled: false,
                ..PointsConfig::default()
            },
        );

        points.start().await;
        assert!(!points.is_running().await);
        points.stop().await;
        points.stop().await;
    }

    #[tokio::test]
    async fn scheduler_ticks_after_one_interval_and_stops_cleanly() {
        let pool = test_pool().await;
        let points = service(
            pool,
            vec![chatter("1", "Ada")],
            PointsConfig {
                accrual_interval_seconds: 1,
                ..PointsConfig::default()
            },
        );

        points.start().await;
        points.start().await;
        assert!(points.is_running().await);
        assert_eq!(points.get_balance("1").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        points.stop().await;

        assert!(!points.is_running().await);
        assert_eq!(points.get_balance("1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn interval_change_restarts_scheduler() {
        let pool = test_pool().await;
        let points = service(pool, Vec::new(), PointsConfig::default());
        points.start().await;

        let updated = points
            .update_config(PointsConfigUpdate {
                accrual_interval_seconds: Some(120),
                points_per_tick: Some(25),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.accrual_interval_seconds, 120);
        assert_eq!(updated.points_per_tick, 25);
        assert!(points.is_running().await);

        points
            .update_config(PointsConfigUpdate {
                enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!points.is_running().await);

        assert!(matches!(
            points
                .update_config(PointsConfigUpdate {
                    points_per_tick: Some(0),
                    ..Default::default()
                })
                .await,
            Err(AppError::InvalidAmount(0))
        ));
    }

    #[tokio::test]
    async fn out_of_range_settings_are_rejected_and_scheduler_keeps_running() {
        let pool = test_pool().await;
        let points = service(pool, Vec::new(), PointsConfig::default());
        points.start().await;

        let result = points
            .update_config(PointsConfigUpdate {
                accrual_interval_seconds: Some(u64::MAX),
                points_per_tick: Some(25),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let result = points
            .update_config(PointsConfigUpdate {
                activity_timeout_seconds: Some(100_000_000_000_000_000),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let settings = points.settings().await;
        assert_eq!(settings.accrual_interval_seconds, 60);
        assert_eq!(settings.points_per_tick, 10);
        assert_eq!(settings.activity_timeout_seconds, 300);
        assert!(points.is_running().await);
        assert!(points.stats().await.is_ok());
        points.stop().await;
    }

    #[tokio::test]
    async fn stats_tolerate_an_unbounded_activity_window() {
        let pool = test_pool().await;
        let points = service(
            pool,
            Vec::new(),
            PointsConfig {
                activity_timeout_seconds: u64::MAX,
                ..PointsConfig::default()
            },
        );
        points.ensure_account("1", "Ada").await.unwrap();

        let stats = points.stats().await.unwrap();
        assert_eq!(stats.recently_active, 1);
    }

    #[tokio::test]
    async fn activity_only_touches_existing_accounts() {
        let pool = test_pool().await;
        let points = service(pool, Vec::new(), PointsConfig::default());

        points.record_activity("1", "Ada").await;
        assert!(points.get_account("1").await.unwrap().is_none());

        points.ensure_account("1", "ada").await.unwrap();
        points.record_activity("1", "Ada").await;
        let account = points.get_account("1").await.unwrap().unwrap();
        assert_eq!(account.display_name, "Ada");

        let stats = points.stats().await.unwrap();
        assert_eq!(stats.accounts, 1);
        assert_eq!(stats.recently_active, 1);
    }
}
