//! Lock-retry transaction runner.
//!
//! DDL such as `ALTER TABLE` needs an `ACCESS EXCLUSIVE` lock. While it waits
//! for that lock every later query on the table queues behind it, so a single
//! long-running transaction can stall production traffic. The runner instead
//! tries the block with a short `lock_timeout`, gives up quickly, sleeps and
//! tries again with progressively longer timeouts. When all timed attempts
//! failed it either reports exhaustion or runs the block one last time without
//! any lock timeout.

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

/// Ordered `(lock_timeout, sleep)` tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfiguration {
    entries: Vec<(Duration, Duration)>,
}

const fn tier(lock_timeout_ms: u64, sleep_ms: u64) -> (u64, u64) {
    (lock_timeout_ms, sleep_ms)
}

/// Production tiers: quick retries first, then progressively longer timeouts
/// separated by long sleeps. About 32 minutes of sleeping in total.
const DEFAULT_TIMING_MS: [(u64, u64); 41] = [
    tier(100, 50),
    tier(100, 50),
    tier(200, 50),
    tier(300, 100),
    tier(400, 150),
    tier(500, 2_000),
    tier(500, 2_000),
    tier(500, 2_000),
    tier(500, 2_000),
    tier(1_000, 5_000),
    tier(1_000, 60_000),
    tier(100, 50),
    tier(100, 50),
    tier(200, 50),
    tier(300, 100),
    tier(400, 150),
    tier(500, 2_000),
    tier(500, 2_000),
    tier(500, 2_000),
    tier(3_000, 180_000),
    tier(100, 50),
    tier(100, 50),
    tier(500, 2_000),
    tier(500, 2_000),
    tier(5_000, 120_000),
    tier(500, 500),
    tier(500, 500),
    tier(7_000, 300_000),
    tier(500, 500),
    tier(500, 500),
    tier(7_000, 300_000),
    tier(500, 500),
    tier(500, 500),
    tier(7_000, 300_000),
    tier(100, 50),
    tier(100, 50),
    tier(500, 2_000),
    tier(10_000, 600_000),
    tier(100, 50),
    tier(500, 2_000),
    tier(10_000, 600_000),
];

impl Default for TimingConfiguration {
    fn default() -> Self {
        Self::new(
            DEFAULT_TIMING_MS
                .iter()
                .map(|&(lock, sleep)| (Duration::from_millis(lock), Duration::from_millis(sleep)))
                .collect(),
        )
    }
}

impl TimingConfiguration {
    /// Tiers in attempt order. Config validation rejects an empty list; an
    /// empty configuration here behaves as "no timed attempts".
    pub fn new(entries: Vec<(Duration, Duration)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tier for a 1-based iteration.
    pub fn tier(&self, iteration: usize) -> Option<(Duration, Duration)> {
        iteration
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .copied()
    }

    /// Sum of all sleeps between timed attempts.
    pub fn total_sleep(&self) -> Duration {
        let n = self.entries.len().saturating_sub(1);
        self.entries.iter().take(n).map(|(_, sleep)| *sleep).sum()
    }
}

/// Runs a block under the lock-retry policy.
///
/// ```ignore
/// let mut retries = WithLockRetries::new(TimingConfiguration::default());
/// retries
///     .run(&mut ctx, false, |ctx| {
///         Box::pin(async move { ctx.execute("ALTER TABLE projects ADD COLUMN x int").await })
///     })
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct WithLockRetries {
    timing: TimingConfiguration,
    disabled: bool,
    iteration: usize,
}

impl WithLockRetries {
    pub fn new(timing: TimingConfiguration) -> Self {
        Self {
            timing,
            disabled: false,
            iteration: 1,
        }
    }

    /// Run the block once with no timeout or retries (`DISABLE_LOCK_RETRIES`).
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Current 1-based attempt number.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Execute `block`, retrying on lock timeouts.
    ///
    /// Each timed attempt runs in its own transaction (a savepoint when one is
    /// already open). With `raise_on_exhaustion` the runner returns
    /// [`MigrateError::AttemptsExhausted`] after the last timed attempt;
    /// otherwise it makes one final attempt with `lock_timeout` disabled.
    pub async fn run<T, F>(
        &mut self,
        ctx: &mut MigrationContext,
        raise_on_exhaustion: bool,
        mut block: F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        if self.disabled {
            info!("DISABLE_LOCK_RETRIES is set, executing the block without retry");
            return block(ctx).await;
        }

        let result = self.run_with_retries(ctx, raise_on_exhaustion, &mut block).await;
        let reset = self.reset_db_settings(ctx).await;
        let value = result?;
        reset?;
        Ok(value)
    }

    async fn run_with_retries<T, F>(
        &mut self,
        ctx: &mut MigrationContext,
        raise_on_exhaustion: bool,
        block: &mut F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        loop {
            let Some((lock_timeout, sleep)) = self.timing.tier(self.iteration) else {
                break;
            };

            match self.run_with_lock_timeout(ctx, lock_timeout, block).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_lock_timeout() => {
                    if self.iteration >= self.timing.len() {
                        break;
                    }
                    if ctx.transaction_open() {
                        ctx.execute("SET LOCAL idle_in_transaction_session_timeout TO '0'")
                            .await?;
                    }
                    info!(
                        iteration = self.iteration,
                        sleep_ms = sleep.as_millis() as u64,
                        "Lock timeout, retrying after sleep"
                    );
                    tokio::time::sleep(sleep).await;
                    self.iteration += 1;
                    self.reset_db_settings(ctx).await?;
                }
                Err(err) => return Err(err),
            }
        }

        self.reset_db_settings(ctx).await?;
        if raise_on_exhaustion {
            return Err(MigrateError::AttemptsExhausted {
                attempts: self.timing.len(),
            });
        }
        self.run_without_lock_timeout(ctx, block).await
    }

    async fn run_with_lock_timeout<T, F>(
        &self,
        ctx: &mut MigrationContext,
        lock_timeout: Duration,
        block: &mut F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        ctx.begin().await?;
        let attempt = async {
            ctx.execute(&format!(
                "SET LOCAL lock_timeout TO '{}ms'",
                lock_timeout.as_millis()
            ))
            .await?;
            info!(
                iteration = self.iteration,
                lock_timeout_ms = lock_timeout.as_millis() as u64,
                "Lock timeout is set"
            );
            block(&mut *ctx).await
        }
        .await;
        finish_attempt(ctx, attempt).await
    }

    async fn run_without_lock_timeout<T, F>(
        &self,
        ctx: &mut MigrationContext,
        block: &mut F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        warn!(
            iteration = self.iteration,
            "Couldn't acquire lock to perform the migration, executing without lock timeout"
        );
        ctx.begin().await?;
        let attempt = async {
            ctx.execute("SET LOCAL lock_timeout TO '0'").await?;
            block(&mut *ctx).await
        }
        .await;
        let result = finish_attempt(ctx, attempt).await;
        if result.is_ok() {
            info!(iteration = self.iteration, "Migration finished");
        }
        result
    }

    async fn reset_db_settings(&self, ctx: &mut MigrationContext) -> Result<()> {
        if ctx.transaction_open() {
            return Ok(());
        }
        ctx.execute("RESET idle_in_transaction_session_timeout; RESET lock_timeout")
            .await
    }
}

/// Commit a successful attempt, roll back a failed one.
async fn finish_attempt<T>(ctx: &mut MigrationContext, attempt: Result<T>) -> Result<T> {
    match attempt {
        Ok(value) => {
            ctx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = ctx.rollback().await {
                warn!("Rollback after failed attempt also failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationSettings;
    use crate::testing::FakeConnection;

    fn short_timing(n: usize) -> TimingConfiguration {
        TimingConfiguration::new(
            (1..=n as u64)
                .map(|i| (Duration::from_millis(i * 10), Duration::from_millis(i * 100)))
                .collect(),
        )
    }

    fn context(conn: &FakeConnection) -> MigrationContext {
        MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default())
    }

    fn alter_block(ctx: &mut MigrationContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { ctx.execute("ALTER TABLE projects ADD COLUMN x int").await })
    }

    fn broken_block(ctx: &mut MigrationContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            ctx.execute("ALTER TABLE t ADD COLUMN y int").await?;
            Err(MigrateError::usage("broken migration"))
        })
    }

    #[test]
    fn test_default_timing_configuration() {
        let timing = TimingConfiguration::default();
        assert_eq!(timing.len(), 41);
        assert_eq!(
            timing.tier(1),
            Some((Duration::from_millis(100), Duration::from_millis(50)))
        );
        assert_eq!(
            timing.tier(41),
            Some((Duration::from_secs(10), Duration::from_secs(600)))
        );
        assert_eq!(timing.tier(0), None);
        assert_eq!(timing.tier(42), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_first_attempt() {
        let conn = FakeConnection::new();
        let mut ctx = context(&conn);
        let mut retries = WithLockRetries::new(short_timing(3));

        retries.run(&mut ctx, false, alter_block).await.unwrap();

        assert_eq!(retries.iteration(), 1);
        assert_eq!(
            conn.statements(),
            vec![
                "BEGIN",
                "SET LOCAL lock_timeout TO '10ms'",
                "ALTER TABLE projects ADD COLUMN x int",
                "COMMIT",
                "RESET idle_in_transaction_session_timeout; RESET lock_timeout",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_growing_timeouts() {
        let conn = FakeConnection::new();
        conn.fail_with_lock_timeout("ALTER TABLE", 2);
        let mut ctx = context(&conn);
        let mut retries = WithLockRetries::new(short_timing(3));
        let started = tokio::time::Instant::now();

        retries.run(&mut ctx, false, alter_block).await.unwrap();

        assert_eq!(retries.iteration(), 3);
        assert_eq!(
            conn.statements_matching("SET LOCAL lock_timeout"),
            vec![
                "SET LOCAL lock_timeout TO '10ms'",
                "SET LOCAL lock_timeout TO '20ms'",
                "SET LOCAL lock_timeout TO '30ms'",
            ]
        );
        assert_eq!(conn.statements_matching("ROLLBACK").len(), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(100 + 200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_attempt_runs_without_timeout() {
        let conn = FakeConnection::new();
        conn.fail_with_lock_timeout("ALTER TABLE", 3);
        let mut ctx = context(&conn);
        let timing = short_timing(3);
        let total_sleep = timing.total_sleep();
        let mut retries = WithLockRetries::new(timing);
        let started = tokio::time::Instant::now();

        retries.run(&mut ctx, false, alter_block).await.unwrap();

        // N timed attempts plus one untimed attempt, no sleep after the last
        assert_eq!(conn.statements_matching("ALTER TABLE").len(), 4);
        assert_eq!(conn.statements_matching("SET LOCAL lock_timeout TO '0'").len(), 1);
        assert_eq!(started.elapsed(), total_sleep);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_on_exhaustion() {
        let conn = FakeConnection::new();
        conn.fail_with_lock_timeout("ALTER TABLE", 10);
        let mut ctx = context(&conn);
        let mut retries = WithLockRetries::new(short_timing(2));

        let err = retries.run(&mut ctx, true, alter_block).await.unwrap_err();

        assert!(matches!(err, MigrateError::AttemptsExhausted { attempts: 2 }));
        assert_eq!(conn.statements_matching("ALTER TABLE").len(), 2);
        assert!(!ctx.transaction_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let conn = FakeConnection::new();
        let mut ctx = context(&conn);
        let mut retries = WithLockRetries::new(short_timing(3));

        let err = retries.run(&mut ctx, false, broken_block).await.unwrap_err();

        assert!(matches!(err, MigrateError::InvalidUsage(_)));
        assert_eq!(conn.statements_matching("ALTER TABLE").len(), 1);
        assert_eq!(conn.statements_matching("ROLLBACK").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_in_open_transaction_uses_savepoints() {
        let conn = FakeConnection::new();
        conn.fail_with_lock_timeout("ALTER TABLE", 1);
        let mut ctx = context(&conn);
        ctx.begin().await.unwrap();
        let mut retries = WithLockRetries::new(short_timing(2));

        retries.run(&mut ctx, false, alter_block).await.unwrap();
        ctx.commit().await.unwrap();

        let statements = conn.statements();
        assert!(statements.contains(&"SAVEPOINT online_migrate_sp_1".to_string()));
        assert!(statements.contains(&"ROLLBACK TO SAVEPOINT online_migrate_sp_1".to_string()));
        assert!(statements
            .contains(&"SET LOCAL idle_in_transaction_session_timeout TO '0'".to_string()));
        // settings are only reset once no transaction is open
        assert!(conn.statements_matching("RESET").is_empty());
    }

    #[tokio::test]
    async fn test_disabled_runs_once_without_timeout() {
        let conn = FakeConnection::new();
        let mut ctx = context(&conn);
        let mut retries = WithLockRetries::new(short_timing(3)).disabled(true);

        retries.run(&mut ctx, false, alter_block).await.unwrap();

        assert_eq!(conn.statements(), vec!["ALTER TABLE projects ADD COLUMN x int"]);
    }
}
