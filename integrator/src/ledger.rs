//! Job ledger: one row per tile recording its processing status.
//!
//! Workers coordinate only through the ledger. A claim is a single atomic
//! transition (`pending` or stale `in_progress` to `in_progress`) that bumps
//! the tile's attempt counter; completion and failure are accepted only from
//! the attempt that currently holds the claim.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::{info, warn};

use shared::{TileStatus, UnknownStatus};

/// Postgres SQLSTATE codes for serialization failure and deadlock.
const CONTENTION_CODES: [&str; 2] = ["40001", "40P01"];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("ledger contention: {0}")]
    Contention(String),
    #[error("ledger row is unreadable: {0}")]
    InvalidStatus(#[from] UnknownStatus),
    #[error("ledger lock poisoned")]
    Poisoned,
}

impl LedgerError {
    pub fn is_contention(&self) -> bool {
        matches!(self, LedgerError::Contention(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        let contended = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| CONTENTION_CODES.iter().any(|known| *known == code));
        if contended {
            LedgerError::Contention(err.to_string())
        } else {
            LedgerError::Database(err)
        }
    }
}

/// Proof that a worker holds a tile. `attempt` identifies the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub tile_id: String,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    /// The tile was taken over from an abandoned claim.
    pub reclaimed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileJob {
    pub tile_id: String,
    pub status: TileStatus,
    pub attempt: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_reference: Option<String>,
    pub error_message: Option<String>,
}

impl TileJob {
    fn pending(tile_id: &str) -> Self {
        Self {
            tile_id: tile_id.to_string(),
            status: TileStatus::Pending,
            attempt: 0,
            started_at: None,
            completed_at: None,
            output_reference: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
}

impl LedgerSummary {
    /// Counts of `jobs` by status.
    pub fn of_jobs<'a>(jobs: impl IntoIterator<Item = &'a TileJob>) -> Self {
        let mut summary = Self::default();
        for job in jobs {
            summary.record(job.status, 1);
        }
        summary
    }

    fn record(&mut self, status: TileStatus, count: u64) {
        match status {
            TileStatus::Pending => self.pending += count,
            TileStatus::InProgress => self.in_progress += count,
            TileStatus::Done => self.done += count,
            TileStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed
    }

    /// Tiles that have not reached a terminal state.
    pub fn unfinished(&self) -> u64 {
        self.pending + self.in_progress
    }
}

pub trait JobLedger: Send + Sync {
    /// Inserts a pending job for every tile not yet known. Returns the number added.
    fn register(&self, tile_ids: &[String]) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Atomically claims one pending (or abandoned) tile.
    fn claim_next(&self) -> impl Future<Output = Result<Option<Claim>, LedgerError>> + Send;

    /// Like [`JobLedger::claim_next`], restricted to `tile_ids`.
    fn claim_next_in(&self, tile_ids: &[String]) -> impl Future<Output = Result<Option<Claim>, LedgerError>> + Send;

    /// Marks the claimed tile done. `Ok(false)` when the claim is no longer current.
    fn complete(&self, claim: &Claim, output_reference: &str) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    /// Marks the claimed tile failed. `Ok(false)` when the claim is no longer current.
    fn fail(&self, claim: &Claim, reason: &str) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    /// Puts every tile back to pending. Attempt counters are kept.
    fn reset_all(&self) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Puts failed tiles back to pending.
    fn retry_failed(&self) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    fn summary(&self) -> impl Future<Output = Result<LedgerSummary, LedgerError>> + Send;

    /// Every job, ordered by tile id.
    fn jobs(&self) -> impl Future<Output = Result<Vec<TileJob>, LedgerError>> + Send;

    /// Completed jobs, ordered by tile id.
    fn done_jobs(&self) -> impl Future<Output = Result<Vec<TileJob>, LedgerError>> + Send;
}

fn log_rejected(claim: &Claim, outcome: &str) {
    warn!(
        tile = %claim.tile_id,
        attempt = claim.attempt,
        outcome,
        "ledger rejected result from a claim that is no longer current"
    );
}

/// In-process ledger for single-process runs and tests. Not crash-resumable.
#[derive(Debug)]
pub struct MemoryLedger {
    jobs: Mutex<BTreeMap<String, TileJob>>,
    stale_after: Duration,
}

impl MemoryLedger {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            stale_after,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, TileJob>>, LedgerError> {
        self.jobs.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// A claim started "in the future" (clock stepped back) is still live.
    fn is_stale(&self, job: &TileJob, now: DateTime<Utc>) -> bool {
        if job.status != TileStatus::InProgress {
            return false;
        }
        match job.started_at {
            Some(started) => (now - started).to_std().map_or(false, |age| age > self.stale_after),
            None => true,
        }
    }

    /// [`JobLedger::claim_next`] evaluated at an explicit time.
    pub fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<Claim>, LedgerError> {
        self.claim_matching(now, |_| true)
    }

    fn claim_matching(
        &self,
        now: DateTime<Utc>,
        wanted: impl Fn(&str) -> bool,
    ) -> Result<Option<Claim>, LedgerError> {
        let mut jobs = self.lock()?;
        let Some(job) = jobs.values_mut().find(|job| {
            wanted(&job.tile_id) && (job.status == TileStatus::Pending || self.is_stale(job, now))
        }) else {
            return Ok(None);
        };
        let reclaimed = job.status == TileStatus::InProgress;
        job.status = TileStatus::InProgress;
        job.attempt += 1;
        job.started_at = Some(now);
        job.completed_at = None;
        job.error_message = None;
        if reclaimed {
            warn!(tile = %job.tile_id, attempt = job.attempt, "reclaiming abandoned tile");
        }
        Ok(Some(Claim {
            tile_id: job.tile_id.clone(),
            attempt: job.attempt,
            started_at: now,
            reclaimed,
        }))
    }

    fn settle(
        &self,
        claim: &Claim,
        status: TileStatus,
        output_reference: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let mut jobs = self.lock()?;
        match jobs.get_mut(&claim.tile_id) {
            Some(job) if job.status == TileStatus::InProgress && job.attempt == claim.attempt => {
                job.status = status;
                job.completed_at = Some(Utc::now());
                if let Some(reference) = output_reference {
                    job.output_reference = Some(reference.to_string());
                }
                job.error_message = error_message.map(str::to_string);
                Ok(true)
            }
            _ => {
                log_rejected(claim, status.as_str());
                Ok(false)
            }
        }
    }

    fn matching(&self, filter: impl Fn(&TileJob) -> bool) -> Result<Vec<TileJob>, LedgerError> {
        Ok(self.lock()?.values().filter(|job| filter(job)).cloned().collect())
    }
}

impl JobLedger for MemoryLedger {
    async fn register(&self, tile_ids: &[String]) -> Result<u64, LedgerError> {
        let mut jobs = self.lock()?;
        let mut added = 0;
        for tile_id in tile_ids {
            if !jobs.contains_key(tile_id) {
                jobs.insert(tile_id.clone(), TileJob::pending(tile_id));
                added += 1;
            }
        }
        Ok(added)
    }

    async fn claim_next(&self) -> Result<Option<Claim>, LedgerError> {
        self.claim_next_at(Utc::now())
    }

    async fn claim_next_in(&self, tile_ids: &[String]) -> Result<Option<Claim>, LedgerError> {
        self.claim_matching(Utc::now(), |tile| tile_ids.iter().any(|id| id == tile))
    }

    async fn complete(&self, claim: &Claim, output_reference: &str) -> Result<bool, LedgerError> {
        self.settle(claim, TileStatus::Done, Some(output_reference), None)
    }

    async fn fail(&self, claim: &Claim, reason: &str) -> Result<bool, LedgerError> {
        self.settle(claim, TileStatus::Failed, None, Some(reason))
    }

    async fn reset_all(&self) -> Result<u64, LedgerError> {
        let mut jobs = self.lock()?;
        for job in jobs.values_mut() {
            job.status = TileStatus::Pending;
            job.started_at = None;
            job.completed_at = None;
            job.output_reference = None;
            job.error_message = None;
        }
        Ok(jobs.len() as u64)
    }

    async fn retry_failed(&self) -> Result<u64, LedgerError> {
        let mut jobs = self.lock()?;
        let mut moved = 0;
        for job in jobs.values_mut().filter(|job| job.status == TileStatus::Failed) {
            job.status = TileStatus::Pending;
            job.started_at = None;
            job.completed_at = None;
            moved += 1;
        }
        Ok(moved)
    }

    async fn summary(&self) -> Result<LedgerSummary, LedgerError> {
        let mut summary = LedgerSummary::default();
        for job in self.lock()?.values() {
            summary.record(job.status, 1);
        }
        Ok(summary)
    }

    async fn jobs(&self) -> Result<Vec<TileJob>, LedgerError> {
        self.matching(|_| true)
    }

    async fn done_jobs(&self) -> Result<Vec<TileJob>, LedgerError> {
        self.matching(|job| job.status == TileStatus::Done)
    }
}

#[derive(Debug, FromRow)]
struct TileJobRow {
    tile_id: String,
    status: String,
    attempt: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    output_reference: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<TileJobRow> for TileJob {
    type Error = LedgerError;

    fn try_from(row: TileJobRow) -> Result<Self, Self::Error> {
        Ok(TileJob {
            status: row.status.parse()?,
            tile_id: row.tile_id,
            attempt: row.attempt,
            started_at: row.started_at,
            completed_at: row.completed_at,
            output_reference: row.output_reference,
            error_message: row.error_message,
        })
    }
}

const JOB_COLUMNS: &str =
    "tile_id, status, attempt, started_at, completed_at, output_reference, error_message";

/// Postgres-backed ledger shared by any number of worker processes.
pub struct PgLedger {
    pool: PgPool,
    stale_after: Duration,
}

impl PgLedger {
    /// Connects to the ledger database.
    ///
    /// # Errors
    /// Returns `LedgerError::Database` if the connection cannot be established.
    pub async fn connect(database_url: &str, stale_after: Duration) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        info!("PostgreSQL ledger pool created");
        Ok(Self::from_pool(pool, stale_after))
    }

    pub fn from_pool(pool: PgPool, stale_after: Duration) -> Self {
        Self { pool, stale_after }
    }

    /// Creates the `tile_jobs` table if it does not exist.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        let mut conn = self.pool.acquire().await?;
        let migration_sql = include_str!("../migrations/20260115_create_tile_jobs.sql");
        sqlx::raw_sql(migration_sql).execute(&mut *conn).await?;
        info!("ledger migrations completed");
        Ok(())
    }

    async fn fetch_jobs(&self, condition: &str) -> Result<Vec<TileJob>, LedgerError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM tile_jobs {condition} ORDER BY tile_id");
        sqlx::query_as::<_, TileJobRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TileJob::try_from)
            .collect()
    }

    async fn settle(
        &self,
        claim: &Claim,
        status: TileStatus,
        output_reference: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE tile_jobs
            SET status = $3,
                completed_at = now(),
                output_reference = COALESCE($4, output_reference),
                error_message = $5
            WHERE tile_id = $1 AND attempt = $2 AND status = 'in_progress'
            "#,
        )
        .bind(&claim.tile_id)
        .bind(claim.attempt)
        .bind(status.as_str())
        .bind(output_reference)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            log_rejected(claim, status.as_str());
            return Ok(false);
        }
        Ok(true)
    }

    /// Claims the first claimable tile, among `scope` when given.
    async fn claim(&self, scope: Option<&[String]>) -> Result<Option<Claim>, LedgerError> {
        // SKIP LOCKED keeps concurrent claimers off each other's candidate row
        let claimed = sqlx::query_as::<_, (String, i32, DateTime<Utc>, String)>(
            r#"
            WITH candidate AS (
                SELECT tile_id, status AS previous_status
                FROM tile_jobs
                WHERE (status = 'pending'
                       OR (status = 'in_progress' AND started_at < now() - make_interval(secs => $1)))
                  AND ($2::text[] IS NULL OR tile_id = ANY($2))
                ORDER BY tile_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tile_jobs AS j
            SET status = 'in_progress',
                attempt = j.attempt + 1,
                started_at = now(),
                completed_at = NULL,
                error_message = NULL
            FROM candidate
            WHERE j.tile_id = candidate.tile_id
            RETURNING j.tile_id, j.attempt, j.started_at, candidate.previous_status
            "#,
        )
        .bind(self.stale_after.as_secs_f64())
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|(tile_id, attempt, started_at, previous_status)| {
            let reclaimed = previous_status == TileStatus::InProgress.as_str();
            if reclaimed {
                warn!(tile = %tile_id, attempt, "reclaiming abandoned tile");
            }
            Claim {
                tile_id,
                attempt,
                started_at,
                reclaimed,
            }
        }))
    }
}

impl JobLedger for PgLedger {
    async fn register(&self, tile_ids: &[String]) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tile_jobs (tile_id)
            SELECT tile_id FROM UNNEST($1::text[]) AS t(tile_id)
            ON CONFLICT (tile_id) DO NOTHING
            "#,
        )
        .bind(tile_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_next(&self) -> Result<Option<Claim>, LedgerError> {
        self.claim(None).await
    }

    async fn claim_next_in(&self, tile_ids: &[String]) -> Result<Option<Claim>, LedgerError> {
        self.claim(Some(tile_ids)).await
    }

    async fn complete(&self, claim: &Claim, output_reference: &str) -> Result<bool, LedgerError> {
        self.settle(claim, TileStatus::Done, Some(output_reference), None).await
    }

    async fn fail(&self, claim: &Claim, reason: &str) -> Result<bool, LedgerError> {
        self.settle(claim, TileStatus::Failed, None, Some(reason)).await
    }

    async fn reset_all(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE tile_jobs
            SET status = 'pending', started_at = NULL, completed_at = NULL,
                output_reference = NULL, error_message = NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn retry_failed(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE tile_jobs SET status = 'pending', started_at = NULL, completed_at = NULL WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn summary(&self) -> Result<LedgerSummary, LedgerError> {
        let counts = sqlx::query_as::<_, (String, i64)>("SELECT status, COUNT(*) FROM tile_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut summary = LedgerSummary::default();
        for (status, count) in counts {
            summary.record(status.parse()?, count.max(0) as u64);
        }
        Ok(summary)
    }

    async fn jobs(&self) -> Result<Vec<TileJob>, LedgerError> {
        self.fetch_jobs("").await
    }

    async fn done_jobs(&self) -> Result<Vec<TileJob>, LedgerError> {
        self.fetch_jobs("WHERE status = 'done'").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn tiles(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("T{i:03}")).collect()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let ledger = MemoryLedger::new(HOUR);
        assert_eq!(ledger.register(&tiles(3)).await.unwrap(), 3);
        assert_eq!(ledger.register(&tiles(4)).await.unwrap(), 1);
        assert_eq!(ledger.summary().await.unwrap().pending, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_each_tile_once() {
        let ledger = Arc::new(MemoryLedger::new(HOUR));
        ledger.register(&tiles(50)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(claim) = ledger.claim_next().await.unwrap() {
                    claimed.push(claim.tile_id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimed_once_and_old_attempt_rejected() {
        let ledger = MemoryLedger::new(HOUR);
        ledger.register(&tiles(1)).await.unwrap();
        let now = Utc::now();

        let first = ledger.claim_next_at(now).unwrap().unwrap();
        assert!(!first.reclaimed);
        assert!(ledger.claim_next_at(now + chrono::Duration::minutes(30)).unwrap().is_none());

        let later = now + chrono::Duration::hours(2);
        let second = ledger.claim_next_at(later).unwrap().unwrap();
        assert!(second.reclaimed);
        assert_eq!(second.attempt, first.attempt + 1);
        assert!(ledger.claim_next_at(later).unwrap().is_none());

        assert!(!ledger.complete(&first, "roads_T000.json.zst").await.unwrap());
        assert!(ledger.complete(&second, "roads_T000.json.zst").await.unwrap());
        let done = ledger.done_jobs().await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].output_reference.as_deref(), Some("roads_T000.json.zst"));
    }

    #[tokio::test]
    async fn clock_stepping_back_does_not_free_a_live_claim() {
        let ledger = MemoryLedger::new(HOUR);
        ledger.register(&tiles(1)).await.unwrap();
        let now = Utc::now();

        let first = ledger.claim_next_at(now).unwrap().unwrap();
        assert!(ledger.claim_next_at(now - chrono::Duration::seconds(1)).unwrap().is_none());
        assert!(ledger.claim_next_at(now - chrono::Duration::hours(2)).unwrap().is_none());

        let job = &ledger.jobs().await.unwrap()[0];
        assert_eq!(job.status, TileStatus::InProgress);
        assert_eq!(job.attempt, first.attempt);
        assert!(ledger.complete(&first, "roads_T000.json.zst").await.unwrap());
    }

    #[tokio::test]
    async fn scoped_claims_leave_other_tiles_pending() {
        let ledger = MemoryLedger::new(HOUR);
        ledger.register(&tiles(4)).await.unwrap();
        let scope = vec!["T002".to_string(), "T003".to_string(), "T999".to_string()];

        let first = ledger.claim_next_in(&scope).await.unwrap().unwrap();
        let second = ledger.claim_next_in(&scope).await.unwrap().unwrap();
        assert_eq!((first.tile_id.as_str(), second.tile_id.as_str()), ("T002", "T003"));
        assert!(ledger.claim_next_in(&scope).await.unwrap().is_none());

        let jobs = ledger.jobs().await.unwrap();
        let summary = LedgerSummary::of_jobs(jobs.iter().filter(|job| scope.contains(&job.tile_id)));
        assert_eq!(summary.in_progress, 2);
        assert_eq!(summary.total(), 2);
        assert_eq!(ledger.summary().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn completing_a_done_tile_changes_nothing() {
        let ledger = MemoryLedger::new(HOUR);
        ledger.register(&tiles(1)).await.unwrap();
        let claim = ledger.claim_next().await.unwrap().unwrap();
        assert!(ledger.complete(&claim, "first").await.unwrap());
        assert!(!ledger.complete(&claim, "second").await.unwrap());
        assert!(!ledger.fail(&claim, "late failure").await.unwrap());
        let job = &ledger.jobs().await.unwrap()[0];
        assert_eq!(job.status, TileStatus::Done);
        assert_eq!(job.output_reference.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn failures_are_recorded_and_retryable() {
        let ledger = MemoryLedger::new(HOUR);
        ledger.register(&tiles(2)).await.unwrap();
        let a = ledger.claim_next().await.unwrap().unwrap();
        let b = ledger.claim_next().await.unwrap().unwrap();
        ledger.fail(&a, "invalid geometry in ften").await.unwrap();
        ledger.complete(&b, "roads_T001.json.zst").await.unwrap();

        let summary = ledger.summary().await.unwrap();
        assert_eq!((summary.done, summary.failed, summary.unfinished()), (1, 1, 0));
        let failed = &ledger.jobs().await.unwrap()[0];
        assert_eq!(failed.error_message.as_deref(), Some("invalid geometry in ften"));

        assert_eq!(ledger.retry_failed().await.unwrap(), 1);
        let retry = ledger.claim_next().await.unwrap().unwrap();
        assert_eq!(retry.tile_id, "T000");
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn reset_all_keeps_attempt_counters() {
        let ledger = MemoryLedger::new(HOUR);
        ledger.register(&tiles(1)).await.unwrap();
        let claim = ledger.claim_next().await.unwrap().unwrap();
        assert_eq!(ledger.reset_all().await.unwrap(), 1);

        let again = ledger.claim_next().await.unwrap().unwrap();
        assert_eq!(again.attempt, claim.attempt + 1);
        assert!(!again.reclaimed);
        assert!(!ledger.complete(&claim, "stale").await.unwrap());
    }

    /// Helper to start Postgres with testcontainers.
    /// Keep the container alive for the duration of the test.
    async fn setup_test_ledger(
        stale_after: Duration,
    ) -> (PgLedger, testcontainers::ContainerAsync<testcontainers_modules::postgres::Postgres>) {
        use testcontainers::{runners::AsyncRunner, ImageExt};
        use testcontainers_modules::postgres::Postgres;

        let container = Postgres::default()
            .with_tag("17-alpine")
            .start()
            .await
            .expect("Failed to start PostgreSQL container");
        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");
        let database_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let ledger = PgLedger::connect(&database_url, stale_after)
            .await
            .expect("Failed to connect to test DB");
        ledger.migrate().await.expect("Failed to run migrations");
        (ledger, container)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a Docker daemon"]
    async fn pg_concurrent_claims_are_exclusive() {
        let (ledger, _container) = setup_test_ledger(HOUR).await;
        assert_eq!(ledger.register(&tiles(40)).await.unwrap(), 40);
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    match ledger.claim_next().await {
                        Ok(Some(claim)) => claimed.push(claim.tile_id),
                        Ok(None) => break,
                        Err(err) if err.is_contention() => continue,
                        Err(err) => panic!("claim failed: {err}"),
                    }
                }
                claimed
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn pg_stale_claims_are_reclaimed_and_guarded() {
        let (ledger, _container) = setup_test_ledger(HOUR).await;
        ledger.register(&tiles(1)).await.unwrap();
        let first = ledger.claim_next().await.unwrap().unwrap();
        assert!(ledger.claim_next().await.unwrap().is_none());

        sqlx::query("UPDATE tile_jobs SET started_at = now() - interval '2 hours'")
            .execute(&ledger.pool)
            .await
            .unwrap();
        let second = ledger.claim_next().await.unwrap().unwrap();
        assert!(second.reclaimed);
        assert_eq!(second.attempt, first.attempt + 1);

        assert!(!ledger.complete(&first, "roads_T000.json.zst").await.unwrap());
        assert!(ledger.complete(&second, "roads_T000.json.zst").await.unwrap());
        assert_eq!(ledger.summary().await.unwrap().done, 1);

        assert_eq!(ledger.reset_all().await.unwrap(), 1);
        let third = ledger.claim_next().await.unwrap().unwrap();
        assert_eq!(third.attempt, 3);
    }
}
