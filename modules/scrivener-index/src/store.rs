// SQLite persistence for the reference index. Single writer, WAL, 5 s busy
// timeout; every mutation is atomic-or-nothing from a reader's perspective.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{info, warn};

use scrivener_common::{
    ArtifactMeta, AttemptDiagnostic, FailureReason, IndexConfig, ObtainedFrom, Quality,
    Reference, ReferenceId, ReferenceKind, Result, ScrivenerError, Stage, Transport,
};

/// How many attempt diagnostics are retained per reference for forensics.
const ATTEMPT_LOG_CAP: usize = 10;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IndexStore {
    pool: SqlitePool,
    owner: String,
    /// A held lock older than this is considered abandoned.
    lock_stale_after: Duration,
}

/// Outcome of upsert_new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// An existing dead-letter entry for this canonical URL was re-armed.
    Rearmed,
    Duplicate(ReferenceId),
}

/// Fields for a brand-new reference row.
#[derive(Debug, Clone)]
pub struct NewReference {
    pub id: ReferenceId,
    pub kind: ReferenceKind,
    pub source_url: String,
    pub canonical_url: String,
    pub host_key: String,
    pub priority: i64,
    pub metadata: Option<serde_json::Value>,
}

#[derive(sqlx::FromRow)]
struct RefRow {
    id: String,
    kind: String,
    source_url: String,
    canonical_url: String,
    host_key: String,
    content_hash: Option<String>,
    stage: i64,
    processable: bool,
    failure_reason: Option<String>,
    failure_detail: Option<String>,
    priority: i64,
    attempts: i64,
    spent_ms: i64,
    ready_at: DateTime<Utc>,
    last_attempt_outcome: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    duplicate_of: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Option<String>,
}

impl RefRow {
    fn into_reference(self) -> Reference {
        Reference {
            id: ReferenceId::from_raw(self.id),
            kind: ReferenceKind::parse(&self.kind).unwrap_or(ReferenceKind::GenericUrl),
            source_url: self.source_url,
            canonical_url: self.canonical_url,
            host_key: self.host_key,
            content_hash: self.content_hash,
            stage: Stage::from_code(self.stage).unwrap_or(Stage::SystemError),
            processable: self.processable,
            failure_reason: self.failure_reason.as_deref().and_then(FailureReason::parse),
            failure_detail: self.failure_detail,
            priority: self.priority,
            attempts: self.attempts,
            spent_ms: self.spent_ms,
            ready_at: self.ready_at,
            last_attempt_outcome: self.last_attempt_outcome,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            duplicate_of: self.duplicate_of.map(ReferenceId::from_raw),
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata: self
                .metadata
                .as_deref()
                .and_then(|m| serde_json::from_str(m).ok()),
        }
    }
}

const REF_COLUMNS: &str = "id, kind, source_url, canonical_url, host_key, content_hash, stage, \
     processable, failure_reason, failure_detail, priority, attempts, spent_ms, ready_at, \
     last_attempt_outcome, lease_owner, lease_expires_at, duplicate_of, created_at, updated_at, \
     metadata";

fn db_err(e: sqlx::Error) -> ScrivenerError {
    ScrivenerError::Database(e.to_string())
}

impl IndexStore {
    /// Open (or create) the index at the configured path, run migrations, and
    /// take the single-process advisory lock. Fails with `LockConflict` if
    /// another live process holds it.
    pub async fn open(
        config: &IndexConfig,
        owner: impl Into<String>,
        lock_stale_after: Duration,
    ) -> Result<Self> {
        let owner = owner.into();
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ScrivenerError::Storage(format!("create index dir: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ScrivenerError::Database(e.to_string()))?;

        let store = Self {
            pool,
            owner,
            lock_stale_after,
        };
        store.acquire_lock(Utc::now()).await?;
        info!(path = %config.path.display(), "index store opened");
        Ok(store)
    }

    async fn acquire_lock(&self, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query("SELECT owner, heartbeat_at FROM instance_lock WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(row) = existing {
            let holder: String = row.get("owner");
            let heartbeat: DateTime<Utc> = row.get("heartbeat_at");
            let stale_after = chrono::Duration::from_std(self.lock_stale_after)
                .unwrap_or(chrono::Duration::MAX);
            let stale = now - heartbeat > stale_after;
            if holder != self.owner && !stale {
                return Err(ScrivenerError::LockConflict);
            }
            if holder != self.owner {
                warn!(previous = %holder, "taking over stale index lock");
            }
        }

        sqlx::query(
            "INSERT INTO instance_lock (id, owner, acquired_at, heartbeat_at)
             VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET owner = excluded.owner,
                 acquired_at = excluded.acquired_at, heartbeat_at = excluded.heartbeat_at",
        )
        .bind(&self.owner)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Refresh the advisory lock heartbeat.
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE instance_lock SET heartbeat_at = ? WHERE id = 1 AND owner = ?")
            .bind(now)
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Drop the advisory lock on clean shutdown.
    pub async fn release_lock(&self) -> Result<()> {
        sqlx::query("DELETE FROM instance_lock WHERE id = 1 AND owner = ?")
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Atomically insert a new reference or report what it collides with.
    ///
    /// An existing terminal-good row for the canonical URL yields `Duplicate`
    /// (and a stage-599 tombstone records the submission if its id differs);
    /// an existing dead-letter row is re-armed; an in-flight row is reported
    /// as duplicate without touching it.
    pub async fn upsert_new(&self, new: NewReference, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        // Insert-first keeps concurrent submissions of the same URL safe:
        // exactly one insert lands, the rest observe what it collided with.
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO refs (id, kind, source_url, canonical_url, host_key, stage,
                 processable, priority, ready_at, created_at, updated_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(new.id.as_str())
        .bind(new.kind.as_str())
        .bind(&new.source_url)
        .bind(&new.canonical_url)
        .bind(&new.host_key)
        .bind(Stage::ContentReceived.code())
        .bind(new.priority)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(new.metadata.as_ref().map(|m| m.to_string()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 1 {
            return Ok(UpsertOutcome::Inserted);
        }

        let existing = sqlx::query_as::<_, RefRow>(&format!(
            "SELECT {REF_COLUMNS} FROM refs WHERE canonical_url = ? AND processable = 1"
        ))
        .bind(&new.canonical_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let row = match existing {
            Some(row) => row,
            // Only a processable=0 tombstone with our id remains; its target
            // is the authority.
            None => {
                let duplicate_of: Option<String> =
                    sqlx::query_scalar("SELECT duplicate_of FROM refs WHERE id = ?")
                        .bind(new.id.as_str())
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(db_err)?
                        .flatten();
                return Ok(UpsertOutcome::Duplicate(ReferenceId::from_raw(
                    duplicate_of.unwrap_or_else(|| new.id.as_str().to_string()),
                )));
            }
        };

        let stage = Stage::from_code(row.stage).unwrap_or(Stage::SystemError);
        let existing_id = ReferenceId::from_raw(row.id.clone());

        if stage.is_terminal_good() {
            if existing_id != new.id {
                // Record the submission as a duplicate tombstone.
                sqlx::query(
                    "INSERT OR IGNORE INTO refs (id, kind, source_url, canonical_url,
                         host_key, stage, processable, priority, ready_at, duplicate_of,
                         created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
                )
                .bind(new.id.as_str())
                .bind(new.kind.as_str())
                .bind(&new.source_url)
                .bind(&new.canonical_url)
                .bind(&new.host_key)
                .bind(Stage::Duplicate.code())
                .bind(new.priority)
                .bind(now)
                .bind(row.id.as_str())
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            }
            return Ok(UpsertOutcome::Duplicate(existing_id));
        }

        if stage == Stage::PermanentError {
            // Re-arm is guarded by the stage so concurrent submissions
            // cannot double-reset.
            let rearmed = sqlx::query(
                "UPDATE refs SET stage = ?, attempts = 0, spent_ms = 0, ready_at = ?,
                     failure_reason = NULL, failure_detail = NULL,
                     last_attempt_outcome = NULL, priority = MAX(priority, ?), updated_at = ?
                 WHERE id = ? AND stage = ?",
            )
            .bind(Stage::ContentReceived.code())
            .bind(now)
            .bind(new.priority)
            .bind(now)
            .bind(row.id.as_str())
            .bind(Stage::PermanentError.code())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            if rearmed.rows_affected() == 1 {
                return Ok(UpsertOutcome::Rearmed);
            }
        }

        Ok(UpsertOutcome::Duplicate(existing_id))
    }

    pub async fn get(&self, id: &ReferenceId) -> Result<Option<Reference>> {
        let row = sqlx::query_as::<_, RefRow>(&format!(
            "SELECT {REF_COLUMNS} FROM refs WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(RefRow::into_reference))
    }

    pub async fn find_by_canonical(&self, canonical_url: &str) -> Result<Option<Reference>> {
        let row = sqlx::query_as::<_, RefRow>(&format!(
            "SELECT {REF_COLUMNS} FROM refs WHERE canonical_url = ? AND processable = 1"
        ))
        .bind(canonical_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(RefRow::into_reference))
    }

    /// Optimistic stage transition: fails (returns false) if the current
    /// stage is not `from` or the edge is not allowed.
    pub async fn transition(
        &self,
        id: &ReferenceId,
        from: Stage,
        to: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let result = sqlx::query("UPDATE refs SET stage = ?, updated_at = ? WHERE id = ? AND stage = ?")
            .bind(to.code())
            .bind(now)
            .bind(id.as_str())
            .bind(from.code())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Move retry-scheduled references whose clock has expired back into the
    /// ready pool.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let retry_stages = [
            Stage::AcquireFailed,
            Stage::VerifyFailed,
            Stage::StoreFailed,
            Stage::EnrichFailed,
            Stage::RateLimited,
        ];
        let codes = retry_stages.map(|s| s.code().to_string()).join(",");
        let result = sqlx::query(&format!(
            "UPDATE refs SET stage = ?, updated_at = ?
             WHERE stage IN ({codes}) AND ready_at <= ? AND processable = 1"
        ))
        .bind(Stage::ContentReceived.code())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// Lease up to `batch` ready references for `worker`, ordered by
    /// (priority desc, ready_at asc). Leased rows move to stage 110.
    pub async fn lease(
        &self,
        batch: i64,
        worker: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reference>> {
        let expires = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120));
        let rows = sqlx::query_as::<_, RefRow>(&format!(
            "UPDATE refs SET stage = ?, lease_owner = ?, lease_expires_at = ?, updated_at = ?
             WHERE id IN (
                 SELECT id FROM refs
                 WHERE stage = ? AND processable = 1 AND ready_at <= ?
                 ORDER BY priority DESC, ready_at ASC
                 LIMIT ?
             )
             RETURNING {REF_COLUMNS}"
        ))
        .bind(Stage::Leased.code())
        .bind(worker)
        .bind(expires)
        .bind(now)
        .bind(Stage::ContentReceived.code())
        .bind(now)
        .bind(batch)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(RefRow::into_reference).collect())
    }

    /// Reclaim references whose lease expired without an ack. They re-enter
    /// the ready pool at their prior ready_at floor.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refs SET stage = ?, lease_owner = NULL, lease_expires_at = NULL,
                 updated_at = ?
             WHERE lease_owner IS NOT NULL AND lease_expires_at <= ?
               AND stage > ? AND stage < ?",
        )
        .bind(Stage::ContentReceived.code())
        .bind(now)
        .bind(now)
        .bind(Stage::ContentReceived.code())
        .bind(Stage::Finalized.code())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        let n = result.rows_affected();
        if n > 0 {
            warn!(count = n, "reclaimed expired leases");
        }
        Ok(n)
    }

    /// Startup recovery: any reference stuck in an active sub-stage with a
    /// lease (live or not) from a previous process returns to ready.
    pub async fn recover_orphans(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refs SET stage = ?, lease_owner = NULL, lease_expires_at = NULL,
                 updated_at = ?
             WHERE stage > ? AND stage < ? AND stage NOT IN (?, ?, ?, ?)",
        )
        .bind(Stage::ContentReceived.code())
        .bind(now)
        .bind(Stage::ContentReceived.code())
        .bind(Stage::Finalized.code())
        .bind(Stage::AcquireFailed.code())
        .bind(Stage::VerifyFailed.code())
        .bind(Stage::StoreFailed.code())
        .bind(Stage::EnrichFailed.code())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        let n = result.rows_affected();
        if n > 0 {
            info!(count = n, "recovered orphaned in-flight references");
        }
        Ok(n)
    }

    /// Record a failed attempt and schedule the retry.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_retry(
        &self,
        id: &ReferenceId,
        mark: Stage,
        ready_at: DateTime<Utc>,
        count_attempt: bool,
        reason: FailureReason,
        detail: &str,
        diagnostic: AttemptDiagnostic,
        spent_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let log = append_diagnostic(&mut tx, id, diagnostic).await?;

        sqlx::query(
            "UPDATE refs SET stage = ?, ready_at = ?, attempts = attempts + ?,
                 spent_ms = spent_ms + ?, failure_reason = ?, failure_detail = ?,
                 last_attempt_outcome = ?, lease_owner = NULL, lease_expires_at = NULL,
                 attempt_log = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(mark.code())
        .bind(ready_at)
        .bind(if count_attempt { 1 } else { 0 })
        .bind(spent_ms)
        .bind(reason.as_str())
        .bind(detail)
        .bind(reason.as_str())
        .bind(log)
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Park a reference in the dead-letter set. `last_outcome` records what
    /// the final attempt actually observed (which can differ from the parking
    /// reason, e.g. a timeout that exhausted the attempt budget).
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_dead_letter(
        &self,
        id: &ReferenceId,
        reason: FailureReason,
        detail: &str,
        last_outcome: &str,
        count_attempt: bool,
        diagnostic: AttemptDiagnostic,
        spent_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let log = append_diagnostic(&mut tx, id, diagnostic).await?;

        sqlx::query(
            "UPDATE refs SET stage = ?, attempts = attempts + ?, spent_ms = spent_ms + ?,
                 failure_reason = ?, failure_detail = ?, last_attempt_outcome = ?,
                 lease_owner = NULL, lease_expires_at = NULL, attempt_log = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(Stage::PermanentError.code())
        .bind(if count_attempt { 1 } else { 0 })
        .bind(spent_ms)
        .bind(reason.as_str())
        .bind(detail)
        .bind(last_outcome)
        .bind(log)
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Park a reference that keeps tripping internal faults.
    pub async fn mark_system_error(
        &self,
        id: &ReferenceId,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE refs SET stage = ?, failure_reason = ?, failure_detail = ?,
                 lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(Stage::SystemError.code())
        .bind(FailureReason::Internal.as_str())
        .bind(detail)
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Drop the lease but keep the current stage. Used when a hook continues
    /// out-of-band and will resubmit a completion event.
    pub async fn clear_lease(&self, id: &ReferenceId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE refs SET lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Return a leased reference to the ready pool untouched (governor
    /// deferral or internal fault). Does not count an attempt.
    pub async fn release(
        &self,
        id: &ReferenceId,
        ready_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE refs SET stage = ?, ready_at = ?, lease_owner = NULL,
                 lease_expires_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(Stage::ContentReceived.code())
        .bind(ready_at)
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Record the committed artifact and advance to terminal-good. Only valid
    /// from the enriched stage; the content bytes must already be on disk.
    pub async fn commit_artifact(
        &self,
        id: &ReferenceId,
        meta: &ArtifactMeta,
        spent_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let reasons =
            serde_json::to_string(&meta.quality_reasons).unwrap_or_else(|_| "[]".to_string());
        let result = sqlx::query(
            "UPDATE refs SET stage = ?, content_hash = ?, byte_count = ?, word_count = ?,
                 quality = ?, quality_reasons = ?, obtained_via = ?, obtained_from = ?,
                 source_resolver = ?, final_url = ?, content_path = ?, fetched_at = ?,
                 attempts = attempts + 1, spent_ms = spent_ms + ?,
                 failure_reason = NULL, failure_detail = NULL, last_attempt_outcome = 'success',
                 lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE id = ? AND stage = ?",
        )
        .bind(Stage::Finalized.code())
        .bind(&meta.content_hash)
        .bind(meta.byte_count as i64)
        .bind(meta.word_count as i64)
        .bind(meta.quality.as_str())
        .bind(reasons)
        .bind(meta.obtained_via.as_str())
        .bind(meta.obtained_from.as_str())
        .bind(&meta.source_resolver)
        .bind(&meta.final_url)
        .bind(meta.content_path.to_string_lossy().into_owned())
        .bind(meta.fetched_at)
        .bind(spent_ms)
        .bind(now)
        .bind(id.as_str())
        .bind(Stage::Enriched.code())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Operator action: move a dead-letter reference back to pending with a
    /// fresh attempt budget.
    pub async fn resurrect(&self, id: &ReferenceId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE refs SET stage = ?, attempts = 0, spent_ms = 0, ready_at = ?,
                 failure_reason = NULL, failure_detail = NULL, updated_at = ?
             WHERE id = ? AND stage IN (?, ?)",
        )
        .bind(Stage::ContentReceived.code())
        .bind(now)
        .bind(now)
        .bind(id.as_str())
        .bind(Stage::PermanentError.code())
        .bind(Stage::SystemError.code())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Count of references that still need work (backpressure signal).
    pub async fn queue_depth(&self) -> Result<i64> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM refs WHERE processable = 1 AND stage < ?",
        )
        .bind(Stage::Finalized.code())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(depth)
    }

    /// Read-only view of what lease() would consider, in lease order.
    pub async fn query_ready(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Reference>> {
        let rows = sqlx::query_as::<_, RefRow>(&format!(
            "SELECT {REF_COLUMNS} FROM refs
             WHERE stage = ? AND processable = 1 AND ready_at <= ?
             ORDER BY priority DESC, ready_at ASC LIMIT ?"
        ))
        .bind(Stage::ContentReceived.code())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(RefRow::into_reference).collect())
    }

    pub async fn list_by_stage(&self, stage: Stage, limit: i64) -> Result<Vec<Reference>> {
        let rows = sqlx::query_as::<_, RefRow>(&format!(
            "SELECT {REF_COLUMNS} FROM refs WHERE stage = ? ORDER BY updated_at DESC LIMIT ?"
        ))
        .bind(stage.code())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(RefRow::into_reference).collect())
    }

    pub async fn list_by_host(&self, host_key: &str, limit: i64) -> Result<Vec<Reference>> {
        let rows = sqlx::query_as::<_, RefRow>(&format!(
            "SELECT {REF_COLUMNS} FROM refs WHERE host_key = ? ORDER BY updated_at DESC LIMIT ?"
        ))
        .bind(host_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(RefRow::into_reference).collect())
    }

    pub async fn list_dead_letter(&self, limit: i64) -> Result<Vec<Reference>> {
        let rows = sqlx::query_as::<_, RefRow>(&format!(
            "SELECT {REF_COLUMNS} FROM refs WHERE stage IN (?, ?)
             ORDER BY updated_at DESC LIMIT ?"
        ))
        .bind(Stage::PermanentError.code())
        .bind(Stage::SystemError.code())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(RefRow::into_reference).collect())
    }

    /// The retained attempt diagnostics for a reference, oldest first.
    pub async fn attempt_log(&self, id: &ReferenceId) -> Result<Vec<AttemptDiagnostic>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT attempt_log FROM refs WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(raw
            .flatten()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    /// Artifact metadata recorded at commit, if this reference reached it.
    pub async fn artifact_meta(&self, id: &ReferenceId) -> Result<Option<ArtifactMeta>> {
        let row = sqlx::query(
            "SELECT id, content_hash, byte_count, word_count, quality, quality_reasons,
                 obtained_via, obtained_from, source_resolver, final_url, content_path, fetched_at
             FROM refs WHERE id = ? AND content_hash IS NOT NULL",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.and_then(|row| {
            let quality: Option<String> = row.get("quality");
            let reasons: Option<String> = row.get("quality_reasons");
            Some(ArtifactMeta {
                reference_id: ReferenceId::from_raw(row.get::<String, _>("id")),
                content_hash: row.get("content_hash"),
                byte_count: row.get::<i64, _>("byte_count") as u64,
                word_count: row.get::<i64, _>("word_count") as u64,
                quality: quality.as_deref().and_then(Quality::parse)?,
                quality_reasons: reasons
                    .as_deref()
                    .and_then(|r| serde_json::from_str(r).ok())
                    .unwrap_or_default(),
                obtained_via: Transport::parse(row.get::<String, _>("obtained_via").as_str())?,
                obtained_from: ObtainedFrom::parse(
                    row.get::<String, _>("obtained_from").as_str(),
                )?,
                source_resolver: row.get("source_resolver"),
                final_url: row.get("final_url"),
                content_path: PathBuf::from(row.get::<String, _>("content_path")),
                fetched_at: row.get("fetched_at"),
            })
        }))
    }
}

async fn append_diagnostic(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: &ReferenceId,
    diagnostic: AttemptDiagnostic,
) -> Result<String> {
    let raw: Option<Option<String>> =
        sqlx::query_scalar("SELECT attempt_log FROM refs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;

    let mut log: Vec<AttemptDiagnostic> = raw
        .flatten()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    log.push(diagnostic);
    if log.len() > ATTEMPT_LOG_CAP {
        let drop = log.len() - ATTEMPT_LOG_CAP;
        log.drain(..drop);
    }
    Ok(serde_json::to_string(&log).unwrap_or_else(|_| "[]".to_string()))
}
