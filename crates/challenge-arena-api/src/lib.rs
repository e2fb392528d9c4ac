use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use challenge_arena_core::{
    answer_digest, CategoryId, ChallengeId, ChallengeRecord, EngineError, RankMode, Scope,
    StreakReport, TimeWindow, UserId,
};
use challenge_arena_store_sqlite::{
    AttemptOutcome, DeferredRankPassSummary, LeaderboardPage, SchemaStatus, ScoreCache,
    SnapshotRow, SnapshotSummary, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnsureUserRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnsureUserResult {
    pub user_id: String,
    pub created: bool,
}

/// Catalog ingest payload. Either a precomputed answer digest or a
/// plaintext answer to digest locally; the plaintext is discarded after
/// hashing and never reaches storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestChallengeRequest {
    pub challenge_id: String,
    pub category_id: String,
    pub base_points: i64,
    pub difficulty_tier: u8,
    pub time_limit_seconds: f64,
    pub correct_answer_hash: Option<String>,
    pub correct_answer: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub active_until: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitAttemptRequest {
    pub user_id: String,
    pub challenge_id: String,
    pub answer: String,
    pub time_taken_seconds: f64,
    /// Submission time override for replay and testing; defaults to now.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedStanding {
    pub user_id: String,
    pub points: i64,
}

/// Embedding facade over the engine store. Opens the database per call and
/// keeps migrations current, mirroring how the store is used from both the
/// CLI and the HTTP service.
#[derive(Debug, Clone)]
pub struct ChallengeArenaApi {
    db_path: PathBuf,
    rank_mode: RankMode,
    cache: Arc<Mutex<ScoreCache>>,
}

impl ChallengeArenaApi {
    #[must_use]
    pub fn new(db_path: PathBuf, rank_mode: RankMode) -> Self {
        Self { db_path, rank_mode, cache: Arc::new(Mutex::new(ScoreCache::new())) }
    }

    #[must_use]
    pub fn rank_mode(&self) -> RankMode {
        self.rank_mode
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<'_, ScoreCache>> {
        self.cache
            .lock()
            .map_err(|_| EngineError::Transient("score cache lock poisoned".to_string()).into())
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Register an account identity with the engine. Idempotent.
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for a malformed identifier, or a
    /// storage error.
    pub fn ensure_user(&self, input: EnsureUserRequest) -> Result<EnsureUserResult> {
        let user_id = UserId::parse(&input.user_id)?;
        let mut store = self.open_store()?;
        store.migrate()?;
        let created = store.ensure_user(&user_id, OffsetDateTime::now_utc())?;
        Ok(EnsureUserResult { user_id: input.user_id, created })
    }

    /// Upsert one challenge record from the catalog collaborator.
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for malformed metadata or an
    /// ambiguous answer payload, or a storage error.
    pub fn ingest_challenge(&self, input: IngestChallengeRequest) -> Result<ChallengeRecord> {
        let correct_answer_hash = match (input.correct_answer_hash, input.correct_answer) {
            (Some(hash), None) => hash,
            (None, Some(answer)) => answer_digest(&answer),
            (Some(_), Some(_)) => {
                return Err(EngineError::Validation(
                    "provide either correct_answer_hash or correct_answer, not both".to_string(),
                )
                .into())
            }
            (None, None) => {
                return Err(EngineError::Validation(
                    "one of correct_answer_hash or correct_answer is required".to_string(),
                )
                .into())
            }
        };

        let record = ChallengeRecord {
            challenge_id: ChallengeId::parse(&input.challenge_id)?,
            category_id: CategoryId::parse(&input.category_id)?,
            base_points: input.base_points,
            difficulty_tier: input.difficulty_tier,
            time_limit_seconds: input.time_limit_seconds,
            correct_answer_hash,
            active_until: input.active_until,
        };
        record.validate()?;

        let mut store = self.open_store()?;
        store.migrate()?;
        store.upsert_challenge(&record)?;
        tracing::info!(
            challenge_id = %record.challenge_id,
            category_id = %record.category_id,
            "challenge ingested"
        );
        Ok(record)
    }

    /// Score one attempt. Exactly-once per (user, challenge): a duplicate
    /// submission returns `EngineError::Conflict` and changes nothing.
    ///
    /// # Errors
    /// Propagates the ledger taxonomy: `Validation`, `NotFound`,
    /// `Conflict`, `Expired`, `Transient`.
    pub fn submit_attempt(&self, input: SubmitAttemptRequest) -> Result<AttemptOutcome> {
        let user_id = UserId::parse(&input.user_id)?;
        let challenge_id = ChallengeId::parse(&input.challenge_id)?;
        let now = input.submitted_at.unwrap_or_else(OffsetDateTime::now_utc);

        let mut store = self.open_store()?;
        store.migrate()?;
        let category_id =
            store.get_challenge(&challenge_id)?.map(|challenge| challenge.category_id);
        let outcome = store.record_attempt(
            &user_id,
            &challenge_id,
            &input.answer,
            input.time_taken_seconds,
            self.rank_mode,
            now,
        )?;

        // Post-commit, best effort: the mirror may lag but never blocks or
        // fails a scored attempt.
        if let Err(err) = self.refresh_cache_scopes(&store, category_id) {
            tracing::warn!(error = %err, "score cache refresh failed after submit");
        }

        Ok(outcome)
    }

    fn refresh_cache_scopes(
        &self,
        store: &SqliteStore,
        category_id: Option<CategoryId>,
    ) -> Result<()> {
        let mut cache = self.lock_cache()?;
        cache.refresh_scope(store, &Scope::Global)?;
        if let Some(category_id) = category_id {
            cache.refresh_scope(store, &Scope::Category(category_id))?;
        }
        Ok(())
    }

    /// Time-windowed, paginated standings. Windowed views filter current
    /// standings by recent activity while keeping all-time rank numbers.
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for a malformed scope key, or a
    /// storage error.
    pub fn get_leaderboard(
        &self,
        scope: &str,
        window: TimeWindow,
        limit: u32,
        offset: u32,
        as_of: Option<OffsetDateTime>,
    ) -> Result<LeaderboardPage> {
        let scope = Scope::parse(scope)?;
        let now = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let mut store = self.open_store()?;
        store.migrate()?;
        store.leaderboard(&scope, window, limit, offset, now)
    }

    /// # Errors
    /// Returns `EngineError::Validation` for malformed inputs, or a
    /// storage error.
    pub fn get_user_rank(&self, user_id: &str, scope: &str) -> Result<Option<i64>> {
        let user_id = UserId::parse(user_id)?;
        let scope = Scope::parse(scope)?;
        let mut store = self.open_store()?;
        store.migrate()?;
        store.user_rank(&user_id, &scope)
    }

    /// Self-healing streak read for one (user, scope).
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for malformed inputs, or a
    /// storage error.
    pub fn get_streak(
        &self,
        user_id: &str,
        scope: &str,
        as_of: Option<OffsetDateTime>,
    ) -> Result<StreakReport> {
        let user_id = UserId::parse(user_id)?;
        let scope = Scope::parse(scope)?;
        let now = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let mut store = self.open_store()?;
        store.migrate()?;
        store.get_streak(&user_id, &scope, now)
    }

    /// Force a full dense-rank recomputation for one scope. Returns the
    /// scope population.
    ///
    /// # Errors
    /// Returns `EngineError::InvariantViolation` when the materialized
    /// ordering is malformed (previous ranks retained), or a storage error.
    pub fn recompute_ranks(&self, scope: &str) -> Result<u64> {
        let scope = Scope::parse(scope)?;
        let mut store = self.open_store()?;
        store.migrate()?;
        let population = store.recompute_ranks(&scope)?;
        let mut cache = self.lock_cache()?;
        if let Err(err) = cache.refresh_scope(&store, &scope) {
            tracing::warn!(error = %err, "score cache refresh failed after recompute");
        }
        Ok(population)
    }

    /// Drain the deferred-mode dirty queue, recomputing each marked scope.
    ///
    /// # Errors
    /// Returns the first error encountered; earlier scopes stay committed.
    pub fn run_deferred_rank_pass(&self) -> Result<DeferredRankPassSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let summary = store.run_deferred_rank_pass()?;
        let mut cache = self.lock_cache()?;
        for key in &summary.recomputed_scopes {
            let scope = Scope::parse(key)?;
            if let Err(err) = cache.refresh_scope(&store, &scope) {
                tracing::warn!(scope = key.as_str(), error = %err, "score cache refresh failed");
            }
        }
        Ok(summary)
    }

    /// Archive the current standings of every scope, filtered by the
    /// snapshot type's activity cutoff.
    ///
    /// # Errors
    /// Returns an error when the snapshot transaction fails.
    pub fn create_snapshot(
        &self,
        snapshot_type: TimeWindow,
        as_of: Option<OffsetDateTime>,
    ) -> Result<SnapshotSummary> {
        let now = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let mut store = self.open_store()?;
        store.migrate()?;
        store.create_snapshot(snapshot_type, now)
    }

    /// # Errors
    /// Returns an error when snapshot rows cannot be read.
    pub fn list_snapshots(
        &self,
        snapshot_type: Option<TimeWindow>,
        scope: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SnapshotRow>> {
        let scope = scope.map(Scope::parse).transpose()?;
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_snapshots(snapshot_type, scope.as_ref(), limit)
    }

    /// Rebuild the disposable sorted-read cache from the primary store.
    /// Returns the number of scopes loaded.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn rebuild_cache(&self) -> Result<usize> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let mut cache = self.lock_cache()?;
        cache.rebuild(&store)?;
        let scopes = store.known_scopes()?.len();
        tracing::info!(scopes, "score cache rebuilt");
        Ok(scopes)
    }

    /// Cached top standings for one scope. Cold scopes fall back to a
    /// refresh from the primary store; the result is still best-effort and
    /// never authoritative for rank numbers.
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for a malformed scope key, or a
    /// storage error on a cold-cache fallback.
    pub fn cached_top(&self, scope: &str, limit: u32) -> Result<Vec<CachedStanding>> {
        let scope = Scope::parse(scope)?;
        let mut cache = self.lock_cache()?;
        if !cache.is_warm(&scope) {
            let mut store = self.open_store()?;
            store.migrate()?;
            cache.refresh_scope(&store, &scope)?;
        }
        let page = cache.page(&scope, limit, 0).unwrap_or_default();
        Ok(page
            .into_iter()
            .map(|(user_id, points)| CachedStanding { user_id: user_id.to_string(), points })
            .collect())
    }
}

/// The engine taxonomy error behind an `anyhow` chain, if any.
#[must_use]
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>()
}

/// Stable machine code for an error: the taxonomy code when the chain
/// carries one, otherwise `internal`.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    engine_error(err).map_or("internal", EngineError::code)
}
