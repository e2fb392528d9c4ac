use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use challenge_arena_core::{
    advance_streak, answer_digest, mastery_percentage, observe_streak, score_attempt,
    validate_dense_ranks, AttemptId, AttemptRecord, CategoryId, ChallengeId, ChallengeRecord,
    EngineError, RankMode, Scope, StreakReport, StreakState, TimeWindow, UserId, GLOBAL_SCOPE_KEY,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  total_points INTEGER NOT NULL DEFAULT 0,
  global_rank INTEGER,
  last_activity TEXT,
  points_updated_at TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS challenges (
  challenge_id TEXT PRIMARY KEY,
  category_id TEXT NOT NULL,
  base_points INTEGER NOT NULL CHECK (base_points >= 0),
  difficulty_tier INTEGER NOT NULL CHECK (difficulty_tier BETWEEN 1 AND 5),
  time_limit_seconds REAL NOT NULL CHECK (time_limit_seconds > 0),
  correct_answer_hash TEXT NOT NULL,
  active_until TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS challenge_attempts (
  attempt_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  challenge_id TEXT NOT NULL,
  is_correct INTEGER NOT NULL CHECK (is_correct IN (0, 1)),
  points_earned INTEGER NOT NULL,
  answer_hash TEXT NOT NULL,
  time_taken_seconds REAL NOT NULL CHECK (time_taken_seconds >= 0),
  created_at TEXT NOT NULL,
  UNIQUE (user_id, challenge_id),
  FOREIGN KEY (user_id) REFERENCES users(user_id),
  FOREIGN KEY (challenge_id) REFERENCES challenges(challenge_id)
);

CREATE TABLE IF NOT EXISTS category_rankings (
  user_id TEXT NOT NULL,
  category_id TEXT NOT NULL,
  points INTEGER NOT NULL DEFAULT 0,
  rank INTEGER,
  completed INTEGER NOT NULL DEFAULT 0 CHECK (completed >= 0),
  correct INTEGER NOT NULL DEFAULT 0 CHECK (correct >= 0 AND correct <= completed),
  mastery_percentage REAL NOT NULL DEFAULT 0,
  streak_days INTEGER NOT NULL DEFAULT 0,
  longest_streak INTEGER NOT NULL DEFAULT 0,
  last_activity TEXT NOT NULL,
  points_updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, category_id),
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE TABLE IF NOT EXISTS streak_states (
  user_id TEXT NOT NULL,
  scope TEXT NOT NULL,
  current_streak INTEGER NOT NULL CHECK (current_streak >= 0),
  longest_streak INTEGER NOT NULL CHECK (longest_streak >= current_streak),
  last_activity_date TEXT NOT NULL,
  PRIMARY KEY (user_id, scope),
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE TABLE IF NOT EXISTS leaderboard_snapshots (
  snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  scope TEXT NOT NULL,
  points INTEGER NOT NULL,
  rank INTEGER NOT NULL,
  snapshot_type TEXT NOT NULL CHECK (snapshot_type IN ('daily','weekly','monthly','all_time')),
  snapshot_date TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempts_user ON challenge_attempts(user_id);
CREATE INDEX IF NOT EXISTS idx_attempts_challenge ON challenge_attempts(challenge_id);
CREATE INDEX IF NOT EXISTS idx_category_rankings_category ON category_rankings(category_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_scope_type ON leaderboard_snapshots(scope, snapshot_type);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS dirty_scopes (
  scope TEXT PRIMARY KEY,
  marked_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_last_activity ON users(last_activity);
CREATE INDEX IF NOT EXISTS idx_category_rankings_activity ON category_rankings(category_id, last_activity);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Result of one scored submission, inside a single committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub is_correct: bool,
    pub points_earned: i64,
    pub new_total_points: i64,
    /// Global rank after the write. In deferred mode this is the last
    /// materialized rank, which may lag; `None` before the first pass.
    pub new_rank: Option<i64>,
    pub streak_updated: bool,
    pub streak_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub points: i64,
    pub rank: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

/// One page of standings. Time-windowed pages filter by recent activity but
/// keep the all-time rank numbers; see the crate docs for the caveat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardPage {
    pub scope: String,
    pub window: TimeWindow,
    pub total_participants: u64,
    pub entries: Vec<LeaderboardEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub snapshot_type: TimeWindow,
    #[serde(with = "time::serde::rfc3339")]
    pub snapshot_date: OffsetDateTime,
    pub rows_written: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRow {
    pub user_id: UserId,
    pub scope: String,
    pub points: i64,
    pub rank: i64,
    pub snapshot_type: TimeWindow,
    #[serde(with = "time::serde::rfc3339")]
    pub snapshot_date: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeferredRankPassSummary {
    pub recomputed_scopes: Vec<String>,
}

impl SqliteStore {
    /// Open the SQLite-backed engine store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails; completed steps stay
    /// recorded.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
        }
        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        Ok(())
    }

    /// Register an account identity with this engine. Idempotent; returns
    /// true when a new row was created.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn ensure_user(&mut self, user_id: &UserId, now: OffsetDateTime) -> Result<bool> {
        let created = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO users(user_id, total_points, created_at) VALUES (?1, 0, ?2)",
                params![user_id.as_str(), rfc3339(now)?],
            )
            .context("failed to insert user")?;
        Ok(created > 0)
    }

    /// Upsert one challenge record from the catalog collaborator.
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for malformed scoring metadata, or
    /// a storage error when the write fails.
    pub fn upsert_challenge(&mut self, challenge: &ChallengeRecord) -> Result<()> {
        challenge.validate()?;
        self.conn
            .execute(
                "INSERT INTO challenges(
                    challenge_id, category_id, base_points, difficulty_tier,
                    time_limit_seconds, correct_answer_hash, active_until
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(challenge_id) DO UPDATE SET
                    category_id = excluded.category_id,
                    base_points = excluded.base_points,
                    difficulty_tier = excluded.difficulty_tier,
                    time_limit_seconds = excluded.time_limit_seconds,
                    correct_answer_hash = excluded.correct_answer_hash,
                    active_until = excluded.active_until",
                params![
                    challenge.challenge_id.as_str(),
                    challenge.category_id.as_str(),
                    challenge.base_points,
                    i64::from(challenge.difficulty_tier),
                    challenge.time_limit_seconds,
                    challenge.correct_answer_hash,
                    rfc3339(challenge.active_until)?,
                ],
            )
            .context("failed to upsert challenge")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_challenge(&self, challenge_id: &ChallengeId) -> Result<Option<ChallengeRecord>> {
        self.conn
            .query_row(
                "SELECT challenge_id, category_id, base_points, difficulty_tier,
                        time_limit_seconds, correct_answer_hash, active_until
                 FROM challenges WHERE challenge_id = ?1",
                params![challenge_id.as_str()],
                challenge_from_row,
            )
            .optional()
            .context("failed to load challenge")?
            .transpose()
    }

    /// Record one scored attempt: correctness, points, streaks, counters,
    /// and (inline mode) rank recomputation, all in a single immediate
    /// transaction. The write lock is taken before the first streak read;
    /// two same-day submissions cannot both observe yesterday's state.
    ///
    /// # Errors
    /// `NotFound` for unknown user or challenge, `Expired` past the
    /// challenge's active window, `Conflict` when an attempt already exists
    /// for this (user, challenge) — enforced by the storage uniqueness
    /// constraint, so concurrent duplicates race safely.
    pub fn record_attempt(
        &mut self,
        user_id: &UserId,
        challenge_id: &ChallengeId,
        submitted_answer: &str,
        time_taken_seconds: f64,
        rank_mode: RankMode,
        now: OffsetDateTime,
    ) -> Result<AttemptOutcome> {
        let now = now.to_offset(UtcOffset::UTC);
        let today = now.date();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_busy)
            .context("failed to start attempt transaction")?;

        let challenge = tx
            .query_row(
                "SELECT challenge_id, category_id, base_points, difficulty_tier,
                        time_limit_seconds, correct_answer_hash, active_until
                 FROM challenges WHERE challenge_id = ?1",
                params![challenge_id.as_str()],
                challenge_from_row,
            )
            .optional()
            .context("failed to load challenge")?
            .transpose()?
            .ok_or_else(|| EngineError::NotFound(format!("unknown challenge {challenge_id}")))?;

        if challenge.active_until < now {
            return Err(EngineError::Expired(format!(
                "challenge {challenge_id} closed at {}",
                rfc3339(challenge.active_until)?
            ))
            .into());
        }

        let total_points: i64 = tx
            .query_row(
                "SELECT total_points FROM users WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load user")?
            .ok_or_else(|| EngineError::NotFound(format!("unknown user {user_id}")))?;

        let global_scope = Scope::Global;
        let category_scope = Scope::Category(challenge.category_id.clone());

        let global_advance = advance_streak(load_streak(&tx, user_id, &global_scope)?, today);
        let category_advance = advance_streak(load_streak(&tx, user_id, &category_scope)?, today);

        let submitted_digest = answer_digest(submitted_answer);
        let is_correct = submitted_digest == challenge.correct_answer_hash;
        let points_earned = score_attempt(
            challenge.base_points,
            challenge.difficulty_tier,
            is_correct,
            time_taken_seconds,
            challenge.time_limit_seconds,
            global_advance.state.current_streak,
        )?;

        let attempt_id = AttemptId::new();
        let insert_result = tx.execute(
            "INSERT INTO challenge_attempts(
                attempt_id, user_id, challenge_id, is_correct, points_earned,
                answer_hash, time_taken_seconds, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attempt_id.to_string(),
                user_id.as_str(),
                challenge_id.as_str(),
                i64::from(is_correct),
                points_earned,
                submitted_digest,
                time_taken_seconds,
                rfc3339(now)?,
            ],
        );
        match insert_result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(EngineError::Conflict(format!(
                    "attempt already recorded for user {user_id} on challenge {challenge_id}"
                ))
                .into());
            }
            Err(err) => return Err(err).context("failed to insert attempt"),
        }

        write_streak(&tx, user_id, &global_scope, global_advance.state)?;
        write_streak(&tx, user_id, &category_scope, category_advance.state)?;

        let new_total_points = total_points + points_earned;
        let now_text = rfc3339(now)?;
        tx.execute(
            "UPDATE users SET total_points = ?1, last_activity = ?2, points_updated_at = ?2
             WHERE user_id = ?3",
            params![new_total_points, now_text, user_id.as_str()],
        )
        .context("failed to update user totals")?;

        upsert_category_ranking(
            &tx,
            user_id,
            &challenge.category_id,
            points_earned,
            is_correct,
            category_advance.state,
            &now_text,
        )?;

        match rank_mode {
            RankMode::Inline => {
                recompute_scope_tx(&tx, &category_scope)?;
                recompute_scope_tx(&tx, &global_scope)?;
            }
            RankMode::Deferred => {
                mark_scope_dirty(&tx, &category_scope, &now_text)?;
                mark_scope_dirty(&tx, &global_scope, &now_text)?;
            }
        }

        let new_rank: Option<i64> = tx
            .query_row(
                "SELECT global_rank FROM users WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .context("failed to read back global rank")?;

        tx.commit().map_err(map_busy).context("failed to commit attempt transaction")?;

        Ok(AttemptOutcome {
            is_correct,
            points_earned,
            new_total_points,
            new_rank,
            streak_updated: global_advance.updated,
            streak_days: global_advance.state.current_streak,
        })
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_attempt(
        &self,
        user_id: &UserId,
        challenge_id: &ChallengeId,
    ) -> Result<Option<AttemptRecord>> {
        self.conn
            .query_row(
                "SELECT attempt_id, user_id, challenge_id, is_correct, points_earned,
                        answer_hash, time_taken_seconds, created_at
                 FROM challenge_attempts WHERE user_id = ?1 AND challenge_id = ?2",
                params![user_id.as_str(), challenge_id.as_str()],
                attempt_from_row,
            )
            .optional()
            .context("failed to load attempt")?
            .transpose()
    }

    /// All attempts for one user, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_attempts(&self, user_id: &UserId) -> Result<Vec<AttemptRecord>> {
        let mut statement = self
            .conn
            .prepare(
                "SELECT attempt_id, user_id, challenge_id, is_correct, points_earned,
                        answer_hash, time_taken_seconds, created_at
                 FROM challenge_attempts WHERE user_id = ?1 ORDER BY created_at DESC",
            )
            .context("failed to prepare attempt listing")?;
        let rows = statement
            .query_map(params![user_id.as_str()], attempt_from_row)
            .context("failed to query attempts")?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row.context("failed to read attempt row")??);
        }
        Ok(attempts)
    }

    /// Self-healing streak read: reports 0 whenever the stored state lapsed
    /// before yesterday, without writing anything back.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read.
    pub fn get_streak(
        &self,
        user_id: &UserId,
        scope: &Scope,
        now: OffsetDateTime,
    ) -> Result<StreakReport> {
        let today = now.to_offset(UtcOffset::UTC).date();
        let mut statement = self
            .conn
            .prepare(
                "SELECT current_streak, longest_streak, last_activity_date
                 FROM streak_states WHERE user_id = ?1 AND scope = ?2",
            )
            .context("failed to prepare streak read")?;
        let state = statement
            .query_row(params![user_id.as_str(), scope.as_key()], streak_from_row)
            .optional()
            .context("failed to load streak state")?
            .transpose()?;
        Ok(observe_streak(state.as_ref(), today))
    }

    /// Full dense-rank recomputation for one scope in its own transaction.
    /// Returns the scope population.
    ///
    /// # Errors
    /// Returns `EngineError::InvariantViolation` (previous ranks retained)
    /// when the materialized ordering is malformed, or a storage error.
    pub fn recompute_ranks(&mut self, scope: &Scope) -> Result<u64> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_busy)
            .context("failed to start rank transaction")?;
        let population = recompute_scope_tx(&tx, scope)?;
        tx.commit().map_err(map_busy).context("failed to commit rank transaction")?;
        Ok(population)
    }

    /// Recompute every scope marked dirty by deferred-mode submissions.
    /// Each scope commits independently; a failure leaves that scope dirty
    /// for the next pass.
    ///
    /// # Errors
    /// Returns the first error encountered after processing earlier scopes.
    pub fn run_deferred_rank_pass(&mut self) -> Result<DeferredRankPassSummary> {
        let scopes: Vec<String> = {
            let mut statement = self
                .conn
                .prepare("SELECT scope FROM dirty_scopes ORDER BY marked_at ASC, scope ASC")
                .context("failed to prepare dirty scope listing")?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))
                .context("failed to query dirty scopes")?;
            let mut scopes = Vec::new();
            for row in rows {
                scopes.push(row.context("failed to read dirty scope row")?);
            }
            scopes
        };

        let mut recomputed = Vec::new();
        for key in scopes {
            let scope = Scope::parse(&key)?;
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_busy)
                .context("failed to start deferred rank transaction")?;
            recompute_scope_tx(&tx, &scope)?;
            tx.execute("DELETE FROM dirty_scopes WHERE scope = ?1", params![key])
                .context("failed to clear dirty scope")?;
            tx.commit().map_err(map_busy).context("failed to commit deferred rank pass")?;
            recomputed.push(key);
        }
        tracing::info!(scopes = recomputed.len(), "deferred rank pass complete");
        Ok(DeferredRankPassSummary { recomputed_scopes: recomputed })
    }

    /// Time-windowed, paginated standings for one scope.
    ///
    /// Windowed views filter current standings by recent activity; the rank
    /// numbers remain all-time ordinals among the filtered users, not ranks
    /// recomputed from in-window deltas.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn leaderboard(
        &self,
        scope: &Scope,
        window: TimeWindow,
        limit: u32,
        offset: u32,
        now: OffsetDateTime,
    ) -> Result<LeaderboardPage> {
        let cutoff = match window.cutoff(now.to_offset(UtcOffset::UTC)) {
            Some(value) => Some(rfc3339(value)?),
            None => None,
        };

        let (entry_sql, count_sql) = match scope {
            Scope::Global => (
                "SELECT user_id, total_points, global_rank, last_activity FROM users
                 WHERE global_rank IS NOT NULL AND (?1 IS NULL OR last_activity >= ?1)
                 ORDER BY global_rank ASC LIMIT ?2 OFFSET ?3",
                "SELECT COUNT(*) FROM users
                 WHERE global_rank IS NOT NULL AND (?1 IS NULL OR last_activity >= ?1)",
            ),
            Scope::Category(_) => (
                "SELECT user_id, points, rank, last_activity FROM category_rankings
                 WHERE category_id = ?4 AND rank IS NOT NULL
                   AND (?1 IS NULL OR last_activity >= ?1)
                 ORDER BY rank ASC LIMIT ?2 OFFSET ?3",
                "SELECT COUNT(*) FROM category_rankings
                 WHERE category_id = ?4 AND rank IS NOT NULL
                   AND (?1 IS NULL OR last_activity >= ?1)",
            ),
        };

        let category_key = match scope {
            Scope::Global => String::new(),
            Scope::Category(category_id) => category_id.as_str().to_string(),
        };

        let mut statement =
            self.conn.prepare(entry_sql).context("failed to prepare leaderboard query")?;
        let rows = match scope {
            Scope::Global => statement
                .query_map(params![cutoff, i64::from(limit), i64::from(offset)], entry_from_row),
            Scope::Category(_) => statement.query_map(
                params![cutoff, i64::from(limit), i64::from(offset), category_key],
                entry_from_row,
            ),
        }
        .context("failed to query leaderboard")?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to read leaderboard row")??);
        }

        let total_participants: i64 = match scope {
            Scope::Global => {
                self.conn.query_row(count_sql, params![cutoff], |row| row.get(0))
            }
            Scope::Category(_) => self.conn.query_row(
                count_sql,
                params![cutoff, 0_i64, 0_i64, category_key],
                |row| row.get(0),
            ),
        }
        .context("failed to count leaderboard population")?;

        Ok(LeaderboardPage {
            scope: scope.as_key().to_string(),
            window,
            total_participants: u64::try_from(total_participants).unwrap_or(0),
            entries,
        })
    }

    /// Materialized rank for one user in one scope, if any.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read.
    pub fn user_rank(&self, user_id: &UserId, scope: &Scope) -> Result<Option<i64>> {
        let rank = match scope {
            Scope::Global => self
                .conn
                .query_row(
                    "SELECT global_rank FROM users WHERE user_id = ?1",
                    params![user_id.as_str()],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()
                .context("failed to load global rank")?
                .flatten(),
            Scope::Category(category_id) => self
                .conn
                .query_row(
                    "SELECT rank FROM category_rankings WHERE user_id = ?1 AND category_id = ?2",
                    params![user_id.as_str(), category_id.as_str()],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()
                .context("failed to load category rank")?
                .flatten(),
        };
        Ok(rank)
    }

    /// Copy the current (user, points, rank) standings of every scope into
    /// the append-only snapshot collection, filtered by the snapshot type's
    /// activity cutoff. Snapshots are immutable once written.
    ///
    /// # Errors
    /// Returns an error when any snapshot write fails; the transaction
    /// rolls back whole.
    pub fn create_snapshot(
        &mut self,
        snapshot_type: TimeWindow,
        now: OffsetDateTime,
    ) -> Result<SnapshotSummary> {
        let now = now.to_offset(UtcOffset::UTC);
        let cutoff = match snapshot_type.cutoff(now) {
            Some(value) => Some(rfc3339(value)?),
            None => None,
        };
        let snapshot_date = rfc3339(now)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_busy)
            .context("failed to start snapshot transaction")?;

        let mut rows_written = 0_u64;
        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO leaderboard_snapshots(
                        user_id, scope, points, rank, snapshot_type, snapshot_date
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .context("failed to prepare snapshot insert")?;

            let mut global = tx
                .prepare(
                    "SELECT user_id, total_points, global_rank FROM users
                     WHERE global_rank IS NOT NULL AND (?1 IS NULL OR last_activity >= ?1)
                     ORDER BY global_rank ASC",
                )
                .context("failed to prepare global snapshot query")?;
            let global_rows = global
                .query_map(params![cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                })
                .context("failed to query global standings")?;
            for row in global_rows {
                let (user_id, points, rank) = row.context("failed to read global standing")?;
                insert
                    .execute(params![
                        user_id,
                        GLOBAL_SCOPE_KEY,
                        points,
                        rank,
                        snapshot_type.as_str(),
                        snapshot_date,
                    ])
                    .context("failed to insert global snapshot row")?;
                rows_written += 1;
            }

            let mut categories = tx
                .prepare(
                    "SELECT user_id, category_id, points, rank FROM category_rankings
                     WHERE rank IS NOT NULL AND (?1 IS NULL OR last_activity >= ?1)
                     ORDER BY category_id ASC, rank ASC",
                )
                .context("failed to prepare category snapshot query")?;
            let category_rows = categories
                .query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .context("failed to query category standings")?;
            for row in category_rows {
                let (user_id, category_id, points, rank) =
                    row.context("failed to read category standing")?;
                insert
                    .execute(params![
                        user_id,
                        category_id,
                        points,
                        rank,
                        snapshot_type.as_str(),
                        snapshot_date,
                    ])
                    .context("failed to insert category snapshot row")?;
                rows_written += 1;
            }
        }

        tx.commit().map_err(map_busy).context("failed to commit snapshot transaction")?;
        tracing::info!(
            snapshot_type = snapshot_type.as_str(),
            rows = rows_written,
            "leaderboard snapshot written"
        );
        Ok(SnapshotSummary { snapshot_type, snapshot_date: now_whole_second(now)?, rows_written })
    }

    /// List archived snapshot rows, newest first, optionally filtered.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_snapshots(
        &self,
        snapshot_type: Option<TimeWindow>,
        scope: Option<&Scope>,
        limit: u32,
    ) -> Result<Vec<SnapshotRow>> {
        let type_key = snapshot_type.map(TimeWindow::as_str);
        let scope_key = scope.map(|value| value.as_key().to_string());
        let mut statement = self
            .conn
            .prepare(
                "SELECT user_id, scope, points, rank, snapshot_type, snapshot_date
                 FROM leaderboard_snapshots
                 WHERE (?1 IS NULL OR snapshot_type = ?1) AND (?2 IS NULL OR scope = ?2)
                 ORDER BY snapshot_date DESC, snapshot_id DESC LIMIT ?3",
            )
            .context("failed to prepare snapshot listing")?;
        let rows = statement
            .query_map(params![type_key, scope_key, i64::from(limit)], snapshot_from_row)
            .context("failed to query snapshots")?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row.context("failed to read snapshot row")??);
        }
        Ok(snapshots)
    }

    /// Current (user, points) standings for one scope in materializer
    /// order. Feeds the disposable sorted-read cache.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn scope_standings(&self, scope: &Scope) -> Result<Vec<(UserId, i64)>> {
        let sql = match scope {
            Scope::Global => {
                "SELECT user_id, total_points FROM users WHERE last_activity IS NOT NULL
                 ORDER BY total_points DESC, points_updated_at ASC, user_id ASC"
            }
            Scope::Category(_) => {
                "SELECT user_id, points FROM category_rankings WHERE category_id = ?1
                 ORDER BY points DESC, points_updated_at ASC, user_id ASC"
            }
        };
        let mut statement =
            self.conn.prepare(sql).context("failed to prepare standings query")?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        };
        let rows = match scope {
            Scope::Global => statement.query_map([], map_row),
            Scope::Category(category_id) => {
                statement.query_map(params![category_id.as_str()], map_row)
            }
        }
        .context("failed to query standings")?;

        let mut standings = Vec::new();
        for row in rows {
            let (raw_user, points) = row.context("failed to read standing row")?;
            standings.push((UserId::parse(&raw_user)?, points));
        }
        Ok(standings)
    }

    /// Every ranking namespace currently present: `global` plus each
    /// category with at least one ranking row.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn known_scopes(&self) -> Result<Vec<String>> {
        let mut scopes = vec![GLOBAL_SCOPE_KEY.to_string()];
        let mut statement = self
            .conn
            .prepare("SELECT DISTINCT category_id FROM category_rankings ORDER BY category_id ASC")
            .context("failed to prepare scope listing")?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query scopes")?;
        for row in rows {
            scopes.push(row.context("failed to read scope row")?);
        }
        Ok(scopes)
    }
}

/// Disposable in-memory sorted-read mirror of per-scope standings.
///
/// Never authoritative: the transactional store's computed ranks win on any
/// disagreement. Refreshed after commit on the write path and rebuildable
/// from the primary store at any time.
#[derive(Debug, Default)]
pub struct ScoreCache {
    scopes: BTreeMap<String, Vec<(UserId, i64)>>,
}

impl ScoreCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload one scope's sorted standings from the primary store.
    ///
    /// # Errors
    /// Returns an error when the store read fails; the scope is dropped
    /// from the cache rather than left stale.
    pub fn refresh_scope(&mut self, store: &SqliteStore, scope: &Scope) -> Result<()> {
        self.scopes.remove(scope.as_key());
        let standings = store.scope_standings(scope)?;
        self.scopes.insert(scope.as_key().to_string(), standings);
        Ok(())
    }

    /// Discard everything and reload every known scope from the store.
    ///
    /// # Errors
    /// Returns an error when any store read fails.
    pub fn rebuild(&mut self, store: &SqliteStore) -> Result<()> {
        self.scopes.clear();
        for key in store.known_scopes()? {
            let scope = Scope::parse(&key)?;
            let standings = store.scope_standings(&scope)?;
            self.scopes.insert(key, standings);
        }
        Ok(())
    }

    /// One page of cached (user, points), or `None` when the scope is cold.
    #[must_use]
    pub fn page(&self, scope: &Scope, limit: u32, offset: u32) -> Option<Vec<(UserId, i64)>> {
        let standings = self.scopes.get(scope.as_key())?;
        let start = standings.len().min(offset as usize);
        let end = standings.len().min(start + limit as usize);
        Some(standings[start..end].to_vec())
    }

    #[must_use]
    pub fn is_warm(&self, scope: &Scope) -> bool {
        self.scopes.contains_key(scope.as_key())
    }

    pub fn invalidate(&mut self, scope: &Scope) {
        self.scopes.remove(scope.as_key());
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
    }
}

fn upsert_category_ranking(
    tx: &rusqlite::Transaction<'_>,
    user_id: &UserId,
    category_id: &CategoryId,
    points_earned: i64,
    is_correct: bool,
    category_streak: StreakState,
    now_text: &str,
) -> Result<()> {
    let existing: Option<(i64, i64, i64)> = tx
        .query_row(
            "SELECT points, completed, correct FROM category_rankings
             WHERE user_id = ?1 AND category_id = ?2",
            params![user_id.as_str(), category_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("failed to load category ranking")?;

    let (points, completed, correct) = existing.unwrap_or((0, 0, 0));
    let points = points + points_earned;
    let completed = completed + 1;
    let correct = correct + i64::from(is_correct);
    let mastery = mastery_percentage(
        u32::try_from(correct).unwrap_or(u32::MAX),
        u32::try_from(completed).unwrap_or(u32::MAX),
    );

    tx.execute(
        "INSERT INTO category_rankings(
            user_id, category_id, points, completed, correct, mastery_percentage,
            streak_days, longest_streak, last_activity, points_updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        ON CONFLICT(user_id, category_id) DO UPDATE SET
            points = excluded.points,
            completed = excluded.completed,
            correct = excluded.correct,
            mastery_percentage = excluded.mastery_percentage,
            streak_days = excluded.streak_days,
            longest_streak = excluded.longest_streak,
            last_activity = excluded.last_activity,
            points_updated_at = excluded.points_updated_at",
        params![
            user_id.as_str(),
            category_id.as_str(),
            points,
            completed,
            correct,
            mastery,
            i64::from(category_streak.current_streak),
            i64::from(category_streak.longest_streak),
            now_text,
        ],
    )
    .context("failed to upsert category ranking")?;
    Ok(())
}

/// Assign dense ordinals 1..N over the scope's population, ordered by
/// points descending with earliest points update winning ties. Full
/// recomputation; verified before the surrounding transaction commits.
fn recompute_scope_tx(tx: &rusqlite::Transaction<'_>, scope: &Scope) -> Result<u64> {
    let ordered: Vec<String> = {
        let sql = match scope {
            Scope::Global => {
                "SELECT user_id FROM users WHERE last_activity IS NOT NULL
                 ORDER BY total_points DESC, points_updated_at ASC, user_id ASC"
            }
            Scope::Category(_) => {
                "SELECT user_id FROM category_rankings WHERE category_id = ?1
                 ORDER BY points DESC, points_updated_at ASC, user_id ASC"
            }
        };
        let mut statement = tx.prepare(sql).context("failed to prepare rank ordering")?;
        let rows = match scope {
            Scope::Global => statement.query_map([], row_string),
            Scope::Category(category_id) => {
                statement.query_map(params![category_id.as_str()], row_string)
            }
        }
        .context("failed to query rank ordering")?;
        let mut ordered = Vec::new();
        for row in rows {
            ordered.push(row.context("failed to read rank ordering row")?);
        }
        ordered
    };

    {
        let update_sql = match scope {
            Scope::Global => "UPDATE users SET global_rank = ?1 WHERE user_id = ?2",
            Scope::Category(_) => {
                "UPDATE category_rankings SET rank = ?1 WHERE user_id = ?2 AND category_id = ?3"
            }
        };
        let mut update = tx.prepare(update_sql).context("failed to prepare rank update")?;
        for (index, user_id) in ordered.iter().enumerate() {
            let rank = i64::try_from(index)
                .map_err(|_| EngineError::InvariantViolation("rank population overflow".to_string()))?
                + 1;
            match scope {
                Scope::Global => update.execute(params![rank, user_id]),
                Scope::Category(category_id) => {
                    update.execute(params![rank, user_id, category_id.as_str()])
                }
            }
            .context("failed to write rank")?;
        }
    }

    let assigned: Vec<i64> = {
        let verify_sql = match scope {
            Scope::Global => {
                "SELECT global_rank FROM users WHERE global_rank IS NOT NULL
                 ORDER BY global_rank ASC"
            }
            Scope::Category(_) => {
                "SELECT rank FROM category_rankings
                 WHERE category_id = ?1 AND rank IS NOT NULL ORDER BY rank ASC"
            }
        };
        let mut statement = tx.prepare(verify_sql).context("failed to prepare rank verify")?;
        let rows = match scope {
            Scope::Global => statement.query_map([], row_i64),
            Scope::Category(category_id) => {
                statement.query_map(params![category_id.as_str()], row_i64)
            }
        }
        .context("failed to query rank verify")?;
        let mut assigned = Vec::new();
        for row in rows {
            assigned.push(row.context("failed to read rank verify row")?);
        }
        assigned
    };

    if assigned.len() != ordered.len() {
        let violation = EngineError::InvariantViolation(format!(
            "rank recomputation for scope {} covered {} rows but assigned {}",
            scope.as_key(),
            ordered.len(),
            assigned.len()
        ));
        tracing::error!(scope = scope.as_key(), error = %violation, "rank verify failed");
        return Err(violation.into());
    }
    if let Err(violation) = validate_dense_ranks(&assigned) {
        tracing::error!(scope = scope.as_key(), error = %violation, "rank verify failed");
        return Err(violation.into());
    }

    Ok(ordered.len() as u64)
}

fn mark_scope_dirty(
    tx: &rusqlite::Transaction<'_>,
    scope: &Scope,
    now_text: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO dirty_scopes(scope, marked_at) VALUES (?1, ?2)
         ON CONFLICT(scope) DO UPDATE SET marked_at = excluded.marked_at",
        params![scope.as_key(), now_text],
    )
    .context("failed to mark scope dirty")?;
    Ok(())
}

fn load_streak(
    tx: &rusqlite::Transaction<'_>,
    user_id: &UserId,
    scope: &Scope,
) -> Result<Option<StreakState>> {
    tx.query_row(
        "SELECT current_streak, longest_streak, last_activity_date
         FROM streak_states WHERE user_id = ?1 AND scope = ?2",
        params![user_id.as_str(), scope.as_key()],
        streak_from_row,
    )
    .optional()
    .context("failed to load streak state")?
    .transpose()
}

fn write_streak(
    tx: &rusqlite::Transaction<'_>,
    user_id: &UserId,
    scope: &Scope,
    state: StreakState,
) -> Result<()> {
    tx.execute(
        "INSERT INTO streak_states(
            user_id, scope, current_streak, longest_streak, last_activity_date
        ) VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(user_id, scope) DO UPDATE SET
            current_streak = excluded.current_streak,
            longest_streak = excluded.longest_streak,
            last_activity_date = excluded.last_activity_date",
        params![
            user_id.as_str(),
            scope.as_key(),
            i64::from(state.current_streak),
            i64::from(state.longest_streak),
            day_string(state.last_activity_date)?,
        ],
    )
    .context("failed to write streak state")?;
    Ok(())
}

type SqlResult<T> = std::result::Result<T, rusqlite::Error>;

fn row_string(row: &rusqlite::Row<'_>) -> SqlResult<String> {
    row.get(0)
}

fn row_i64(row: &rusqlite::Row<'_>) -> SqlResult<i64> {
    row.get(0)
}

fn challenge_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Result<ChallengeRecord>> {
    let challenge_id: String = row.get(0)?;
    let category_id: String = row.get(1)?;
    let base_points: i64 = row.get(2)?;
    let difficulty_tier: i64 = row.get(3)?;
    let time_limit_seconds: f64 = row.get(4)?;
    let correct_answer_hash: String = row.get(5)?;
    let active_until: String = row.get(6)?;
    Ok(decode_challenge(
        &challenge_id,
        &category_id,
        base_points,
        difficulty_tier,
        time_limit_seconds,
        correct_answer_hash,
        &active_until,
    ))
}

fn decode_challenge(
    challenge_id: &str,
    category_id: &str,
    base_points: i64,
    difficulty_tier: i64,
    time_limit_seconds: f64,
    correct_answer_hash: String,
    active_until: &str,
) -> Result<ChallengeRecord> {
    Ok(ChallengeRecord {
        challenge_id: ChallengeId::parse(challenge_id)?,
        category_id: CategoryId::parse(category_id)?,
        base_points,
        difficulty_tier: u8::try_from(difficulty_tier)
            .map_err(|_| anyhow!("stored difficulty tier {difficulty_tier} is out of range"))?,
        time_limit_seconds,
        correct_answer_hash,
        active_until: parse_rfc3339(active_until)?,
    })
}

fn attempt_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Result<AttemptRecord>> {
    let attempt_id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let challenge_id: String = row.get(2)?;
    let is_correct: i64 = row.get(3)?;
    let points_earned: i64 = row.get(4)?;
    let answer_hash: String = row.get(5)?;
    let time_taken_seconds: f64 = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(decode_attempt(
        &attempt_id,
        &user_id,
        &challenge_id,
        is_correct,
        points_earned,
        answer_hash,
        time_taken_seconds,
        &created_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_attempt(
    attempt_id: &str,
    user_id: &str,
    challenge_id: &str,
    is_correct: i64,
    points_earned: i64,
    answer_hash: String,
    time_taken_seconds: f64,
    created_at: &str,
) -> Result<AttemptRecord> {
    Ok(AttemptRecord {
        attempt_id: AttemptId(
            attempt_id.parse().with_context(|| format!("malformed attempt id {attempt_id}"))?,
        ),
        user_id: UserId::parse(user_id)?,
        challenge_id: ChallengeId::parse(challenge_id)?,
        is_correct: is_correct != 0,
        points_earned,
        answer_hash,
        time_taken_seconds,
        created_at: parse_rfc3339(created_at)?,
    })
}

fn streak_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Result<StreakState>> {
    let current_streak: i64 = row.get(0)?;
    let longest_streak: i64 = row.get(1)?;
    let last_activity_date: String = row.get(2)?;
    Ok(decode_streak(current_streak, longest_streak, &last_activity_date))
}

fn decode_streak(current: i64, longest: i64, last_activity_date: &str) -> Result<StreakState> {
    Ok(StreakState {
        current_streak: u32::try_from(current)
            .map_err(|_| anyhow!("stored current streak {current} is out of range"))?,
        longest_streak: u32::try_from(longest)
            .map_err(|_| anyhow!("stored longest streak {longest} is out of range"))?,
        last_activity_date: parse_day(last_activity_date)?,
    })
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Result<LeaderboardEntry>> {
    let user_id: String = row.get(0)?;
    let points: i64 = row.get(1)?;
    let rank: i64 = row.get(2)?;
    let last_activity: String = row.get(3)?;
    Ok(decode_entry(&user_id, points, rank, &last_activity))
}

fn decode_entry(
    user_id: &str,
    points: i64,
    rank: i64,
    last_activity: &str,
) -> Result<LeaderboardEntry> {
    Ok(LeaderboardEntry {
        user_id: UserId::parse(user_id)?,
        points,
        rank,
        last_activity: parse_rfc3339(last_activity)?,
    })
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Result<SnapshotRow>> {
    let user_id: String = row.get(0)?;
    let scope: String = row.get(1)?;
    let points: i64 = row.get(2)?;
    let rank: i64 = row.get(3)?;
    let snapshot_type: String = row.get(4)?;
    let snapshot_date: String = row.get(5)?;
    Ok(decode_snapshot(&user_id, scope, points, rank, &snapshot_type, &snapshot_date))
}

fn decode_snapshot(
    user_id: &str,
    scope: String,
    points: i64,
    rank: i64,
    snapshot_type: &str,
    snapshot_date: &str,
) -> Result<SnapshotRow> {
    Ok(SnapshotRow {
        user_id: UserId::parse(user_id)?,
        scope,
        points,
        rank,
        snapshot_type: TimeWindow::parse(snapshot_type)
            .ok_or_else(|| anyhow!("stored snapshot type {snapshot_type} is unknown"))?,
        snapshot_date: parse_rfc3339(snapshot_date)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .context("failed to read schema version")
}

fn map_busy(err: rusqlite::Error) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.code == rusqlite::ErrorCode::DatabaseBusy
            || failure.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return EngineError::Transient(format!("storage busy: {err}")).into();
        }
    }
    err.into()
}

/// Timestamps persist as whole-second UTC RFC 3339 so text comparison in
/// SQL stays chronological.
fn rfc3339(value: OffsetDateTime) -> Result<String> {
    now_whole_second(value)?.format(&Rfc3339).context("failed to format timestamp")
}

fn now_whole_second(value: OffsetDateTime) -> Result<OffsetDateTime> {
    value
        .to_offset(UtcOffset::UTC)
        .replace_nanosecond(0)
        .context("failed to truncate timestamp")
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("failed to parse timestamp {value}"))
}

fn day_string(value: Date) -> Result<String> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .context("failed to format calendar day")
}

fn parse_day(value: &str) -> Result<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("failed to parse calendar day {value}"))
}

#[cfg(test)]
mod tests {
    use challenge_arena_core::EngineError;
    use time::macros::datetime;

    use super::*;

    fn open_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn user(raw: &str) -> Result<UserId> {
        Ok(UserId::parse(raw)?)
    }

    fn challenge(raw: &str) -> Result<ChallengeId> {
        Ok(ChallengeId::parse(raw)?)
    }

    fn mk_challenge(
        challenge_id: &str,
        category_id: &str,
        base_points: i64,
        difficulty_tier: u8,
        answer: &str,
    ) -> Result<ChallengeRecord> {
        Ok(ChallengeRecord {
            challenge_id: ChallengeId::parse(challenge_id)?,
            category_id: CategoryId::parse(category_id)?,
            base_points,
            difficulty_tier,
            time_limit_seconds: 60.0,
            correct_answer_hash: answer_digest(answer),
            active_until: datetime!(2027-01-01 00:00 UTC),
        })
    }

    fn seed(store: &mut SqliteStore, users: &[&str], challenges: &[ChallengeRecord]) -> Result<()> {
        let now = datetime!(2026-03-01 08:00 UTC);
        for raw in users {
            store.ensure_user(&user(raw)?, now)?;
        }
        for record in challenges {
            store.upsert_challenge(record)?;
        }
        Ok(())
    }

    fn engine_code(err: &anyhow::Error) -> Option<&'static str> {
        err.downcast_ref::<EngineError>().map(EngineError::code)
    }

    #[test]
    fn migrate_reports_pending_then_current_schema() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        let mut store = store;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn correct_tier_three_attempt_earns_double_points() -> Result<()> {
        let mut store = open_store()?;
        seed(&mut store, &["ada"], &[mk_challenge("ch-1", "astronomy", 100, 3, "mars")?])?;

        let outcome = store.record_attempt(
            &user("ada")?,
            &challenge("ch-1")?,
            "Mars",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;

        assert!(outcome.is_correct);
        assert_eq!(outcome.points_earned, 200);
        assert_eq!(outcome.new_total_points, 200);
        assert_eq!(outcome.new_rank, Some(1));
        assert!(outcome.streak_updated);
        assert_eq!(outcome.streak_days, 1);
        Ok(())
    }

    #[test]
    fn duplicate_attempt_conflicts_and_leaves_totals_unchanged() -> Result<()> {
        let mut store = open_store()?;
        seed(&mut store, &["ada"], &[mk_challenge("ch-1", "astronomy", 100, 3, "mars")?])?;
        let ada = user("ada")?;
        let ch = challenge("ch-1")?;

        let first = store.record_attempt(
            &ada,
            &ch,
            "mars",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;
        assert_eq!(first.new_total_points, 200);

        let second = store.record_attempt(
            &ada,
            &ch,
            "venus",
            5.0,
            RankMode::Inline,
            datetime!(2026-03-02 10:00 UTC),
        );
        let err = match second {
            Err(err) => err,
            Ok(outcome) => panic!("duplicate attempt was accepted: {outcome:?}"),
        };
        assert_eq!(engine_code(&err), Some("conflict"));

        let attempts = store.list_attempts(&ada)?;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].points_earned, 200);
        let rank = store.user_rank(&ada, &Scope::Global)?;
        assert_eq!(rank, Some(1));
        let page = store.leaderboard(
            &Scope::Global,
            TimeWindow::AllTime,
            10,
            0,
            datetime!(2026-03-02 11:00 UTC),
        )?;
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].points, 200);
        Ok(())
    }

    #[test]
    fn wrong_answer_subtracts_and_may_go_negative() -> Result<()> {
        let mut store = open_store()?;
        seed(&mut store, &["ada"], &[mk_challenge("ch-1", "astronomy", 100, 5, "mars")?])?;

        let outcome = store.record_attempt(
            &user("ada")?,
            &challenge("ch-1")?,
            "venus",
            5.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;
        assert!(!outcome.is_correct);
        assert_eq!(outcome.points_earned, -30);
        assert_eq!(outcome.new_total_points, -30);
        Ok(())
    }

    #[test]
    fn expired_challenge_is_rejected_with_stable_code() -> Result<()> {
        let mut store = open_store()?;
        let mut record = mk_challenge("ch-old", "history", 100, 2, "1066")?;
        record.active_until = datetime!(2026-01-01 00:00 UTC);
        seed(&mut store, &["ada"], &[record])?;

        let result = store.record_attempt(
            &user("ada")?,
            &challenge("ch-old")?,
            "1066",
            5.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        );
        let err = match result {
            Err(err) => err,
            Ok(outcome) => panic!("expired challenge was accepted: {outcome:?}"),
        };
        assert_eq!(engine_code(&err), Some("expired"));
        assert!(store.list_attempts(&user("ada")?)?.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_user_and_challenge_report_not_found() -> Result<()> {
        let mut store = open_store()?;
        seed(&mut store, &["ada"], &[mk_challenge("ch-1", "astronomy", 100, 1, "mars")?])?;
        let now = datetime!(2026-03-02 09:00 UTC);

        let missing_user = store.record_attempt(
            &user("ghost")?,
            &challenge("ch-1")?,
            "mars",
            5.0,
            RankMode::Inline,
            now,
        );
        assert_eq!(missing_user.err().as_ref().and_then(engine_code), Some("not_found"));

        let missing_challenge = store.record_attempt(
            &user("ada")?,
            &challenge("ch-missing")?,
            "mars",
            5.0,
            RankMode::Inline,
            now,
        );
        assert_eq!(missing_challenge.err().as_ref().and_then(engine_code), Some("not_found"));
        Ok(())
    }

    #[test]
    fn attempts_persist_digests_never_plaintext() -> Result<()> {
        let mut store = open_store()?;
        seed(&mut store, &["ada"], &[mk_challenge("ch-1", "astronomy", 100, 1, "mars")?])?;
        let ada = user("ada")?;

        store.record_attempt(
            &ada,
            &challenge("ch-1")?,
            "  MARS ",
            5.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;
        let attempt = store
            .get_attempt(&ada, &challenge("ch-1")?)?
            .ok_or_else(|| anyhow!("attempt row missing"))?;
        assert!(attempt.is_correct);
        assert_eq!(attempt.answer_hash, answer_digest("mars"));
        assert_ne!(attempt.answer_hash, "mars");
        Ok(())
    }

    #[test]
    fn mastery_tracks_correct_over_completed() -> Result<()> {
        let mut store = open_store()?;
        let mut challenges = Vec::new();
        for index in 0..7 {
            challenges.push(mk_challenge(
                &format!("ch-{index}"),
                "astronomy",
                100,
                1,
                "yes",
            )?);
        }
        seed(&mut store, &["ada"], &challenges)?;
        let ada = user("ada")?;

        for index in 0..7 {
            let answer = if index < 5 { "yes" } else { "no" };
            store.record_attempt(
                &ada,
                &challenge(&format!("ch-{index}"))?,
                answer,
                5.0,
                RankMode::Inline,
                datetime!(2026-03-02 09:00 UTC) + time::Duration::minutes(index),
            )?;
        }

        let mastery: f64 = store.conn.query_row(
            "SELECT mastery_percentage FROM category_rankings
             WHERE user_id = 'ada' AND category_id = 'astronomy'",
            [],
            |row| row.get(0),
        )?;
        assert!((mastery - 71.43).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn ranks_are_dense_with_earliest_update_winning_ties() -> Result<()> {
        let mut store = open_store()?;
        seed(
            &mut store,
            &["ada", "bab", "cyd"],
            &[
                mk_challenge("ch-1", "astronomy", 100, 1, "a")?,
                mk_challenge("ch-2", "astronomy", 100, 1, "a")?,
                mk_challenge("ch-3", "astronomy", 100, 1, "a")?,
            ],
        )?;

        // cyd reaches 100 points first, ada second; bab scores 120.
        store.record_attempt(
            &user("cyd")?,
            &challenge("ch-1")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;
        store.record_attempt(
            &user("ada")?,
            &challenge("ch-2")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 10:00 UTC),
        )?;
        store.record_attempt(
            &user("bab")?,
            &challenge("ch-3")?,
            "a",
            10.0,
            RankMode::Inline,
            datetime!(2026-03-02 11:00 UTC),
        )?;

        let page = store.leaderboard(
            &Scope::Global,
            TimeWindow::AllTime,
            10,
            0,
            datetime!(2026-03-02 12:00 UTC),
        )?;
        let ranked: Vec<(String, i64, i64)> = page
            .entries
            .iter()
            .map(|entry| (entry.user_id.to_string(), entry.points, entry.rank))
            .collect();
        assert_eq!(
            ranked,
            vec![
                ("bab".to_string(), 120, 1),
                ("cyd".to_string(), 100, 2),
                ("ada".to_string(), 100, 3),
            ]
        );
        assert_eq!(page.total_participants, 3);
        Ok(())
    }

    #[test]
    fn two_attempts_in_one_category_accumulate_into_one_ordering() -> Result<()> {
        let mut store = open_store()?;
        seed(
            &mut store,
            &["ada"],
            &[
                mk_challenge("ch-1", "astronomy", 100, 1, "a")?,
                mk_challenge("ch-2", "astronomy", 100, 2, "b")?,
            ],
        )?;
        let ada = user("ada")?;
        let now = datetime!(2026-03-02 09:00 UTC);

        store.record_attempt(&ada, &challenge("ch-1")?, "a", 40.0, RankMode::Inline, now)?;
        store.record_attempt(&ada, &challenge("ch-2")?, "b", 40.0, RankMode::Inline, now)?;

        let points: i64 = store.conn.query_row(
            "SELECT points FROM category_rankings WHERE user_id = 'ada' AND category_id = 'astronomy'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(points, 250);
        let scope = Scope::Category(CategoryId::parse("astronomy")?);
        assert_eq!(store.user_rank(&ada, &scope)?, Some(1));
        assert_eq!(store.user_rank(&ada, &Scope::Global)?, Some(1));
        Ok(())
    }

    #[test]
    fn streaks_extend_reset_and_self_heal() -> Result<()> {
        let mut store = open_store()?;
        let mut challenges = Vec::new();
        for index in 0..3 {
            challenges.push(mk_challenge(&format!("ch-{index}"), "history", 50, 1, "a")?);
        }
        seed(&mut store, &["ada"], &challenges)?;
        let ada = user("ada")?;

        let day1 = store.record_attempt(
            &ada,
            &challenge("ch-0")?,
            "a",
            5.0,
            RankMode::Inline,
            datetime!(2026-03-10 09:00 UTC),
        )?;
        assert_eq!(day1.streak_days, 1);

        let day2 = store.record_attempt(
            &ada,
            &challenge("ch-1")?,
            "a",
            5.0,
            RankMode::Inline,
            datetime!(2026-03-11 09:00 UTC),
        )?;
        assert_eq!(day2.streak_days, 2);
        assert!(day2.streak_updated);

        // Read on day 4 with no attempt since day 2: healed to zero.
        let lapsed = store.get_streak(&ada, &Scope::Global, datetime!(2026-03-13 09:00 UTC))?;
        assert_eq!(lapsed.current, 0);
        assert_eq!(lapsed.longest, 2);
        assert!(!lapsed.at_risk);

        let resumed = store.record_attempt(
            &ada,
            &challenge("ch-2")?,
            "a",
            5.0,
            RankMode::Inline,
            datetime!(2026-03-13 10:00 UTC),
        )?;
        assert_eq!(resumed.streak_days, 1);

        let report = store.get_streak(&ada, &Scope::Global, datetime!(2026-03-14 09:00 UTC))?;
        assert_eq!(report.current, 1);
        assert!(report.at_risk);
        assert_eq!(report.longest, 2);
        Ok(())
    }

    #[test]
    fn deferred_mode_defers_ranks_until_the_pass_runs() -> Result<()> {
        let mut store = open_store()?;
        seed(
            &mut store,
            &["ada", "bab"],
            &[
                mk_challenge("ch-1", "astronomy", 100, 1, "a")?,
                mk_challenge("ch-2", "astronomy", 100, 3, "a")?,
            ],
        )?;

        let outcome = store.record_attempt(
            &user("ada")?,
            &challenge("ch-1")?,
            "a",
            40.0,
            RankMode::Deferred,
            datetime!(2026-03-02 09:00 UTC),
        )?;
        assert_eq!(outcome.new_rank, None);
        store.record_attempt(
            &user("bab")?,
            &challenge("ch-2")?,
            "a",
            40.0,
            RankMode::Deferred,
            datetime!(2026-03-02 09:05 UTC),
        )?;

        let pass = store.run_deferred_rank_pass()?;
        assert_eq!(pass.recomputed_scopes.len(), 2);
        assert!(pass.recomputed_scopes.contains(&"global".to_string()));
        assert!(pass.recomputed_scopes.contains(&"astronomy".to_string()));

        assert_eq!(store.user_rank(&user("bab")?, &Scope::Global)?, Some(1));
        assert_eq!(store.user_rank(&user("ada")?, &Scope::Global)?, Some(2));

        // Queue drains; a second pass has nothing to do.
        let idle = store.run_deferred_rank_pass()?;
        assert!(idle.recomputed_scopes.is_empty());
        Ok(())
    }

    #[test]
    fn windowed_leaderboards_filter_by_activity_but_keep_all_time_ranks() -> Result<()> {
        let mut store = open_store()?;
        seed(
            &mut store,
            &["ada", "bab"],
            &[
                mk_challenge("ch-1", "astronomy", 100, 3, "a")?,
                mk_challenge("ch-2", "astronomy", 100, 1, "a")?,
            ],
        )?;

        // ada scores 200 in January; bab scores 100 in March.
        store.record_attempt(
            &user("ada")?,
            &challenge("ch-1")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-01-10 09:00 UTC),
        )?;
        store.record_attempt(
            &user("bab")?,
            &challenge("ch-2")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;

        let now = datetime!(2026-03-03 09:00 UTC);
        let all_time = store.leaderboard(&Scope::Global, TimeWindow::AllTime, 10, 0, now)?;
        assert_eq!(all_time.entries.len(), 2);
        assert_eq!(all_time.total_participants, 2);

        let weekly = store.leaderboard(&Scope::Global, TimeWindow::Weekly, 10, 0, now)?;
        assert_eq!(weekly.entries.len(), 1);
        assert_eq!(weekly.entries[0].user_id.to_string(), "bab");
        // All-time ordinal survives the filter: bab is still rank 2.
        assert_eq!(weekly.entries[0].rank, 2);
        assert_eq!(weekly.total_participants, 1);
        Ok(())
    }

    #[test]
    fn leaderboard_pagination_slices_by_rank() -> Result<()> {
        let mut store = open_store()?;
        let mut challenges = Vec::new();
        let users = ["u1", "u2", "u3", "u4", "u5"];
        for (index, _) in users.iter().enumerate() {
            challenges.push(mk_challenge(
                &format!("ch-{index}"),
                "astronomy",
                (index as i64 + 1) * 10,
                1,
                "a",
            )?);
        }
        seed(&mut store, &users, &challenges)?;
        for (index, raw) in users.iter().enumerate() {
            store.record_attempt(
                &user(raw)?,
                &challenge(&format!("ch-{index}"))?,
                "a",
                40.0,
                RankMode::Inline,
                datetime!(2026-03-02 09:00 UTC) + time::Duration::minutes(index as i64),
            )?;
        }

        let now = datetime!(2026-03-02 12:00 UTC);
        let first = store.leaderboard(&Scope::Global, TimeWindow::AllTime, 2, 0, now)?;
        let second = store.leaderboard(&Scope::Global, TimeWindow::AllTime, 2, 2, now)?;
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.entries[0].rank, 1);
        assert_eq!(second.entries[0].rank, 3);
        assert_eq!(first.total_participants, 5);
        Ok(())
    }

    #[test]
    fn snapshots_filter_by_cutoff_and_accumulate() -> Result<()> {
        let mut store = open_store()?;
        seed(
            &mut store,
            &["ada", "bab"],
            &[
                mk_challenge("ch-1", "astronomy", 100, 1, "a")?,
                mk_challenge("ch-2", "history", 100, 1, "a")?,
            ],
        )?;
        store.record_attempt(
            &user("ada")?,
            &challenge("ch-1")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-01-10 09:00 UTC),
        )?;
        store.record_attempt(
            &user("bab")?,
            &challenge("ch-2")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;

        let now = datetime!(2026-03-03 09:00 UTC);
        let all_time = store.create_snapshot(TimeWindow::AllTime, now)?;
        // Two users on the global board, one row in each category board.
        assert_eq!(all_time.rows_written, 4);

        let daily = store.create_snapshot(TimeWindow::Daily, now)?;
        // Only bab was active within a day: global row + history row.
        assert_eq!(daily.rows_written, 2);

        let rows = store.list_snapshots(Some(TimeWindow::Daily), None, 50)?;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.user_id.to_string() == "bab"));

        let global_rows =
            store.list_snapshots(None, Some(&Scope::Global), 50)?;
        assert_eq!(global_rows.len(), 3);
        Ok(())
    }

    #[test]
    fn cache_rebuild_matches_store_and_recovers_from_staleness() -> Result<()> {
        let mut store = open_store()?;
        seed(
            &mut store,
            &["ada", "bab"],
            &[
                mk_challenge("ch-1", "astronomy", 100, 3, "a")?,
                mk_challenge("ch-2", "astronomy", 100, 1, "a")?,
            ],
        )?;
        store.record_attempt(
            &user("ada")?,
            &challenge("ch-1")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 09:00 UTC),
        )?;

        let mut cache = ScoreCache::new();
        cache.rebuild(&store)?;
        let scope = Scope::Category(CategoryId::parse("astronomy")?);
        assert!(cache.is_warm(&scope));
        assert!(cache.is_warm(&Scope::Global));
        let page = cache.page(&Scope::Global, 10, 0).unwrap_or_default();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].1, 200);

        // A write the cache did not observe leaves it stale; the mirror is
        // disposable and a rebuild restores agreement with the store.
        store.record_attempt(
            &user("bab")?,
            &challenge("ch-2")?,
            "a",
            40.0,
            RankMode::Inline,
            datetime!(2026-03-02 10:00 UTC),
        )?;
        let stale = cache.page(&Scope::Global, 10, 0).unwrap_or_default();
        assert_eq!(stale.len(), 1);

        cache.refresh_scope(&store, &Scope::Global)?;
        let fresh = cache.page(&Scope::Global, 10, 0).unwrap_or_default();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].0.to_string(), "ada");
        assert_eq!(
            fresh.iter().map(|(user, _)| user.to_string()).collect::<Vec<_>>(),
            store
                .scope_standings(&Scope::Global)?
                .iter()
                .map(|(user, _)| user.to_string())
                .collect::<Vec<_>>()
        );

        cache.invalidate(&Scope::Global);
        assert!(!cache.is_warm(&Scope::Global));
        assert!(cache.page(&Scope::Global, 10, 0).is_none());
        Ok(())
    }

    #[test]
    fn sqlite_checks_reject_out_of_range_rows() -> Result<()> {
        let store = open_store()?;

        let bad_tier = store.conn.execute(
            "INSERT INTO challenges(
                challenge_id, category_id, base_points, difficulty_tier,
                time_limit_seconds, correct_answer_hash, active_until
            ) VALUES ('ch-x', 'astronomy', 100, 9, 60.0, 'abc', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(bad_tier.is_err());

        let bad_snapshot_type = store.conn.execute(
            "INSERT INTO leaderboard_snapshots(user_id, scope, points, rank, snapshot_type, snapshot_date)
             VALUES ('ada', 'global', 1, 1, 'hourly', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(bad_snapshot_type.is_err());
        Ok(())
    }

    #[test]
    fn foreign_keys_require_registered_users() -> Result<()> {
        let store = open_store()?;
        let orphan = store.conn.execute(
            "INSERT INTO streak_states(user_id, scope, current_streak, longest_streak, last_activity_date)
             VALUES ('ghost', 'global', 1, 1, '2026-03-01')",
            [],
        );
        assert!(orphan.is_err());
        Ok(())
    }

    mod properties {
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            #[test]
            fn recomputed_ranks_are_dense_for_any_point_spread(
                points in proptest::collection::vec(-500_i64..500, 1..25)
            ) {
                let run = || -> Result<Vec<(i64, i64)>> {
                    let mut store = open_store()?;
                    let now = datetime!(2026-03-02 09:00 UTC);
                    for (index, value) in points.iter().enumerate() {
                        let raw = format!("user-{index}");
                        store.ensure_user(&UserId::parse(&raw)?, now)?;
                        store.conn.execute(
                            "UPDATE users SET total_points = ?1, last_activity = ?2,
                             points_updated_at = ?2 WHERE user_id = ?3",
                            params![value, rfc3339(now + time::Duration::seconds(index as i64))?, raw],
                        )?;
                    }
                    store.recompute_ranks(&Scope::Global)?;
                    let mut statement = store.conn.prepare(
                        "SELECT global_rank, total_points FROM users ORDER BY global_rank ASC",
                    )?;
                    let rows = statement.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                    let mut ranked = Vec::new();
                    for row in rows {
                        ranked.push(row?);
                    }
                    Ok(ranked)
                };
                let ranked = run().map_err(|err| TestCaseError::fail(err.to_string()))?;
                prop_assert_eq!(ranked.len(), points.len());
                for (index, (rank, _)) in ranked.iter().enumerate() {
                    prop_assert_eq!(*rank, index as i64 + 1);
                }
                for pair in ranked.windows(2) {
                    prop_assert!(pair[0].1 >= pair[1].1);
                }
            }
        }
    }
}
