use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, Duration, OffsetDateTime};
use ulid::Ulid;

pub const WRONG_ANSWER_PENALTY_RATE: f64 = 0.3;
pub const SPEED_BONUS_MULTIPLIER: f64 = 1.2;
pub const SPEED_BONUS_FRACTION: f64 = 0.5;
pub const STREAK_BONUS_MULTIPLIER: f64 = 1.15;
pub const STREAK_BONUS_MIN_DAYS: u32 = 7;

const MAX_ID_LENGTH: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("expired: {0}")]
    Expired(String),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Stable machine-readable code, safe to expose to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Expired(_) => "expired",
            Self::Transient(_) => "transient",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }

    /// Whether a caller may retry the failed operation verbatim.
    ///
    /// Submission is idempotent at the storage layer, so retrying a
    /// transient failure either succeeds once or surfaces `Conflict`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

fn validate_identifier(kind: &str, value: &str) -> Result<(), EngineError> {
    if value.is_empty() {
        return Err(EngineError::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(EngineError::Validation(format!(
            "{kind} exceeds {MAX_ID_LENGTH} bytes"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EngineError::Validation(format!(
            "{kind} must not contain whitespace or control characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Accept an externally issued account identity.
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for empty, oversized, or
    /// whitespace-bearing identifiers.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        validate_identifier("user id", value)?;
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ChallengeId(String);

impl ChallengeId {
    /// # Errors
    /// Returns `EngineError::Validation` for malformed identifiers.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        validate_identifier("challenge id", value)?;
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChallengeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CategoryId(String);

impl CategoryId {
    /// # Errors
    /// Returns `EngineError::Validation` for malformed identifiers, and for
    /// the reserved scope key `global`.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        validate_identifier("category id", value)?;
        if value == GLOBAL_SCOPE_KEY {
            return Err(EngineError::Validation(format!(
                "category id must not be the reserved scope key `{GLOBAL_SCOPE_KEY}`"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CategoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AttemptId(pub Ulid);

impl AttemptId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AttemptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const GLOBAL_SCOPE_KEY: &str = "global";

/// A ranking namespace: the single global board or one category board.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Scope {
    Global,
    Category(CategoryId),
}

impl Scope {
    #[must_use]
    pub fn as_key(&self) -> &str {
        match self {
            Self::Global => GLOBAL_SCOPE_KEY,
            Self::Category(category_id) => category_id.as_str(),
        }
    }

    /// # Errors
    /// Returns `EngineError::Validation` when the key is not `global` and
    /// does not parse as a category id.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        if value == GLOBAL_SCOPE_KEY {
            return Ok(Self::Global);
        }
        Ok(Self::Category(CategoryId::parse(value)?))
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// Time window for leaderboard views and snapshot cutoffs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Daily,
    Weekly,
    Monthly,
    AllTime,
}

impl TimeWindow {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::AllTime => "all_time",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "all_time" => Some(Self::AllTime),
            _ => None,
        }
    }

    /// Inclusive lower bound on `last_activity` for this window, or `None`
    /// for the unfiltered all-time view.
    #[must_use]
    pub fn cutoff(self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Self::Daily => Some(now - Duration::days(1)),
            Self::Weekly => Some(now - Duration::days(7)),
            Self::Monthly => Some(now - Duration::days(30)),
            Self::AllTime => None,
        }
    }
}

/// Rank materialization discipline, fixed per deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RankMode {
    /// Recompute affected scopes inside the attempt transaction.
    Inline,
    /// Mark scopes dirty; a periodic pass recomputes them out of band.
    Deferred,
}

impl RankMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Deferred => "deferred",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inline" => Some(Self::Inline),
            "deferred" => Some(Self::Deferred),
            _ => None,
        }
    }
}

/// One challenge as supplied by the catalog collaborator. Content is opaque
/// to the engine; only scoring metadata and the answer digest are consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeRecord {
    pub challenge_id: ChallengeId,
    pub category_id: CategoryId,
    pub base_points: i64,
    pub difficulty_tier: u8,
    pub time_limit_seconds: f64,
    pub correct_answer_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub active_until: OffsetDateTime,
}

impl ChallengeRecord {
    /// # Errors
    /// Returns `EngineError::Validation` when scoring metadata is out of
    /// range or the answer digest is not lowercase SHA-256 hex.
    pub fn validate(&self) -> Result<(), EngineError> {
        tier_multiplier(self.difficulty_tier)?;
        if self.base_points < 0 {
            return Err(EngineError::Validation(format!(
                "base points must be non-negative, got {}",
                self.base_points
            )));
        }
        if self.time_limit_seconds <= 0.0 || !self.time_limit_seconds.is_finite() {
            return Err(EngineError::Validation(format!(
                "time limit must be a positive number of seconds, got {}",
                self.time_limit_seconds
            )));
        }
        if self.correct_answer_hash.len() != 64
            || !self
                .correct_answer_hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(EngineError::Validation(
                "correct answer hash must be 64 lowercase hex characters".to_string(),
            ));
        }
        Ok(())
    }
}

/// One immutable scored attempt, the ledger's unit of record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub user_id: UserId,
    pub challenge_id: ChallengeId,
    pub is_correct: bool,
    pub points_earned: i64,
    pub answer_hash: String,
    pub time_taken_seconds: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreakState {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_activity_date: Date,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreakAdvance {
    pub state: StreakState,
    /// False when today already counted and the stored state is unchanged.
    pub updated: bool,
}

/// Daily-engagement transition for one (user, scope).
///
/// The caller must hold the scope's write lock across read and write; two
/// same-day attempts would otherwise both observe yesterday's state and
/// both increment.
#[must_use]
pub fn advance_streak(state: Option<StreakState>, today: Date) -> StreakAdvance {
    let Some(prev) = state else {
        return StreakAdvance {
            state: StreakState { current_streak: 1, longest_streak: 1, last_activity_date: today },
            updated: true,
        };
    };
    if prev.last_activity_date == today {
        return StreakAdvance { state: prev, updated: false };
    }
    if prev.last_activity_date > today {
        // A future-dated row never rewinds.
        return StreakAdvance { state: prev, updated: false };
    }
    if today.previous_day() == Some(prev.last_activity_date) {
        let current = prev.current_streak.saturating_add(1);
        return StreakAdvance {
            state: StreakState {
                current_streak: current,
                longest_streak: prev.longest_streak.max(current),
                last_activity_date: today,
            },
            updated: true,
        };
    }
    StreakAdvance {
        state: StreakState {
            current_streak: 1,
            longest_streak: prev.longest_streak,
            last_activity_date: today,
        },
        updated: true,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StreakReport {
    pub current: u32,
    pub longest: u32,
    pub at_risk: bool,
}

/// Self-healing streak read: a streak whose last activity predates
/// yesterday reports 0 without requiring any write or background sweep.
/// `at_risk` means the streak breaks unless the user acts today.
#[must_use]
pub fn observe_streak(state: Option<&StreakState>, today: Date) -> StreakReport {
    let Some(prev) = state else {
        return StreakReport { current: 0, longest: 0, at_risk: false };
    };
    if prev.last_activity_date >= today {
        return StreakReport {
            current: prev.current_streak,
            longest: prev.longest_streak,
            at_risk: false,
        };
    }
    if today.previous_day() == Some(prev.last_activity_date) {
        return StreakReport {
            current: prev.current_streak,
            longest: prev.longest_streak,
            at_risk: true,
        };
    }
    StreakReport { current: 0, longest: prev.longest_streak, at_risk: false }
}

/// Tier → point multiplier table.
///
/// # Errors
/// Returns `EngineError::Validation` for tiers outside `1..=5`.
pub fn tier_multiplier(tier: u8) -> Result<f64, EngineError> {
    match tier {
        1 => Ok(1.0),
        2 => Ok(1.5),
        3 => Ok(2.0),
        4 => Ok(3.0),
        5 => Ok(5.0),
        other => Err(EngineError::Validation(format!(
            "difficulty tier {other} is outside the supported range 1..=5"
        ))),
    }
}

/// Point delta for one challenge outcome.
///
/// Wrong answers cost a flat 30% of base points regardless of tier. Correct
/// answers earn `base × tier multiplier`, times 1.2 when answered in under
/// half the time limit, times 1.15 when the scope streak has reached
/// [`STREAK_BONUS_MIN_DAYS`].
///
/// # Errors
/// Returns `EngineError::Validation` for an out-of-range tier or malformed
/// timing inputs.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn score_attempt(
    base_points: i64,
    difficulty_tier: u8,
    is_correct: bool,
    time_taken_seconds: f64,
    time_limit_seconds: f64,
    current_streak: u32,
) -> Result<i64, EngineError> {
    let multiplier = tier_multiplier(difficulty_tier)?;
    if base_points < 0 {
        return Err(EngineError::Validation(format!(
            "base points must be non-negative, got {base_points}"
        )));
    }
    if time_limit_seconds <= 0.0 || !time_limit_seconds.is_finite() {
        return Err(EngineError::Validation(format!(
            "time limit must be a positive number of seconds, got {time_limit_seconds}"
        )));
    }
    if time_taken_seconds < 0.0 || !time_taken_seconds.is_finite() {
        return Err(EngineError::Validation(format!(
            "time taken must be a non-negative number of seconds, got {time_taken_seconds}"
        )));
    }

    let base = base_points as f64;
    if !is_correct {
        return Ok(-(base * WRONG_ANSWER_PENALTY_RATE).round() as i64);
    }

    let speed_bonus = if time_taken_seconds < SPEED_BONUS_FRACTION * time_limit_seconds {
        SPEED_BONUS_MULTIPLIER
    } else {
        1.0
    };
    let streak_bonus =
        if current_streak >= STREAK_BONUS_MIN_DAYS { STREAK_BONUS_MULTIPLIER } else { 1.0 };
    Ok((base * multiplier * speed_bonus * streak_bonus).round() as i64)
}

/// Correct ÷ completed × 100, rounded to two decimals; 0 for no attempts.
#[must_use]
pub fn mastery_percentage(correct: u32, completed: u32) -> f64 {
    if completed == 0 {
        return 0.0;
    }
    let raw = f64::from(correct) / f64::from(completed) * 100.0;
    (raw * 100.0).round() / 100.0
}

/// Trim and Unicode-lowercase a submitted answer before hashing.
#[must_use]
pub fn normalize_answer(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Lowercase hex SHA-256 over the normalized answer. Plaintext answers are
/// never persisted; this digest is the only stored form.
#[must_use]
pub fn answer_digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_answer(raw).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify that a materialized ordering is exactly `1..=N`.
///
/// # Errors
/// Returns `EngineError::InvariantViolation` on any gap, duplicate, or
/// out-of-place ordinal. Never expected to fire; callers keep the previous
/// ranking when it does.
pub fn validate_dense_ranks(ranks: &[i64]) -> Result<(), EngineError> {
    for (index, rank) in ranks.iter().enumerate() {
        let expected = i64::try_from(index)
            .map_err(|_| EngineError::InvariantViolation("rank population overflow".to_string()))?
            + 1;
        if *rank != expected {
            return Err(EngineError::InvariantViolation(format!(
                "rank sequence malformed at position {index}: expected {expected}, got {rank}"
            )));
        }
    }
    Ok(())
}
