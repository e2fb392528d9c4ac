use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use challenge_arena_api::{
    error_code, CachedStanding, ChallengeArenaApi, EnsureUserRequest, EnsureUserResult,
    IngestChallengeRequest, MigrateResult, SubmitAttemptRequest, API_CONTRACT_VERSION,
};
use challenge_arena_core::{ChallengeRecord, RankMode, StreakReport, TimeWindow};
use challenge_arena_store_sqlite::{
    AttemptOutcome, DeferredRankPassSummary, LeaderboardPage, SchemaStatus, SnapshotRow,
    SnapshotSummary,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

const DEFAULT_PAGE_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
struct ServiceState {
    api: ChallengeArenaApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct LeaderboardParams {
    window: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct CachedParams {
    limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecomputeRequest {
    scope: String,
}

#[derive(Debug, Clone, Serialize)]
struct RecomputeResult {
    scope: String,
    population: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateSnapshotRequest {
    snapshot_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SnapshotListParams {
    snapshot_type: Option<String>,
    scope: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct CacheRebuildResult {
    scopes: usize,
}

#[derive(Debug, Clone, Serialize)]
struct RankResponse {
    scope: String,
    user_id: String,
    rank: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "challenge-arena-service")]
#[command(about = "Local HTTP service for the ChallengeArena scoring engine")]
struct Args {
    #[arg(long, default_value = "./challenge_arena.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value = "inline", value_parser = parse_rank_mode)]
    rank_mode: RankMode,
    /// Deferred-mode rank pass interval in seconds; 0 disables the task.
    #[arg(long, default_value_t = 30)]
    rank_interval_seconds: u64,
}

fn parse_rank_mode(raw: &str) -> Result<RankMode, String> {
    RankMode::parse(raw)
        .ok_or_else(|| format!("unknown rank mode `{raw}`; expected inline or deferred"))
}

impl ServiceError {
    fn from_error(err: &anyhow::Error) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: error_code(err),
            error: format!("{err:#}"),
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: "validation_error",
            error: message.into(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self.code {
            "validation_error" => StatusCode::UNPROCESSABLE_ENTITY,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "expired" => StatusCode::GONE,
            "transient" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn service_error(err: &anyhow::Error) -> ServiceError {
    ServiceError::from_error(err)
}

fn parse_window(raw: Option<&str>) -> Result<TimeWindow, ServiceError> {
    match raw {
        None => Ok(TimeWindow::AllTime),
        Some(value) => TimeWindow::parse(value).ok_or_else(|| {
            ServiceError::validation(format!(
                "unknown window `{value}`; expected daily, weekly, monthly, or all_time"
            ))
        }),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/users", post(users_ensure))
        .route("/v1/challenges", post(challenges_ingest))
        .route("/v1/attempts", post(attempts_submit))
        .route("/v1/leaderboard/:scope", get(leaderboard_show))
        .route("/v1/leaderboard/:scope/cached", get(leaderboard_cached))
        .route("/v1/rank/:scope/:user_id", get(rank_show))
        .route("/v1/streak/:scope/:user_id", get(streak_show))
        .route("/v1/ranks/recompute", post(ranks_recompute))
        .route("/v1/ranks/deferred-pass", post(ranks_deferred_pass))
        .route("/v1/snapshots", post(snapshots_create).get(snapshots_list))
        .route("/v1/cache/rebuild", post(cache_rebuild))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let api = ChallengeArenaApi::new(args.db, args.rank_mode);

    if args.rank_mode == RankMode::Deferred && args.rank_interval_seconds > 0 {
        let pass_api = api.clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(args.rank_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                match pass_api.run_deferred_rank_pass() {
                    Ok(summary) if !summary.recomputed_scopes.is_empty() => {
                        tracing::info!(
                            scopes = summary.recomputed_scopes.len(),
                            "deferred rank pass recomputed scopes"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "deferred rank pass failed"),
                }
            }
        });
    }

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn users_ensure(
    State(state): State<ServiceState>,
    Json(request): Json<EnsureUserRequest>,
) -> Result<Json<ServiceEnvelope<EnsureUserResult>>, ServiceError> {
    let result = state.api.ensure_user(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn challenges_ingest(
    State(state): State<ServiceState>,
    Json(request): Json<IngestChallengeRequest>,
) -> Result<Json<ServiceEnvelope<ChallengeRecord>>, ServiceError> {
    let record = state.api.ingest_challenge(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(record)))
}

async fn attempts_submit(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitAttemptRequest>,
) -> Result<Json<ServiceEnvelope<AttemptOutcome>>, ServiceError> {
    let outcome = state.api.submit_attempt(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn leaderboard_show(
    State(state): State<ServiceState>,
    Path(scope): Path<String>,
    Query(params): Query<LeaderboardParams>,
) -> Result<Json<ServiceEnvelope<LeaderboardPage>>, ServiceError> {
    let window = parse_window(params.window.as_deref())?;
    let page = state
        .api
        .get_leaderboard(
            &scope,
            window,
            params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            params.offset.unwrap_or(0),
            None,
        )
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(page)))
}

async fn leaderboard_cached(
    State(state): State<ServiceState>,
    Path(scope): Path<String>,
    Query(params): Query<CachedParams>,
) -> Result<Json<ServiceEnvelope<Vec<CachedStanding>>>, ServiceError> {
    let standings = state
        .api
        .cached_top(&scope, params.limit.unwrap_or(DEFAULT_PAGE_LIMIT))
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(standings)))
}

async fn rank_show(
    State(state): State<ServiceState>,
    Path((scope, user_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<RankResponse>>, ServiceError> {
    let rank = state.api.get_user_rank(&user_id, &scope).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(RankResponse { scope, user_id, rank })))
}

async fn streak_show(
    State(state): State<ServiceState>,
    Path((scope, user_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<StreakReport>>, ServiceError> {
    let report =
        state.api.get_streak(&user_id, &scope, None).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(report)))
}

async fn ranks_recompute(
    State(state): State<ServiceState>,
    Json(request): Json<RecomputeRequest>,
) -> Result<Json<ServiceEnvelope<RecomputeResult>>, ServiceError> {
    let population =
        state.api.recompute_ranks(&request.scope).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(RecomputeResult { scope: request.scope, population })))
}

async fn ranks_deferred_pass(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<DeferredRankPassSummary>>, ServiceError> {
    let summary = state.api.run_deferred_rank_pass().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(summary)))
}

async fn snapshots_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Result<Json<ServiceEnvelope<SnapshotSummary>>, ServiceError> {
    let snapshot_type = TimeWindow::parse(&request.snapshot_type).ok_or_else(|| {
        ServiceError::validation(format!(
            "unknown snapshot type `{}`; expected daily, weekly, monthly, or all_time",
            request.snapshot_type
        ))
    })?;
    let summary =
        state.api.create_snapshot(snapshot_type, None).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(summary)))
}

async fn snapshots_list(
    State(state): State<ServiceState>,
    Query(params): Query<SnapshotListParams>,
) -> Result<Json<ServiceEnvelope<Vec<SnapshotRow>>>, ServiceError> {
    let snapshot_type = match params.snapshot_type.as_deref() {
        None => None,
        Some(raw) => Some(TimeWindow::parse(raw).ok_or_else(|| {
            ServiceError::validation(format!("unknown snapshot type `{raw}`"))
        })?),
    };
    let rows = state
        .api
        .list_snapshots(
            snapshot_type,
            params.scope.as_deref(),
            params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(rows)))
}

async fn cache_rebuild(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CacheRebuildResult>>, ServiceError> {
    let scopes = state.api.rebuild_cache().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(CacheRebuildResult { scopes })))
}
