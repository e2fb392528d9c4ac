use std::path::PathBuf;

use anyhow::{Context, Result};
use challenge_arena_api::{
    ChallengeArenaApi, EnsureUserRequest, IngestChallengeRequest, SubmitAttemptRequest,
};
use challenge_arena_core::{RankMode, TimeWindow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "arena")]
#[command(about = "ChallengeArena scoring engine CLI")]
struct Cli {
    #[arg(long, default_value = "./challenge_arena.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "inline", value_parser = parse_rank_mode)]
    rank_mode: RankMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Challenge {
        #[command(subcommand)]
        command: ChallengeCommand,
    },
    Attempt {
        #[command(subcommand)]
        command: AttemptCommand,
    },
    Leaderboard {
        #[command(subcommand)]
        command: LeaderboardCommand,
    },
    Rank {
        #[command(subcommand)]
        command: RankCommand,
    },
    Streak {
        #[command(subcommand)]
        command: StreakCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add(UserAddArgs),
}

#[derive(Debug, Args)]
struct UserAddArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Subcommand)]
enum ChallengeCommand {
    Ingest(ChallengeIngestArgs),
}

#[derive(Debug, Args)]
struct ChallengeIngestArgs {
    #[arg(long)]
    challenge_id: String,
    #[arg(long)]
    category_id: String,
    #[arg(long)]
    base_points: i64,
    #[arg(long)]
    difficulty_tier: u8,
    #[arg(long, default_value_t = 60.0)]
    time_limit_seconds: f64,
    #[arg(long)]
    correct_answer: Option<String>,
    #[arg(long)]
    correct_answer_hash: Option<String>,
    /// RFC 3339 timestamp after which attempts are rejected.
    #[arg(long)]
    active_until: String,
}

#[derive(Debug, Subcommand)]
enum AttemptCommand {
    Submit(AttemptSubmitArgs),
}

#[derive(Debug, Args)]
struct AttemptSubmitArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    challenge_id: String,
    #[arg(long)]
    answer: String,
    #[arg(long)]
    time_taken_seconds: f64,
    /// RFC 3339 submission time override; defaults to now.
    #[arg(long)]
    submitted_at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum LeaderboardCommand {
    Show(LeaderboardShowArgs),
}

#[derive(Debug, Args)]
struct LeaderboardShowArgs {
    #[arg(long, default_value = "global")]
    scope: String,
    #[arg(long, value_enum, default_value_t = WindowArg::AllTime)]
    window: WindowArg,
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Debug, Subcommand)]
enum RankCommand {
    Show(RankShowArgs),
    Recompute(RankRecomputeArgs),
    DeferredPass,
}

#[derive(Debug, Args)]
struct RankShowArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "global")]
    scope: String,
}

#[derive(Debug, Args)]
struct RankRecomputeArgs {
    #[arg(long)]
    scope: String,
}

#[derive(Debug, Subcommand)]
enum StreakCommand {
    Show(StreakShowArgs),
}

#[derive(Debug, Args)]
struct StreakShowArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "global")]
    scope: String,
    /// RFC 3339 read time override; defaults to now.
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Create(SnapshotCreateArgs),
    List(SnapshotListArgs),
}

#[derive(Debug, Args)]
struct SnapshotCreateArgs {
    #[arg(long, value_enum)]
    snapshot_type: WindowArg,
}

#[derive(Debug, Args)]
struct SnapshotListArgs {
    #[arg(long, value_enum)]
    snapshot_type: Option<WindowArg>,
    #[arg(long)]
    scope: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    Rebuild,
    Top(CacheTopArgs),
}

#[derive(Debug, Args)]
struct CacheTopArgs {
    #[arg(long, default_value = "global")]
    scope: String,
    #[arg(long, default_value_t = 10)]
    limit: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WindowArg {
    Daily,
    Weekly,
    Monthly,
    AllTime,
}

impl From<WindowArg> for TimeWindow {
    fn from(value: WindowArg) -> Self {
        match value {
            WindowArg::Daily => Self::Daily,
            WindowArg::Weekly => Self::Weekly,
            WindowArg::Monthly => Self::Monthly,
            WindowArg::AllTime => Self::AllTime,
        }
    }
}

fn parse_rank_mode(raw: &str) -> Result<RankMode, String> {
    RankMode::parse(raw)
        .ok_or_else(|| format!("unknown rank mode `{raw}`; expected inline or deferred"))
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("failed to parse RFC 3339 timestamp {raw}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = ChallengeArenaApi::new(cli.db, cli.rank_mode);
    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::User { command } => run_user(command, &api),
        Command::Challenge { command } => run_challenge(command, &api),
        Command::Attempt { command } => run_attempt(command, &api),
        Command::Leaderboard { command } => run_leaderboard(&command, &api),
        Command::Rank { command } => run_rank(&command, &api),
        Command::Streak { command } => run_streak(&command, &api),
        Command::Snapshot { command } => run_snapshot(&command, &api),
        Command::Cache { command } => run_cache(&command, &api),
    }
}

fn run_db(command: &DbCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::to_value(status)?)
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_user(command: UserCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let result = api.ensure_user(EnsureUserRequest { user_id: args.user_id })?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_challenge(command: ChallengeCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        ChallengeCommand::Ingest(args) => {
            let record = api.ingest_challenge(IngestChallengeRequest {
                challenge_id: args.challenge_id,
                category_id: args.category_id,
                base_points: args.base_points,
                difficulty_tier: args.difficulty_tier,
                time_limit_seconds: args.time_limit_seconds,
                correct_answer_hash: args.correct_answer_hash,
                correct_answer: args.correct_answer,
                active_until: parse_timestamp(&args.active_until)?,
            })?;
            emit_json(serde_json::to_value(record)?)
        }
    }
}

fn run_attempt(command: AttemptCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        AttemptCommand::Submit(args) => {
            let submitted_at =
                args.submitted_at.as_deref().map(parse_timestamp).transpose()?;
            let outcome = api.submit_attempt(SubmitAttemptRequest {
                user_id: args.user_id,
                challenge_id: args.challenge_id,
                answer: args.answer,
                time_taken_seconds: args.time_taken_seconds,
                submitted_at,
            })?;
            emit_json(serde_json::to_value(outcome)?)
        }
    }
}

fn run_leaderboard(command: &LeaderboardCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        LeaderboardCommand::Show(args) => {
            let page = api.get_leaderboard(
                &args.scope,
                args.window.into(),
                args.limit,
                args.offset,
                None,
            )?;
            emit_json(serde_json::to_value(page)?)
        }
    }
}

fn run_rank(command: &RankCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        RankCommand::Show(args) => {
            let rank = api.get_user_rank(&args.user_id, &args.scope)?;
            emit_json(serde_json::json!({
                "user_id": args.user_id,
                "scope": args.scope,
                "rank": rank,
            }))
        }
        RankCommand::Recompute(args) => {
            let population = api.recompute_ranks(&args.scope)?;
            emit_json(serde_json::json!({
                "scope": args.scope,
                "population": population,
            }))
        }
        RankCommand::DeferredPass => {
            let summary = api.run_deferred_rank_pass()?;
            emit_json(serde_json::to_value(summary)?)
        }
    }
}

fn run_streak(command: &StreakCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        StreakCommand::Show(args) => {
            let as_of = args.as_of.as_deref().map(parse_timestamp).transpose()?;
            let report = api.get_streak(&args.user_id, &args.scope, as_of)?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}

fn run_snapshot(command: &SnapshotCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        SnapshotCommand::Create(args) => {
            let summary = api.create_snapshot(args.snapshot_type.into(), None)?;
            emit_json(serde_json::to_value(summary)?)
        }
        SnapshotCommand::List(args) => {
            let rows = api.list_snapshots(
                args.snapshot_type.map(TimeWindow::from),
                args.scope.as_deref(),
                args.limit,
            )?;
            emit_json(serde_json::json!({ "snapshots": rows }))
        }
    }
}

fn run_cache(command: &CacheCommand, api: &ChallengeArenaApi) -> Result<()> {
    match command {
        CacheCommand::Rebuild => {
            let scopes = api.rebuild_cache()?;
            emit_json(serde_json::json!({ "scopes": scopes }))
        }
        CacheCommand::Top(args) => {
            let standings = api.cached_top(&args.scope, args.limit)?;
            emit_json(serde_json::json!({
                "scope": args.scope,
                "standings": standings,
            }))
        }
    }
}
