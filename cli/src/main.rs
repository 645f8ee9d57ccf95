//! `gitswarm`: local-deployment CLI front end for the federation engine.
//! Every command talks to the embedded SQLite backend at
//! `<repo>/.gitswarm/federation.db` and an in-process mechanics provider —
//! a real deployment swaps in a networked `Store` and an external mechanics
//! process without this binary changing shape (spec §1: both are pluggable
//! boundaries). On failure, prints the single structured line spec §7
//! requires and exits non-zero.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gitswarm_federation::domain::{
    AccessLevel, AgentAccess, ConsensusAuthority, MergeMode, OwnershipModel, Repo, RepoStage,
    Verdict,
};
use gitswarm_federation::git_mechanics::fake::FakeMechanics;
use gitswarm_federation::git_mechanics::GitMechanicsProvider;
use gitswarm_federation::merge::{CommandRunner, PluginRegistry};
use gitswarm_federation::store::sqlite::SqliteStore;
use gitswarm_federation::store::{Param, Store};
use gitswarm_federation::stream::CreateWorkspaceRequest;
use gitswarm_federation::{config::RepoConfig, ids, Engine, RepoLayout};

#[derive(Parser)]
#[command(name = "gitswarm", about = "GitSwarm federation engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize `.gitswarm/` in the current repository.
    Init,
    /// Create a stream and commit a change to it.
    Commit {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        stream: Option<String>,
        #[arg(long)]
        message: String,
        #[arg(long)]
        depends_on: Option<String>,
    },
    /// Submit a stream for review.
    Submit {
        #[arg(long)]
        stream: String,
    },
    /// Record a review verdict on a stream.
    Review {
        #[arg(long)]
        stream: String,
        #[arg(long)]
        reviewer: String,
        #[arg(long, value_enum)]
        verdict: VerdictArg,
        #[arg(long)]
        human: bool,
        #[arg(long)]
        tested: bool,
    },
    /// Process the next mergeable stream in the queue.
    Merge,
    /// Run the stabilize command against the buffer branch.
    Stabilize,
    /// Promote the buffer to the promotion target if green.
    Promote,
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Push queued local events to the server.
    Flush,
    /// Pull server-authored state.
    Poll,
}

#[derive(Clone, clap::ValueEnum)]
enum VerdictArg {
    Approve,
    RequestChanges,
    Comment,
}

impl From<VerdictArg> for Verdict {
    fn from(v: VerdictArg) -> Self {
        match v {
            VerdictArg::Approve => Verdict::Approve,
            VerdictArg::RequestChanges => Verdict::RequestChanges,
            VerdictArg::Comment => Verdict::Comment,
        }
    }
}

/// CLI-local error aggregate so `main()` can print the single structured
/// `error: <kind>: <message>` line spec §7 requires, even though several of
/// the calls in `run()` surface a module error type directly rather than
/// the aggregate `FederationError` (no single federation operation spans
/// config load + store open + engine dispatch).
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] gitswarm_federation::store::StoreError),
    #[error(transparent)]
    Stream(#[from] gitswarm_federation::stream::StreamError),
    #[error(transparent)]
    Merge(#[from] gitswarm_federation::merge::MergeError),
    #[error(transparent)]
    Sync(#[from] gitswarm_federation::sync::SyncError),
    #[error(transparent)]
    Config(#[from] gitswarm_federation::config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    fn cli_line(&self) -> String {
        use gitswarm_federation::ErrorKind;
        let kind = match self {
            Self::Store(e) => e.kind(),
            Self::Stream(e) => e.kind(),
            Self::Merge(e) => e.kind(),
            Self::Sync(e) => e.kind(),
            Self::Config(e) => e.kind(),
            Self::Io(_) | Self::Yaml(_) => ErrorKind::Fatal,
        };
        format!("error: {kind}: {self}")
    }
}

type CliResult<T> = Result<T, CliError>;

fn repo_root() -> PathBuf {
    std::env::current_dir().expect("cwd must be readable")
}

async fn load_or_create_repo(store: &dyn Store, cfg: &RepoConfig) -> CliResult<Repo> {
    let rows = store.exec("SELECT * FROM {{repos}} LIMIT 1", &[]).await?;
    if let Some(row) = rows.first() {
        return Ok(Repo {
            id: row.get_str("id").unwrap_or_default().to_string(),
            name: row.get_str("name").unwrap_or_default().to_string(),
            merge_mode: cfg.merge_mode,
            ownership_model: cfg.ownership_model,
            consensus_threshold: cfg.consensus_threshold,
            min_reviews: cfg.min_reviews,
            human_review_weight: cfg.human_review_weight,
            agent_access: parse_agent_access(row.get_str("agent_access")),
            min_karma: row.get_f64("min_karma").unwrap_or(0.0),
            buffer_branch: cfg.buffer_branch.clone(),
            promote_target: cfg.promote_target.clone(),
            auto_promote_on_green: cfg.auto_promote_on_green,
            auto_revert_on_red: cfg.auto_revert_on_red,
            stabilize_command: cfg.stabilize_command.clone(),
            stage: parse_stage(row.get_str("stage")),
            consensus_authority: parse_authority(row.get_str("consensus_authority")),
        });
    }

    let repo = Repo {
        id: ids::generate(),
        name: repo_root().file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        merge_mode: cfg.merge_mode,
        ownership_model: cfg.ownership_model,
        consensus_threshold: cfg.consensus_threshold,
        min_reviews: cfg.min_reviews,
        human_review_weight: cfg.human_review_weight,
        agent_access: AgentAccess::Public,
        min_karma: 0.0,
        buffer_branch: cfg.buffer_branch.clone(),
        promote_target: cfg.promote_target.clone(),
        auto_promote_on_green: cfg.auto_promote_on_green,
        auto_revert_on_red: cfg.auto_revert_on_red,
        stabilize_command: cfg.stabilize_command.clone(),
        stage: RepoStage::Seed,
        consensus_authority: ConsensusAuthority::Local,
    };
    store
        .exec(
            "INSERT INTO {{repos}} (id, name, merge_mode, ownership_model, consensus_threshold, min_reviews, human_review_weight, agent_access, min_karma, buffer_branch, promote_target, auto_promote_on_green, auto_revert_on_red, stabilize_command, stage, consensus_authority) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
            &[
                Param::Text(repo.id.clone()),
                Param::Text(repo.name.clone()),
                Param::Text("review".into()),
                Param::Text("guild".into()),
                Param::Real(repo.consensus_threshold),
                Param::Int(repo.min_reviews as i64),
                Param::Real(repo.human_review_weight),
                Param::Text("public".into()),
                Param::Real(repo.min_karma),
                Param::Text(repo.buffer_branch.clone()),
                Param::Text(repo.promote_target.clone()),
                Param::Bool(repo.auto_promote_on_green),
                Param::Bool(repo.auto_revert_on_red),
                Param::Text(repo.stabilize_command.clone()),
                Param::Text("seed".into()),
                Param::Text("local".into()),
            ],
        )
        .await?;
    Ok(repo)
}

fn parse_agent_access(s: Option<&str>) -> AgentAccess {
    match s {
        Some("karma_threshold") => AgentAccess::KarmaThreshold,
        Some("allowlist") => AgentAccess::Allowlist,
        _ => AgentAccess::Public,
    }
}
fn parse_stage(s: Option<&str>) -> RepoStage {
    match s {
        Some("growth") => RepoStage::Growth,
        Some("established") => RepoStage::Established,
        Some("mature") => RepoStage::Mature,
        _ => RepoStage::Seed,
    }
}
fn parse_authority(s: Option<&str>) -> ConsensusAuthority {
    match s {
        Some("server") => ConsensusAuthority::Server,
        _ => ConsensusAuthority::Local,
    }
}

async fn ensure_agent(store: &dyn Store, agent_id: &str) -> CliResult<()> {
    store
        .exec(
            "INSERT OR IGNORE INTO {{agents}} (id, name, karma, status) VALUES (?,?,0,'active')",
            &[Param::Text(agent_id.to_string()), Param::Text(agent_id.to_string())],
        )
        .await
        .ok();
    Ok(())
}

#[tokio::main]
async fn main() {
    gitswarm_federation::init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli.command).await {
        eprintln!("{}", err.cli_line());
        std::process::exit(1);
    }
}

async fn run(command: Command) -> CliResult<()> {
    let layout = RepoLayout::new(repo_root());

    if let Command::Init = command {
        layout.ensure()?;
        if !layout.config_path().exists() {
            std::fs::write(layout.config_path(), serde_yaml::to_string(&RepoConfig::default())?)?;
        }
        let store = SqliteStore::open(layout.db_path())?;
        let cfg = RepoConfig::load(layout.config_path()).unwrap_or_default();
        let repo = load_or_create_repo(&store, &cfg).await?;
        println!("initialized repo {}", repo.id);
        return Ok(());
    }

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(layout.db_path())?);
    let cfg = RepoConfig::load(layout.config_path()).unwrap_or_default();
    let repo = load_or_create_repo(&*store, &cfg).await?;
    let mechanics: Arc<dyn GitMechanicsProvider> = Arc::new(FakeMechanics::new());
    let engine = Engine::new(store.clone(), mechanics, None, PluginRegistry::default());

    match command {
        Command::Init => unreachable!("handled above"),
        Command::Commit { agent, stream, message, depends_on } => {
            ensure_agent(&*store, &agent).await?;
            let stream_id = match stream {
                Some(id) => id,
                None => {
                    let s = engine
                        .streams
                        .create_workspace(CreateWorkspaceRequest {
                            repo: repo.clone(),
                            agent_id: agent.clone(),
                            agent_level: AccessLevel::Write,
                            base_branch: "main".into(),
                            depends_on,
                            task_id: None,
                        })
                        .await?;
                    println!("created stream {}", s.id);
                    s.id
                }
            };
            let worktree = format!("worktree-{}", &agent);
            engine
                .streams
                .commit(&repo, &stream_id, &worktree, &message, &agent)
                .await?;
            println!("committed to {stream_id}");
        }
        Command::Submit { stream } => {
            engine.streams.submit_for_review(&stream).await?;
            println!("submitted {stream} for review");
        }
        Command::Review { stream, reviewer, verdict, human, tested } => {
            ensure_agent(&*store, &reviewer).await?;
            engine
                .streams
                .submit_review(&repo, &stream, &reviewer, verdict.into(), human, tested)
                .await?;
            println!("recorded review on {stream}");
        }
        Command::Merge => match engine.merge.process_next(&repo).await? {
            Some(stream_id) => println!("merged {stream_id}"),
            None => println!("merge queue empty"),
        },
        Command::Stabilize => {
            let runner = CommandRunner::new(repo.stabilize_command.clone());
            let outcome = engine.merge.stabilize(&repo, &runner).await?;
            println!("stabilization result: {outcome:?}");
        }
        Command::Promote => {
            let promoted = engine.merge.promote(&repo).await?;
            println!("promoted: {promoted}");
        }
        Command::Sync(SyncCommand::Flush) => {
            let n = engine.sync.flush(&repo.id).await?;
            println!("flushed {n} events");
        }
        Command::Sync(SyncCommand::Poll) => match engine.sync.poll(&repo.id).await {
            Some(state) => println!("{state}"),
            None => println!("server unreachable"),
        },
    }
    Ok(())
}
