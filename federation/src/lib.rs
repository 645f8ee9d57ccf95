//! GitSwarm federation engine: the policy layer coordinating AI agents that
//! collaborate on a shared git repository. The engine never reissues a git
//! command itself — it delegates mechanics to a pluggable
//! [`git_mechanics::GitMechanicsProvider`] and persists policy state
//! through a pluggable [`store::Store`] backend, so the same logic runs
//! identically against an embedded SQLite deployment and a networked
//! PostgreSQL one.
//!
//! Module layout mirrors the dependency order components are built in:
//! `ids` and `store` have no internal dependencies; `identity` and
//! `consensus` depend only on `domain`; `git_mechanics` is an external
//! boundary; `stream`, `merge`, and `sync` compose the rest into the
//! operations agents actually call.

pub mod config;
pub mod consensus;
pub mod domain;
pub mod error;
pub mod git_mechanics;
pub mod identity;
pub mod ids;
pub mod merge;
pub mod store;
pub mod stream;
pub mod sync;

pub use error::{ErrorKind, FederationError, FederationResult};

use std::path::Path;
use std::sync::Arc;

use store::Store;

/// Everything needed to drive one repo's federation operations: the store,
/// mechanics provider, sync engine, and merge coordinator wired together.
/// Built once per `gitswarm` process (or per served repo, on the server
/// side) and handed to `stream`/`merge`/`sync` calls.
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub mechanics: Arc<dyn git_mechanics::GitMechanicsProvider>,
    pub sync: Arc<sync::SyncEngine>,
    pub merge: Arc<merge::MergeCoordinator>,
    pub streams: stream::StreamManager,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        mechanics: Arc<dyn git_mechanics::GitMechanicsProvider>,
        server_url: Option<String>,
        plugins: merge::PluginRegistry,
    ) -> Self {
        let sync = Arc::new(sync::SyncEngine::new(store.clone(), server_url));
        let merge = Arc::new(merge::MergeCoordinator::new(
            store.clone(),
            mechanics.clone(),
            sync.clone(),
            plugins,
        ));
        let streams = stream::StreamManager::new(store.clone(), mechanics.clone(), sync.clone(), merge.clone());
        Self {
            store,
            mechanics,
            sync,
            merge,
            streams,
        }
    }
}

/// `<repo>/.gitswarm/` deployment layout (spec §6.5).
pub struct RepoLayout {
    pub root: std::path::PathBuf,
}

impl RepoLayout {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            root: repo_root.as_ref().join(".gitswarm"),
        }
    }

    pub fn db_path(&self) -> std::path::PathBuf {
        self.root.join("federation.db")
    }

    pub fn config_path(&self) -> std::path::PathBuf {
        self.root.join("config.yml")
    }

    pub fn worktree_path(&self, agent: &str, task: Option<&str>) -> std::path::PathBuf {
        let dir_name = match task {
            Some(t) => format!("{agent}-{t}"),
            None => agent.to_string(),
        };
        self.root.join("worktrees").join(dir_name)
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.root.join("worktrees"))
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
