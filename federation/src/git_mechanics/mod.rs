//! Git mechanics client (spec §4.5): a thin typed facade over the external
//! git mechanics provider. The provider owns worktree creation, commit
//! object creation, cascade rebase, and Change-Id assignment — spec §1
//! treats it as an opaque collaborator. This module defines the contract
//! and nothing else; callers in `stream` and `merge` never reissue a git
//! command directly (spec §4.5: "policy layer never reissues a git command
//! directly").
//!
//! Grounded on the worktree-isolation shape of
//! `crates/swarm-agents/src/worktree_bridge.rs` (one worktree per agent,
//! shelled `git worktree add`) — that file is not reused verbatim (it is
//! part of the dropped `swarm-agents` member and, being a concrete shell
//! driver, belongs on the "external provider" side of this boundary, not
//! inside the federation engine) but its shape informs `fake::FakeMechanics`,
//! the in-process test double used by this crate's own test suite.

pub mod fake;

use async_trait::async_trait;

use crate::error::ErrorKind;

#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub files: Vec<String>,
    pub src: String,
    pub tgt: String,
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged { commit_hash: String },
    Conflict(ConflictInfo),
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub commit_hash: String,
    pub change_id: String,
}

#[derive(Debug, Clone)]
pub enum CascadeOutcome {
    Rebased { stream_id: String, new_base: String },
    Conflict { stream_id: String, info: ConflictInfo },
}

/// One atomic operation in the mechanics provider's history, used by
/// `merge::stabilize` to bisect a red buffer (spec §4.7.4 step 6).
#[derive(Debug, Clone)]
pub struct AtomicOperation {
    pub op_id: String,
    pub stream_id: Option<String>,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MechanicsError {
    #[error("mechanics provider unavailable: {0}")]
    Unavailable(String),
    #[error("mechanics operation failed: {0}")]
    Failed(String),
    #[error("unknown stream: {0}")]
    UnknownStream(String),
}

impl MechanicsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::ServerUnavailable,
            Self::Failed(_) | Self::UnknownStream(_) => ErrorKind::Fatal,
        }
    }
}

pub type MechanicsResult<T> = Result<T, MechanicsError>;

/// The complete interface from spec §4.5, table form preserved as trait
/// methods one-to-one.
#[async_trait]
pub trait GitMechanicsProvider: Send + Sync {
    async fn create_stream(
        &self,
        repo: &str,
        base: &str,
        parent: Option<&str>,
    ) -> MechanicsResult<String>;

    async fn create_worktree(&self, stream: &str, agent: &str) -> MechanicsResult<String>;

    async fn commit(
        &self,
        stream: &str,
        worktree: &str,
        message: &str,
        agent: &str,
    ) -> MechanicsResult<CommitOutcome>;

    async fn merge_stream(&self, stream: &str, target: &str) -> MechanicsResult<MergeOutcome>;

    async fn cascade_rebase(&self, streams: &[String]) -> MechanicsResult<Vec<CascadeOutcome>>;

    async fn rollback_to_operation(&self, op_id: &str) -> MechanicsResult<String>;

    async fn operations_since(&self, tag: &str) -> MechanicsResult<Vec<AtomicOperation>>;

    async fn diff(&self, stream: &str, against: &str) -> MechanicsResult<String>;

    async fn changed_files(&self, stream: &str) -> MechanicsResult<Vec<String>>;
}
