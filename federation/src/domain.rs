//! Shared data model (spec §3). Plain structs/enums; no persistence logic
//! lives here — `store` owns reading and writing rows, `stream`/`merge`/
//! `consensus` own the behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub karma: f64,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    Swarm,
    Review,
    Gated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipModel {
    Solo,
    Guild,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAccess {
    Public,
    KarmaThreshold,
    Allowlist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStage {
    Seed,
    Growth,
    Established,
    Mature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusAuthority {
    Local,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    pub name: String,
    pub merge_mode: MergeMode,
    pub ownership_model: OwnershipModel,
    pub consensus_threshold: f64,
    pub min_reviews: u32,
    pub human_review_weight: f64,
    pub agent_access: AgentAccess,
    pub min_karma: f64,
    pub buffer_branch: String,
    pub promote_target: String,
    pub auto_promote_on_green: bool,
    pub auto_revert_on_red: bool,
    pub stabilize_command: String,
    pub stage: RepoStage,
    pub consensus_authority: ConsensusAuthority,
}

impl Repo {
    /// spec §3 invariants: `min_reviews >= 1`, `0 <= consensus_threshold <= 1`.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_reviews < 1 {
            return Err("min_reviews must be >= 1".into());
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            return Err("consensus_threshold must be in [0,1]".into());
        }
        Ok(())
    }

    /// Stage is monotonic: never regresses. Returns the target stage, or
    /// the current stage if `target` would be a regression.
    pub fn advance_stage(&self, target: RepoStage) -> RepoStage {
        if target > self.stage {
            target
        } else {
            self.stage
        }
    }

    /// `consensus_authority` starts local and never reverts once server.
    pub fn promote_authority_to_server(&mut self) {
        self.consensus_authority = ConsensusAuthority::Server;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Active,
    InReview,
    Merged,
    Abandoned,
    Conflicted,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    Cli,
    Api,
    ExternalPr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub repo_id: String,
    pub agent_id: String,
    pub branch: String,
    pub base_branch: String,
    pub parent_stream_id: Option<String>,
    pub task_id: Option<String>,
    pub status: StreamStatus,
    pub review_status: ReviewStatus,
    pub source: StreamSource,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
    Comment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub stream_id: String,
    pub reviewer_id: String,
    pub verdict: Verdict,
    pub is_human: bool,
    pub tested: bool,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClaimStatus {
    Active,
    Submitted,
    Approved,
    Rejected,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub repo_id: String,
    pub title: String,
    pub description: String,
    pub priority: i64,
}

/// Queue priority ranks from spec §4.7.2: `critical=0, high=25, medium=50,
/// low=75`; a council override may set an arbitrary integer.
pub mod task_priority {
    pub const CRITICAL: i64 = 0;
    pub const HIGH: i64 = 25;
    pub const MEDIUM: i64 = 50;
    pub const LOW: i64 = 75;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaim {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub stream_id: Option<String>,
    pub status: TaskClaimStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizationResult {
    Green,
    Red,
    Flaky,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilizationRecord {
    pub repo_id: String,
    pub result: StabilizationResult,
    pub buffer_commit: String,
    pub tag: Option<String>,
    pub breaking_stream_id: Option<String>,
    pub details: String,
    pub stabilized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectPush {
    None,
    Maintainers,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRule {
    pub repo_id: String,
    pub branch_pattern: String,
    pub direct_push: DirectPush,
    pub required_approvals: u32,
    pub require_tests_pass: bool,
    pub consensus_threshold_override: Option<f64>,
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintainerRole {
    Owner,
    Maintainer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintainerGrant {
    pub repo_id: String,
    pub agent_id: String,
    pub role: MaintainerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Read,
    Write,
    Maintain,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitGrant {
    pub repo_id: String,
    pub agent_id: String,
    pub level: AccessLevel,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    StreamCreated,
    StreamAbandoned,
    Commit,
    Review,
    ConsensusReached,
    MergeRequested,
    MergeCompleted,
    Stabilization,
    Promotion,
    TaskSubmission,
    CouncilProposal,
    CouncilVote,
    StageProgression,
    PluginExecuted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub seq: i64,
    pub repo_id: String,
    pub event_type: SyncEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}
