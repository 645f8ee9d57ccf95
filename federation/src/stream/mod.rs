//! Stream manager (spec §4.6): the stream state machine, dual-writing
//! policy metadata alongside mechanics delegation.

pub mod state_machine;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::consensus;
use crate::domain::{
    AccessLevel, ConsensusAuthority, MaintainerGrant, MaintainerRole, MergeMode, Repo, Review,
    ReviewStatus, Stream, StreamSource, StreamStatus, Verdict,
};
use crate::error::ErrorKind;
use crate::git_mechanics::GitMechanicsProvider;
use crate::ids;
use crate::identity::{self, Action};
use crate::merge::{MergeCoordinator, MergeError};
use crate::store::{Param, Store};
use crate::sync::{SyncEngine, SyncEventPayload};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("illegal transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: StreamStatus,
        to: StreamStatus,
    },
    #[error("forbidden: agent lacks required access (resolved via {reason})")]
    Forbidden { reason: String },
    #[error("stream not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Mechanics(#[from] crate::git_mechanics::MechanicsError),
    #[error(transparent)]
    Merge(#[from] Box<MergeError>),
    #[error(transparent)]
    Sync(#[from] crate::sync::SyncError),
}

impl From<MergeError> for StreamError {
    fn from(e: MergeError) -> Self {
        StreamError::Merge(Box::new(e))
    }
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::InvalidInput,
            Self::Store(e) => e.kind(),
            Self::Mechanics(e) => e.kind(),
            Self::Merge(e) => e.kind(),
            Self::Sync(e) => e.kind(),
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

fn row_to_stream(row: &crate::store::Row) -> Stream {
    Stream {
        id: row.get_str("id").unwrap_or_default().to_string(),
        repo_id: row.get_str("repo_id").unwrap_or_default().to_string(),
        agent_id: row.get_str("agent_id").unwrap_or_default().to_string(),
        branch: row.get_str("branch").unwrap_or_default().to_string(),
        base_branch: row.get_str("base_branch").unwrap_or_default().to_string(),
        parent_stream_id: row.get_str("parent_stream_id").map(|s| s.to_string()),
        task_id: row.get_str("task_id").map(|s| s.to_string()),
        status: parse_status(row.get_str("status").unwrap_or("active")),
        review_status: parse_review_status(row.get_str("review_status").unwrap_or("pending")),
        source: parse_source(row.get_str("source").unwrap_or("cli")),
        metadata: row
            .get_str("metadata")
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(json!({})),
    }
}

fn parse_status(s: &str) -> StreamStatus {
    match s {
        "in_review" => StreamStatus::InReview,
        "merged" => StreamStatus::Merged,
        "abandoned" => StreamStatus::Abandoned,
        "conflicted" => StreamStatus::Conflicted,
        _ => StreamStatus::Active,
    }
}
fn status_str(s: StreamStatus) -> &'static str {
    match s {
        StreamStatus::Active => "active",
        StreamStatus::InReview => "in_review",
        StreamStatus::Merged => "merged",
        StreamStatus::Abandoned => "abandoned",
        StreamStatus::Conflicted => "conflicted",
    }
}
fn parse_review_status(s: &str) -> ReviewStatus {
    match s {
        "approved" => ReviewStatus::Approved,
        "changes_requested" => ReviewStatus::ChangesRequested,
        _ => ReviewStatus::Pending,
    }
}
fn review_status_str(s: ReviewStatus) -> &'static str {
    match s {
        ReviewStatus::Pending => "pending",
        ReviewStatus::Approved => "approved",
        ReviewStatus::ChangesRequested => "changes_requested",
    }
}
fn parse_source(s: &str) -> StreamSource {
    match s {
        "api" => StreamSource::Api,
        "external_pr" => StreamSource::ExternalPr,
        _ => StreamSource::Cli,
    }
}
fn source_str(s: StreamSource) -> &'static str {
    match s {
        StreamSource::Cli => "cli",
        StreamSource::Api => "api",
        StreamSource::ExternalPr => "external_pr",
    }
}
fn verdict_str(v: Verdict) -> &'static str {
    match v {
        Verdict::Approve => "approve",
        Verdict::RequestChanges => "request_changes",
        Verdict::Comment => "comment",
    }
}
fn parse_verdict(s: &str) -> Verdict {
    match s {
        "request_changes" => Verdict::RequestChanges,
        "comment" => Verdict::Comment,
        _ => Verdict::Approve,
    }
}

/// Load one stream row. Used by `merge`/`consensus` callers as well as the
/// manager itself.
pub async fn load(store: &dyn Store, id: &str) -> StreamResult<Stream> {
    crate::store::validate_ids([id])?;
    let rows = store
        .exec("SELECT * FROM {{streams}} WHERE id = ?", &[Param::Text(id.into())])
        .await?;
    rows.first()
        .map(row_to_stream)
        .ok_or_else(|| StreamError::NotFound(id.to_string()))
}

/// Apply a state-machine transition, recording it, under the caller's
/// transaction (or directly if the caller passes the plain store). spec §5:
/// one advisory lock per stream for state-machine transitions — modeled
/// here as a serialized transaction over the single stream row, which on
/// the embedded single-writer backend and the `SERIALIZABLE` networked
/// backend both provide the needed mutual exclusion.
pub async fn set_status(
    store: &dyn Store,
    id: &str,
    to: StreamStatus,
) -> StreamResult<()> {
    let current = load(store, id).await?;
    if !state_machine::is_legal_transition(current.status, to) {
        return Err(StreamError::IllegalTransition {
            from: current.status,
            to,
        });
    }
    store
        .exec(
            "UPDATE {{streams}} SET status = ? WHERE id = ?",
            &[Param::Text(status_str(to).into()), Param::Text(id.into())],
        )
        .await?;
    Ok(())
}

/// Reset `review_status` to `pending` and drop prior reviews. Open-question
/// decision #1 (DESIGN.md): a new commit to an in-review stream invalidates
/// prior reviews rather than preserving them.
pub async fn reset_reviews_to_pending(store: &dyn Store, stream_id: &str) -> StreamResult<()> {
    store
        .exec(
            "UPDATE {{streams}} SET review_status = 'pending' WHERE id = ?",
            &[Param::Text(stream_id.into())],
        )
        .await?;
    store
        .exec(
            "DELETE FROM {{stream_reviews}} WHERE stream_id = ?",
            &[Param::Text(stream_id.into())],
        )
        .await?;
    Ok(())
}

pub async fn list_reviews(store: &dyn Store, stream_id: &str) -> StreamResult<Vec<Review>> {
    let rows = store
        .exec(
            "SELECT * FROM {{stream_reviews}} WHERE stream_id = ?",
            &[Param::Text(stream_id.into())],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| Review {
            id: row.get_str("id").unwrap_or_default().to_string(),
            stream_id: row.get_str("stream_id").unwrap_or_default().to_string(),
            reviewer_id: row.get_str("reviewer_id").unwrap_or_default().to_string(),
            verdict: parse_verdict(row.get_str("verdict").unwrap_or("approve")),
            is_human: row.get_bool("is_human").unwrap_or(false),
            tested: row.get_bool("tested").unwrap_or(false),
            reviewed_at: row
                .get_timestamp("reviewed_at")
                .unwrap_or_else(Utc::now),
        })
        .collect())
}

/// Outcome of [`StreamManager::request_merge`]: either queued on this
/// engine's local merge queue, or deferred to a server authority that
/// couldn't be reached right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRequestOutcome {
    Enqueued,
    QueuedForServer,
}

pub struct CreateWorkspaceRequest {
    pub repo: Repo,
    pub agent_id: String,
    pub agent_level: AccessLevel,
    pub base_branch: String,
    pub depends_on: Option<String>,
    pub task_id: Option<String>,
}

pub struct StreamManager {
    store: Arc<dyn Store>,
    mechanics: Arc<dyn GitMechanicsProvider>,
    sync: Arc<SyncEngine>,
    merge: Arc<MergeCoordinator>,
}

impl StreamManager {
    pub fn new(
        store: Arc<dyn Store>,
        mechanics: Arc<dyn GitMechanicsProvider>,
        sync: Arc<SyncEngine>,
        merge: Arc<MergeCoordinator>,
    ) -> Self {
        Self {
            store,
            mechanics,
            sync,
            merge,
        }
    }

    /// `create_workspace({agent, task?, depends_on?})` (spec §4.6).
    pub async fn create_workspace(&self, req: CreateWorkspaceRequest) -> StreamResult<Stream> {
        if !identity::can_perform(req.agent_level, Action::Write) {
            return Err(StreamError::Forbidden {
                reason: "repo_access_mode".into(),
            });
        }

        let mechanics_id = self
            .mechanics
            .create_stream(&req.repo.id, &req.base_branch, req.depends_on.as_deref())
            .await?;

        let stream = Stream {
            id: mechanics_id,
            repo_id: req.repo.id.clone(),
            agent_id: req.agent_id.clone(),
            branch: format!("stream/{}", ids::generate()),
            base_branch: req.base_branch,
            parent_stream_id: req.depends_on,
            task_id: req.task_id.clone(),
            status: StreamStatus::Active,
            review_status: ReviewStatus::Pending,
            source: StreamSource::Cli,
            metadata: json!({}),
        };

        self.store
            .exec(
                "INSERT INTO {{streams}} (id, repo_id, agent_id, branch, base_branch, parent_stream_id, task_id, status, review_status, source, metadata) VALUES (?,?,?,?,?,?,?,?,?,?,?)",
                &[
                    Param::Text(stream.id.clone()),
                    Param::Text(stream.repo_id.clone()),
                    Param::Text(stream.agent_id.clone()),
                    Param::Text(stream.branch.clone()),
                    Param::Text(stream.base_branch.clone()),
                    stream.parent_stream_id.clone().into(),
                    stream.task_id.clone().into(),
                    Param::Text(status_str(stream.status).into()),
                    Param::Text(review_status_str(stream.review_status).into()),
                    Param::Text(source_str(stream.source).into()),
                    Param::Text(stream.metadata.to_string()),
                ],
            )
            .await?;

        if let Some(task_id) = &req.task_id {
            self.store
                .exec(
                    "UPDATE {{task_claims}} SET stream_id = ? WHERE task_id = ? AND agent_id = ?",
                    &[
                        Param::Text(stream.id.clone()),
                        Param::Text(task_id.clone()),
                        Param::Text(req.agent_id.clone()),
                    ],
                )
                .await?;
        }

        self.sync
            .record_event(&req.repo.id, SyncEventPayload::StreamCreated {
                stream_id: stream.id.clone(),
            })
            .await?;

        Ok(stream)
    }

    /// `commit({agent, stream, message})` (spec §4.6).
    pub async fn commit(
        &self,
        repo: &Repo,
        stream_id: &str,
        worktree: &str,
        message: &str,
        agent_id: &str,
    ) -> StreamResult<()> {
        let stream = load(&*self.store, stream_id).await?;
        self.mechanics
            .commit(stream_id, worktree, message, agent_id)
            .await?;

        if stream.status == StreamStatus::InReview {
            reset_reviews_to_pending(&*self.store, stream_id).await?;
            set_status(&*self.store, stream_id, StreamStatus::Active).await?;
        }

        self.sync
            .record_event(
                &repo.id,
                SyncEventPayload::Commit {
                    stream_id: stream_id.to_string(),
                    message: message.to_string(),
                },
            )
            .await?;

        if repo.merge_mode == MergeMode::Swarm {
            self.merge.auto_merge_swarm(repo, stream_id).await?;
        }

        Ok(())
    }

    /// `submit_for_review(stream)` (spec §4.6): requires `status=active`.
    pub async fn submit_for_review(&self, stream_id: &str) -> StreamResult<()> {
        let stream = load(&*self.store, stream_id).await?;
        if stream.status != StreamStatus::Active {
            return Err(StreamError::IllegalTransition {
                from: stream.status,
                to: StreamStatus::InReview,
            });
        }
        set_status(&*self.store, stream_id, StreamStatus::InReview).await?;
        Ok(())
    }

    /// `submit_review(stream, reviewer, verdict, feedback, is_human)` (spec
    /// §4.6): upsert keyed by `(stream, reviewer)`.
    pub async fn submit_review(
        &self,
        repo: &Repo,
        stream_id: &str,
        reviewer_id: &str,
        verdict: Verdict,
        is_human: bool,
        tested: bool,
    ) -> StreamResult<()> {
        crate::store::validate_ids([stream_id, reviewer_id])?;
        let existing = self
            .store
            .exec(
                "SELECT id FROM {{stream_reviews}} WHERE stream_id = ? AND reviewer_id = ?",
                &[Param::Text(stream_id.into()), Param::Text(reviewer_id.into())],
            )
            .await?;
        let now = Utc::now();
        if let Some(row) = existing.first() {
            let id = row.get_str("id").unwrap_or_default().to_string();
            self.store
                .exec(
                    "UPDATE {{stream_reviews}} SET verdict = ?, is_human = ?, tested = ?, reviewed_at = ? WHERE id = ?",
                    &[
                        Param::Text(verdict_str(verdict).into()),
                        Param::Bool(is_human),
                        Param::Bool(tested),
                        Param::Timestamp(now),
                        Param::Text(id),
                    ],
                )
                .await?;
        } else {
            self.store
                .exec(
                    "INSERT INTO {{stream_reviews}} (id, stream_id, reviewer_id, verdict, is_human, tested, reviewed_at) VALUES (?,?,?,?,?,?,?)",
                    &[
                        Param::Text(ids::generate()),
                        Param::Text(stream_id.into()),
                        Param::Text(reviewer_id.into()),
                        Param::Text(verdict_str(verdict).into()),
                        Param::Bool(is_human),
                        Param::Bool(tested),
                        Param::Timestamp(now),
                    ],
                )
                .await?;
        }

        self.sync
            .record_event(
                &repo.id,
                SyncEventPayload::Review {
                    stream_id: stream_id.to_string(),
                    reviewer_id: reviewer_id.to_string(),
                    verdict: verdict_str(verdict).to_string(),
                },
            )
            .await?;

        let review_status = match verdict {
            Verdict::Approve => ReviewStatus::Approved,
            Verdict::RequestChanges => ReviewStatus::ChangesRequested,
            Verdict::Comment => return Ok(()),
        };
        self.store
            .exec(
                "UPDATE {{streams}} SET review_status = ? WHERE id = ?",
                &[
                    Param::Text(review_status_str(review_status).into()),
                    Param::Text(stream_id.into()),
                ],
            )
            .await?;

        self.recheck_consensus(repo, stream_id).await?;

        Ok(())
    }

    async fn maintainer_grants(&self, repo_id: &str) -> StreamResult<Vec<MaintainerGrant>> {
        let rows = self
            .store
            .exec(
                "SELECT * FROM {{maintainer_grants}} WHERE repo_id = ?",
                &[Param::Text(repo_id.to_string())],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| MaintainerGrant {
                repo_id: row.get_str("repo_id").unwrap_or_default().to_string(),
                agent_id: row.get_str("agent_id").unwrap_or_default().to_string(),
                role: match row.get_str("role") {
                    Some("owner") => MaintainerRole::Owner,
                    _ => MaintainerRole::Maintainer,
                },
            })
            .collect())
    }

    async fn karma_of(&self, agent_id: &str) -> StreamResult<f64> {
        let rows = self
            .store
            .exec(
                "SELECT karma FROM {{agents}} WHERE id = ?",
                &[Param::Text(agent_id.to_string())],
            )
            .await?;
        Ok(rows.first().and_then(|r| r.get_f64("karma")).unwrap_or(0.0))
    }

    /// After recording a review, re-check consensus for non-swarm repos
    /// (spec §4.4/§4.7.1/§4.8.3). A `server`-authoritative repo routes
    /// through the sync engine, which drains pending events and queries the
    /// server rather than deciding locally; a review that hasn't synced
    /// yet or a server that can't be reached never falls back to local
    /// evaluation. On `server_unavailable` the request is queued instead of
    /// dropped (spec §9: "server-authoritative repos MUST queue, not fall
    /// back, on partition").
    async fn recheck_consensus(&self, repo: &Repo, stream_id: &str) -> StreamResult<()> {
        if repo.merge_mode == MergeMode::Swarm {
            return Ok(());
        }
        if repo.consensus_authority == ConsensusAuthority::Server {
            let result = self.sync.consensus_via_server(repo, stream_id).await;
            if result.reached {
                self.merge.enqueue_for_merge(repo, stream_id).await?;
            } else if result.reason == consensus::ConsensusReason::ServerUnavailable {
                self.sync
                    .record_event(
                        &repo.id,
                        SyncEventPayload::MergeRequested { stream_id: stream_id.to_string() },
                    )
                    .await
                    .ok();
            }
            return Ok(());
        }
        let reviews = list_reviews(&*self.store, stream_id).await?;
        let grants = self.maintainer_grants(&repo.id).await?;
        let mut karma = std::collections::HashMap::new();
        for r in &reviews {
            let k = self.karma_of(&r.reviewer_id).await?;
            karma.insert(r.reviewer_id.clone(), k);
        }
        let result = consensus::evaluate(repo, &reviews, &grants, |id| *karma.get(id).unwrap_or(&0.0), false);
        if result.reached {
            self.merge.enqueue_for_merge(repo, stream_id).await?;
        }
        Ok(())
    }

    /// `request_merge(stream, agent)` (spec §4.7.1 gated mode): an explicit
    /// maintainer-initiated merge request, distinct from review mode's
    /// automatic consensus-triggered enqueue. Requires `maintain`/`admin`
    /// access, and any `request_changes` review from a maintainer must
    /// already have been superseded (the review table is upserted per
    /// reviewer, so a lingering `request_changes` row from a maintainer
    /// means it never was). A server-authoritative repo with an unreachable
    /// server queues the request rather than falling back to local
    /// consensus.
    pub async fn request_merge(
        &self,
        repo: &Repo,
        stream_id: &str,
        agent_level: AccessLevel,
    ) -> StreamResult<MergeRequestOutcome> {
        if agent_level < AccessLevel::Maintain {
            return Err(StreamError::Forbidden {
                reason: "gated_merge_requires_maintainer".into(),
            });
        }

        let reviews = list_reviews(&*self.store, stream_id).await?;
        let grants = self.maintainer_grants(&repo.id).await?;
        let unresolved_rejection = reviews.iter().any(|r| {
            r.verdict == Verdict::RequestChanges
                && grants.iter().any(|g| g.agent_id == r.reviewer_id)
        });
        if unresolved_rejection {
            return Err(StreamError::Forbidden {
                reason: "maintainer_requested_changes".into(),
            });
        }

        if repo.consensus_authority == ConsensusAuthority::Server
            && !self.sync.server_reachable().await
        {
            self.sync
                .record_event(
                    &repo.id,
                    SyncEventPayload::MergeRequested { stream_id: stream_id.to_string() },
                )
                .await?;
            return Ok(MergeRequestOutcome::QueuedForServer);
        }

        self.merge.enqueue_for_merge(repo, stream_id).await?;
        Ok(MergeRequestOutcome::Enqueued)
    }

    /// `abandon(stream, reason)` (spec §4.6): terminal.
    pub async fn abandon(&self, repo: &Repo, stream_id: &str, reason: &str) -> StreamResult<()> {
        set_status(&*self.store, stream_id, StreamStatus::Abandoned).await?;
        self.sync
            .record_event(
                &repo.id,
                SyncEventPayload::StreamAbandoned {
                    stream_id: stream_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}
