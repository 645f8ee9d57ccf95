//! Merge coordinator (spec §4.7): mode-dispatched merge, a DAG-aware merge
//! queue, conflict routing, stabilization, promotion, and Tier-1 plugin
//! dispatch. Grounded on the escalation/dispatch shape of
//! `coordination/src/escalation/engine.rs` (a typed outcome enum driving a
//! small state machine) and the priority-queue-with-tie-break idiom of
//! `coordination/src/ensemble/voting.rs`.

pub mod plugin;
pub mod stabilize;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::domain::{MergeMode, Repo, Stream, StreamStatus};
use crate::error::ErrorKind;
use crate::git_mechanics::{GitMechanicsProvider, MergeOutcome};
use crate::ids;
use crate::store::{Param, Store};
use crate::stream;
use crate::sync::{SyncEngine, SyncEventPayload};

pub use plugin::{Plugin, PluginRegistry};
pub use stabilize::{CommandRunner, StabilizationOutcome, StabilizationRunner};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Mechanics(#[from] crate::git_mechanics::MechanicsError),
    #[error(transparent)]
    Stream(#[from] Box<crate::stream::StreamError>),
    #[error("merge queue has a dependency cycle among streams {0:?}")]
    CyclicDependency(Vec<String>),
    #[error("stream {0} is conflicted and must be resolved before it can merge")]
    Conflicted(String),
}

impl From<crate::stream::StreamError> for MergeError {
    fn from(e: crate::stream::StreamError) -> Self {
        MergeError::Stream(Box::new(e))
    }
}

impl MergeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Mechanics(e) => e.kind(),
            Self::Stream(e) => e.kind(),
            Self::CyclicDependency(_) => ErrorKind::InvalidInput,
            Self::Conflicted(_) => ErrorKind::Conflict,
        }
    }
}

pub type MergeResult<T> = Result<T, MergeError>;

pub struct MergeCoordinator {
    store: Arc<dyn Store>,
    mechanics: Arc<dyn GitMechanicsProvider>,
    sync: Arc<SyncEngine>,
    plugins: PluginRegistry,
}

impl MergeCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        mechanics: Arc<dyn GitMechanicsProvider>,
        sync: Arc<SyncEngine>,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            store,
            mechanics,
            sync,
            plugins,
        }
    }

    /// swarm mode (spec §4.7.1): merge immediately on commit, no queueing.
    pub async fn auto_merge_swarm(&self, repo: &Repo, stream_id: &str) -> MergeResult<()> {
        debug_assert_eq!(repo.merge_mode, MergeMode::Swarm);
        self.merge_one(repo, stream_id).await
    }

    /// review/gated mode (spec §4.7.1): called once `consensus::evaluate`
    /// reports `reached`. Enqueues rather than merging inline so the
    /// priority queue can order concurrently-ready streams.
    pub async fn enqueue_for_merge(&self, repo: &Repo, stream_id: &str) -> MergeResult<()> {
        let stream = stream::load(&*self.store, stream_id).await?;
        let rank = self.priority_rank(&stream).await?;
        let seq = Utc::now().timestamp_micros();
        self.store
            .exec(
                "INSERT INTO {{merge_queue}} (stream_id, repo_id, priority_rank, consensus_timestamp, enqueue_seq) VALUES (?,?,?,?,?)",
                &[
                    Param::Text(stream_id.to_string()),
                    Param::Text(repo.id.clone()),
                    Param::Int(rank),
                    Param::Timestamp(Utc::now()),
                    Param::Int(seq),
                ],
            )
            .await?;
        self.sync
            .record_event(&repo.id, SyncEventPayload::MergeRequested { stream_id: stream_id.to_string() })
            .await
            .ok();
        Ok(())
    }

    /// `priority_rank` (spec §4.7.2): `critical=0, high=25, medium=50,
    /// low=75`, taken from the stream's linked task. A stream with no task,
    /// or whose task row has gone missing, ranks `medium`. A council
    /// override simply means a task's `priority` column holds a
    /// non-banded integer — this method doesn't care which, it just reads
    /// the column.
    async fn priority_rank(&self, stream: &Stream) -> MergeResult<i64> {
        let Some(task_id) = &stream.task_id else {
            return Ok(crate::domain::task_priority::MEDIUM);
        };
        let rows = self
            .store
            .exec(
                "SELECT priority FROM {{tasks}} WHERE id = ?",
                &[Param::Text(task_id.clone())],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get_i64("priority"))
            .unwrap_or(crate::domain::task_priority::MEDIUM))
    }

    /// Pop the next-ranked, DAG-eligible stream for `repo` and merge it,
    /// cascading onto dependents. Ranked by spec §4.7.2's composite key
    /// `(priority_rank ASC, consensus_timestamp ASC, enqueue_seq ASC)`; a
    /// stream whose DAG ancestor hasn't merged or been abandoned yet is
    /// skipped in favor of the next-ranked eligible one rather than
    /// blocking the whole queue behind it. Returns `Ok(None)` when nothing
    /// in the queue is eligible.
    pub async fn process_next(&self, repo: &Repo) -> MergeResult<Option<String>> {
        let rows = self
            .store
            .exec(
                "SELECT stream_id FROM {{merge_queue}} WHERE repo_id = ? ORDER BY priority_rank ASC, consensus_timestamp ASC, enqueue_seq ASC",
                &[Param::Text(repo.id.clone())],
            )
            .await?;
        for row in &rows {
            let stream_id = row.get_str("stream_id").unwrap_or_default().to_string();
            if !self.ancestors_settled(&stream_id).await? {
                continue;
            }
            self.store
                .exec(
                    "DELETE FROM {{merge_queue}} WHERE stream_id = ?",
                    &[Param::Text(stream_id.clone())],
                )
                .await?;
            self.merge_one(repo, &stream_id).await?;
            return Ok(Some(stream_id));
        }
        Ok(None)
    }

    /// Walks `parent_stream_id` up from `stream_id` (spec §4.7.2: "verify
    /// every DAG ancestor is already merged or abandoned"). A stream's
    /// parent always already exists when the stream is created
    /// (`depends_on` names an existing stream), so a cycle can only come
    /// from a corrupted/hand-edited store — guarded against rather than
    /// assumed away.
    async fn ancestors_settled(&self, stream_id: &str) -> MergeResult<bool> {
        let mut seen = HashSet::new();
        seen.insert(stream_id.to_string());
        let mut current = stream::load(&*self.store, stream_id).await?;
        while let Some(parent_id) = current.parent_stream_id.clone() {
            if !seen.insert(parent_id.clone()) {
                return Err(MergeError::CyclicDependency(vec![parent_id]));
            }
            let parent = stream::load(&*self.store, &parent_id).await?;
            if !matches!(parent.status, StreamStatus::Merged | StreamStatus::Abandoned) {
                return Ok(false);
            }
            current = parent;
        }
        Ok(true)
    }

    async fn merge_one(&self, repo: &Repo, stream_id: &str) -> MergeResult<()> {
        let s: Stream = stream::load(&*self.store, stream_id).await?;
        if s.status == StreamStatus::Conflicted {
            return Err(MergeError::Conflicted(stream_id.to_string()));
        }

        match self.mechanics.merge_stream(stream_id, &repo.buffer_branch).await? {
            MergeOutcome::Merged { commit_hash } => {
                stream::set_status(&*self.store, stream_id, StreamStatus::Merged).await?;
                self.sync
                    .record_event(
                        &repo.id,
                        SyncEventPayload::MergeCompleted {
                            stream_id: stream_id.to_string(),
                            commit_hash,
                        },
                    )
                    .await
                    .ok();
                self.plugins.dispatch_merge_completed(&repo.id, stream_id).await;
                self.cascade_dependents(repo, stream_id).await?;
                Ok(())
            }
            MergeOutcome::Conflict(info) => {
                stream::set_status(&*self.store, stream_id, StreamStatus::Conflicted).await?;
                self.store
                    .exec(
                        "INSERT INTO {{stream_conflicts}} (stream_id, files, src, tgt, status) VALUES (?,?,?,?,'pending')",
                        &[
                            Param::Text(stream_id.to_string()),
                            Param::Text(serde_json::to_string(&info.files).unwrap_or_default()),
                            Param::Text(info.src),
                            Param::Text(info.tgt),
                        ],
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// After a successful merge, rebase any stream whose `parent_stream_id`
    /// was the merged stream onto its new base (spec §4.7.1: "dependents
    /// cascade automatically").
    async fn cascade_dependents(&self, repo: &Repo, merged_stream_id: &str) -> MergeResult<()> {
        let rows = self
            .store
            .exec(
                "SELECT id FROM {{streams}} WHERE repo_id = ? AND parent_stream_id = ? AND status = 'active'",
                &[Param::Text(repo.id.clone()), Param::Text(merged_stream_id.to_string())],
            )
            .await?;
        let dependents: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get_str("id").map(str::to_string))
            .collect();
        if dependents.is_empty() {
            return Ok(());
        }
        for outcome in self.mechanics.cascade_rebase(&dependents).await? {
            match outcome {
                crate::git_mechanics::CascadeOutcome::Rebased { .. } => {}
                crate::git_mechanics::CascadeOutcome::Conflict { stream_id, info } => {
                    stream::set_status(&*self.store, &stream_id, StreamStatus::Conflicted).await?;
                    self.store
                        .exec(
                            "INSERT INTO {{stream_conflicts}} (stream_id, files, src, tgt, status) VALUES (?,?,?,?,'pending')",
                            &[
                                Param::Text(stream_id),
                                Param::Text(serde_json::to_string(&info.files).unwrap_or_default()),
                                Param::Text(info.src),
                                Param::Text(info.tgt),
                            ],
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// After a red stabilization is reverted, rebase every other active
    /// stream in the repo onto the reverted buffer (spec §4.7.4 step 6:
    /// "cascade-rebase remaining active streams onto reverted buffer") —
    /// broader than [`Self::cascade_dependents`], which only follows one
    /// merged stream's direct children.
    async fn cascade_all_active(&self, repo: &Repo, exclude: Option<&str>) -> MergeResult<()> {
        let rows = self
            .store
            .exec(
                "SELECT id FROM {{streams}} WHERE repo_id = ? AND status = 'active'",
                &[Param::Text(repo.id.clone())],
            )
            .await?;
        let targets: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get_str("id").map(str::to_string))
            .filter(|id| Some(id.as_str()) != exclude)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        for outcome in self.mechanics.cascade_rebase(&targets).await? {
            if let crate::git_mechanics::CascadeOutcome::Conflict { stream_id, info } = outcome {
                stream::set_status(&*self.store, &stream_id, StreamStatus::Conflicted).await?;
                self.store
                    .exec(
                        "INSERT INTO {{stream_conflicts}} (stream_id, files, src, tgt, status) VALUES (?,?,?,?,'pending')",
                        &[
                            Param::Text(stream_id),
                            Param::Text(serde_json::to_string(&info.files).unwrap_or_default()),
                            Param::Text(info.src),
                            Param::Text(info.tgt),
                        ],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Create a critical-priority fixup task assigned to the agent whose
    /// stream introduced a confirmed-red break (spec §4.7.4 step 6).
    async fn create_fixup_task(&self, repo: &Repo, breaking_stream_id: &str) -> MergeResult<()> {
        let breaking = stream::load(&*self.store, breaking_stream_id).await?;
        let task_id = ids::generate();
        self.store
            .exec(
                "INSERT INTO {{tasks}} (id, repo_id, title, description, priority) VALUES (?,?,?,?,?)",
                &[
                    Param::Text(task_id.clone()),
                    Param::Text(repo.id.clone()),
                    Param::Text(format!("fix buffer break introduced by stream {breaking_stream_id}")),
                    Param::Text(format!(
                        "stabilization bisected stream {breaking_stream_id} as the first red operation"
                    )),
                    Param::Int(crate::domain::task_priority::CRITICAL),
                ],
            )
            .await?;
        self.store
            .exec(
                "INSERT INTO {{task_claims}} (id, task_id, agent_id, stream_id, status) VALUES (?,?,?,NULL,'active')",
                &[
                    Param::Text(ids::generate()),
                    Param::Text(task_id),
                    Param::Text(breaking.agent_id.clone()),
                ],
            )
            .await?;
        Ok(())
    }

    /// `stabilize(repo)` (spec §4.7.4): run `repo.stabilize_command`
    /// against the buffer, classify, and on a confirmed `red` bisect to the
    /// breaking stream and (if `auto_revert_on_red`) roll the buffer back
    /// to the last good operation.
    pub async fn stabilize(
        &self,
        repo: &Repo,
        runner: &dyn StabilizationRunner,
    ) -> MergeResult<StabilizationOutcome> {
        let outcome = stabilize::run_with_flake_detection(runner, &repo.id, &repo.buffer_branch).await;

        let (result, breaking_stream_id) = match outcome {
            StabilizationOutcome::Green => (crate::domain::StabilizationResult::Green, None),
            StabilizationOutcome::Timeout => (crate::domain::StabilizationResult::Timeout, None),
            StabilizationOutcome::Flaky => (crate::domain::StabilizationResult::Flaky, None),
            StabilizationOutcome::Red => {
                // `bisect_breaking_stream` already leaves the buffer rolled back
                // to the last-good operation (or the original tag, if the very
                // first operation since it was already red) as part of the search.
                let (breaking, _last_good_op) = self.bisect_breaking_stream(repo, runner).await?;
                if repo.auto_revert_on_red {
                    if let Some(bad) = &breaking {
                        // The breaking stream is already `merged` (terminal) by
                        // the time its operation is in the buffer's history for
                        // bisection to find, so there is no status transition to
                        // make here — the fixup task is the record that it broke
                        // the buffer.
                        self.create_fixup_task(repo, bad).await?;
                    }
                    self.cascade_all_active(repo, breaking.as_deref()).await?;
                }
                (crate::domain::StabilizationResult::Red, breaking)
            }
        };

        let tag = if result == crate::domain::StabilizationResult::Green {
            Some(format!("green/{}", Utc::now().timestamp_micros()))
        } else {
            None
        };
        self.store
            .exec(
                "INSERT INTO {{stabilizations}} (repo_id, result, buffer_commit, tag, breaking_stream_id, details, stabilized_at) VALUES (?,?,?,?,?,?,?)",
                &[
                    Param::Text(repo.id.clone()),
                    Param::Text(format!("{result:?}").to_lowercase()),
                    Param::Text(repo.buffer_branch.clone()),
                    tag.clone().into(),
                    breaking_stream_id.clone().into(),
                    Param::Text(String::new()),
                    Param::Timestamp(Utc::now()),
                ],
            )
            .await?;

        self.sync
            .record_event(
                &repo.id,
                SyncEventPayload::Stabilization {
                    repo_id: repo.id.clone(),
                    result: format!("{result:?}").to_lowercase(),
                },
            )
            .await
            .ok();
        self.plugins.dispatch_stabilization(&repo.id, result).await;

        if result == crate::domain::StabilizationResult::Green && repo.auto_promote_on_green {
            self.promote(repo).await?;
        }

        Ok(outcome)
    }

    /// Binary search over operations since the last stabilization tag for
    /// the first one that turns the buffer red (spec §4.7.4 step 6).
    /// Returns `(breaking_stream_id, last_good_op_id)` and leaves the buffer
    /// rolled back to the last-good operation's snapshot — the probes in
    /// between may land on either side of the break, so the final state is
    /// set explicitly rather than relying on wherever the last probe left
    /// it.
    async fn bisect_breaking_stream(
        &self,
        repo: &Repo,
        runner: &dyn StabilizationRunner,
    ) -> MergeResult<(Option<String>, Option<String>)> {
        let ops = self.mechanics.operations_since(&repo.buffer_branch).await?;
        let candidates: Vec<_> = ops.into_iter().filter(|op| op.stream_id.is_some()).collect();
        if candidates.is_empty() {
            return Ok((None, None));
        }
        let mut lo = 0usize;
        let mut hi = candidates.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.mechanics.rollback_to_operation(&candidates[mid].op_id).await?;
            match runner.run(&repo.id, &repo.buffer_branch).await {
                StabilizationOutcome::Green => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let breaking = candidates.get(lo).and_then(|op| op.stream_id.clone());
        let last_good_op = if lo == 0 {
            None
        } else {
            Some(candidates[lo - 1].op_id.clone())
        };
        if let Some(op) = &last_good_op {
            self.mechanics.rollback_to_operation(op).await?;
        }
        Ok((breaking, last_good_op))
    }

    /// `promote(repo)` (spec §4.7.5): fast-forward-only, gated on the most
    /// recent stabilization being `green`. The mechanics provider has no
    /// tag-creation primitive (spec §4.5's table is exhaustive), so the
    /// `green/*` tag recorded alongside the stabilization row in
    /// `stabilizations.tag` is an audit label for the buffer commit that
    /// passed, not a distinct ref promote fast-forwards from — the buffer
    /// commit at that stabilization *is* what the tag names.
    pub async fn promote(&self, repo: &Repo) -> MergeResult<bool> {
        let rows = self
            .store
            .exec(
                "SELECT result FROM {{stabilizations}} WHERE repo_id = ? ORDER BY stabilized_at DESC LIMIT 1",
                &[Param::Text(repo.id.clone())],
            )
            .await?;
        let Some(row) = rows.first() else { return Ok(false) };
        if row.get_str("result") != Some("green") {
            return Ok(false);
        }

        match self
            .mechanics
            .merge_stream(&repo.buffer_branch, &repo.promote_target)
            .await?
        {
            MergeOutcome::Merged { commit_hash } => {
                self.sync
                    .record_event(
                        &repo.id,
                        SyncEventPayload::Promotion {
                            repo_id: repo.id.clone(),
                            commit_hash,
                        },
                    )
                    .await
                    .ok();
                self.plugins.dispatch_promotion(&repo.id).await;
                Ok(true)
            }
            MergeOutcome::Conflict(_) => Ok(false),
        }
    }

    pub async fn pending_count(&self, repo_id: &str) -> MergeResult<i64> {
        let rows = self
            .store
            .exec(
                "SELECT COUNT(*) AS n FROM {{merge_queue}} WHERE repo_id = ?",
                &[Param::Text(repo_id.to_string())],
            )
            .await?;
        Ok(rows.first().and_then(|r| r.get_i64("n")).unwrap_or(0))
    }

    pub fn new_generated_id() -> String {
        ids::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentAccess, ConsensusAuthority, OwnershipModel, RepoStage};
    use crate::git_mechanics::fake::FakeMechanics;
    use crate::store::sqlite::SqliteStore;
    use crate::stream::{CreateWorkspaceRequest, StreamManager};

    fn repo(mode: MergeMode) -> Repo {
        Repo {
            id: "r".into(),
            name: "r".into(),
            merge_mode: mode,
            ownership_model: OwnershipModel::Solo,
            consensus_threshold: 0.5,
            min_reviews: 1,
            human_review_weight: 1.0,
            agent_access: AgentAccess::Public,
            min_karma: 0.0,
            buffer_branch: "buffer".into(),
            promote_target: "main".into(),
            auto_promote_on_green: false,
            auto_revert_on_red: true,
            stabilize_command: String::new(),
            stage: RepoStage::Seed,
            consensus_authority: ConsensusAuthority::Local,
        }
    }

    #[tokio::test]
    async fn swarm_commit_merges_immediately_and_updates_status() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mechanics: Arc<dyn GitMechanicsProvider> = Arc::new(FakeMechanics::new());
        let sync = Arc::new(SyncEngine::new(store.clone(), None));
        let merge = Arc::new(MergeCoordinator::new(
            store.clone(),
            mechanics.clone(),
            sync.clone(),
            PluginRegistry::default(),
        ));
        let manager = StreamManager::new(store.clone(), mechanics.clone(), sync.clone(), merge.clone());
        let repo = repo(MergeMode::Swarm);

        let s = manager
            .create_workspace(CreateWorkspaceRequest {
                repo: repo.clone(),
                agent_id: ids::generate(),
                agent_level: crate::domain::AccessLevel::Write,
                base_branch: "main".into(),
                depends_on: None,
                task_id: None,
            })
            .await
            .unwrap();

        manager
            .commit(&repo, &s.id, "wt", "message", &s.agent_id)
            .await
            .unwrap();

        let reloaded = stream::load(&*store, &s.id).await.unwrap();
        assert_eq!(reloaded.status, StreamStatus::Merged);
    }

    #[tokio::test]
    async fn queue_orders_parent_before_dependent() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mechanics: Arc<dyn GitMechanicsProvider> = Arc::new(FakeMechanics::new());
        let sync = Arc::new(SyncEngine::new(store.clone(), None));
        let merge = MergeCoordinator::new(store.clone(), mechanics.clone(), sync.clone(), PluginRegistry::default());
        let repo = repo(MergeMode::Review);
        let manager = StreamManager::new(
            store.clone(),
            mechanics.clone(),
            sync.clone(),
            Arc::new(MergeCoordinator::new(store.clone(), mechanics.clone(), sync.clone(), PluginRegistry::default())),
        );

        let parent = manager
            .create_workspace(CreateWorkspaceRequest {
                repo: repo.clone(),
                agent_id: ids::generate(),
                agent_level: crate::domain::AccessLevel::Write,
                base_branch: "main".into(),
                depends_on: None,
                task_id: None,
            })
            .await
            .unwrap();
        let child = manager
            .create_workspace(CreateWorkspaceRequest {
                repo: repo.clone(),
                agent_id: ids::generate(),
                agent_level: crate::domain::AccessLevel::Write,
                base_branch: "main".into(),
                depends_on: Some(parent.id.clone()),
                task_id: None,
            })
            .await
            .unwrap();

        merge.enqueue_for_merge(&repo, &child.id).await.unwrap();
        merge.enqueue_for_merge(&repo, &parent.id).await.unwrap();

        let first = merge.process_next(&repo).await.unwrap();
        assert_eq!(first, Some(parent.id.clone()));
    }
}
