//! Scenario S5 (spec §8): a gated, server-authoritative repo's merge
//! request is queued rather than decided locally when the server can't be
//! reached, and the local buffer is left untouched.

use std::sync::Arc;

use gitswarm_federation::domain::{
    AccessLevel, AgentAccess, ConsensusAuthority, MergeMode, OwnershipModel, Repo, RepoStage,
};
use gitswarm_federation::git_mechanics::fake::FakeMechanics;
use gitswarm_federation::git_mechanics::GitMechanicsProvider;
use gitswarm_federation::ids;
use gitswarm_federation::merge::{MergeCoordinator, PluginRegistry};
use gitswarm_federation::store::sqlite::SqliteStore;
use gitswarm_federation::store::{Param, Store};
use gitswarm_federation::stream::{CreateWorkspaceRequest, MergeRequestOutcome, StreamManager};
use gitswarm_federation::sync::SyncEngine;

fn gated_server_repo() -> Repo {
    Repo {
        id: "r5".into(),
        name: "gated-repo".into(),
        merge_mode: MergeMode::Gated,
        ownership_model: OwnershipModel::Guild,
        consensus_threshold: 0.66,
        min_reviews: 1,
        human_review_weight: 1.0,
        agent_access: AgentAccess::Public,
        min_karma: 0.0,
        buffer_branch: "buffer".into(),
        promote_target: "main".into(),
        auto_promote_on_green: false,
        auto_revert_on_red: true,
        stabilize_command: String::new(),
        stage: RepoStage::Established,
        consensus_authority: ConsensusAuthority::Server,
    }
}

#[tokio::test]
async fn unreachable_server_queues_merge_request_and_leaves_buffer_untouched() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let fake = Arc::new(FakeMechanics::new());
    let mechanics: Arc<dyn GitMechanicsProvider> = fake.clone();
    // A server URL that nothing is listening on: configured, but
    // unreachable, which is the condition spec §4.7.1 gates on (not "no
    // server configured at all").
    let sync = Arc::new(SyncEngine::new(
        store.clone(),
        Some("http://127.0.0.1:1".to_string()),
    ));
    let merge = Arc::new(MergeCoordinator::new(
        store.clone(),
        mechanics.clone(),
        sync.clone(),
        PluginRegistry::default(),
    ));
    let manager = StreamManager::new(store.clone(), mechanics.clone(), sync.clone(), merge.clone());
    let repo = gated_server_repo();
    let agent_id = ids::generate();

    let stream = manager
        .create_workspace(CreateWorkspaceRequest {
            repo: repo.clone(),
            agent_id: agent_id.clone(),
            agent_level: AccessLevel::Write,
            base_branch: "main".into(),
            depends_on: None,
            task_id: None,
        })
        .await
        .unwrap();
    manager
        .commit(&repo, &stream.id, "/wt", "gated-change", &agent_id)
        .await
        .unwrap();

    let outcome = manager
        .request_merge(&repo, &stream.id, AccessLevel::Maintain)
        .await
        .unwrap();
    assert_eq!(outcome, MergeRequestOutcome::QueuedForServer);

    // A merge_requested event is appended to the sync queue.
    let rows = store
        .exec(
            "SELECT event_type FROM {{sync_events}} WHERE repo_id = ? ORDER BY seq DESC LIMIT 1",
            &[Param::Text(repo.id.clone())],
        )
        .await
        .unwrap();
    assert_eq!(rows.first().and_then(|r| r.get_str("event_type")), Some("merge_requested"));

    // Nothing was popped into the merge queue, and the local buffer still
    // only has whatever commit() itself produced (nothing — gated mode
    // never auto-merges on commit) — the merge request never touched it.
    assert_eq!(merge.pending_count(&repo.id).await.unwrap(), 0);
    assert!(fake.branch_files("buffer").is_empty());
}

#[tokio::test]
async fn non_maintainer_cannot_request_a_gated_merge() {
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
    let mut repo = gated_server_repo();
    repo.consensus_authority = ConsensusAuthority::Local;
    let agent_id = ids::generate();

    let stream = manager
        .create_workspace(CreateWorkspaceRequest {
            repo: repo.clone(),
            agent_id: agent_id.clone(),
            agent_level: AccessLevel::Write,
            base_branch: "main".into(),
            depends_on: None,
            task_id: None,
        })
        .await
        .unwrap();

    let result = manager
        .request_merge(&repo, &stream.id, AccessLevel::Write)
        .await;
    assert!(result.is_err());
}
