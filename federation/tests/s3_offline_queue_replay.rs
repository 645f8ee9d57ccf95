//! Scenario S3 (spec §8): an agent keeps working while the server is
//! unreachable; every policy operation still succeeds locally and queues an
//! append-only sync event in order, and `flush` against an unconfigured
//! server leaves the queue untouched rather than losing events.
//!
//! This exercises the fully local, network-independent half of the
//! scenario (queue ordering, append-only semantics, the local buffer being
//! unaffected by sync state). The wire replay itself — posting a batch to a
//! real server and folding `ReplayOutcome`s back — would need a live or
//! mocked HTTP endpoint, which is out of scope for a backend-driven
//! integration test.

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
use gitswarm_federation::stream::{CreateWorkspaceRequest, StreamManager};
use gitswarm_federation::sync::SyncEngine;

fn swarm_repo() -> Repo {
    Repo {
        id: "r3".into(),
        name: "offline-repo".into(),
        merge_mode: MergeMode::Swarm,
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
async fn agent_keeps_working_offline_and_events_queue_in_order() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mechanics: Arc<dyn GitMechanicsProvider> = Arc::new(FakeMechanics::new());
    // No server_url configured: this is the "offline" condition.
    let sync = Arc::new(SyncEngine::new(store.clone(), None));
    assert!(!sync.is_connected());

    let merge = Arc::new(MergeCoordinator::new(
        store.clone(),
        mechanics.clone(),
        sync.clone(),
        PluginRegistry::default(),
    ));
    let manager = StreamManager::new(store.clone(), mechanics.clone(), sync.clone(), merge.clone());
    let repo = swarm_repo();
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
        .commit(&repo, &stream.id, "/wt", "offline-change", &agent_id)
        .await
        .unwrap();

    // StreamCreated, Commit, MergeCompleted: three events queued in the
    // order the policy operations ran, none of them blocked on the network.
    let rows = store
        .exec(
            "SELECT event_type FROM {{sync_events}} WHERE repo_id = ? ORDER BY seq ASC",
            &[Param::Text(repo.id.clone())],
        )
        .await
        .unwrap();
    let event_types: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get_str("event_type").map(str::to_string))
        .collect();
    assert_eq!(
        event_types,
        vec!["stream_created", "commit", "merge_completed"]
    );

    // Flushing with no server configured must fail loudly, but the queue
    // stays intact for the next attempt rather than being drained.
    let flush_result = sync.flush(&repo.id).await;
    assert!(flush_result.is_err());
    let still_queued = store
        .exec(
            "SELECT COUNT(*) AS n FROM {{sync_events}} WHERE repo_id = ?",
            &[Param::Text(repo.id.clone())],
        )
        .await
        .unwrap();
    assert_eq!(still_queued.first().and_then(|r| r.get_i64("n")), Some(3));
}
