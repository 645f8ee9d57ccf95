//! Scenario S1 (spec §8): in swarm mode, two independent streams each
//! auto-merge on commit — the buffer ends up with both changes and both
//! streams land as `merged`.

use std::sync::Arc;

use gitswarm_federation::domain::{
    AccessLevel, AgentAccess, ConsensusAuthority, MergeMode, OwnershipModel, Repo, RepoStage,
    StreamStatus,
};
use gitswarm_federation::git_mechanics::fake::FakeMechanics;
use gitswarm_federation::git_mechanics::GitMechanicsProvider;
use gitswarm_federation::ids;
use gitswarm_federation::merge::{MergeCoordinator, PluginRegistry};
use gitswarm_federation::store::sqlite::SqliteStore;
use gitswarm_federation::store::Store;
use gitswarm_federation::stream::{self, CreateWorkspaceRequest, StreamManager};
use gitswarm_federation::sync::SyncEngine;

fn swarm_repo() -> Repo {
    Repo {
        id: "r1".into(),
        name: "swarm-repo".into(),
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
async fn two_independent_swarm_commits_both_land_on_buffer() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let fake = Arc::new(FakeMechanics::new());
    let mechanics: Arc<dyn GitMechanicsProvider> = fake.clone();
    let sync = Arc::new(SyncEngine::new(store.clone(), None));
    let merge = Arc::new(MergeCoordinator::new(
        store.clone(),
        mechanics.clone(),
        sync.clone(),
        PluginRegistry::default(),
    ));
    let manager = StreamManager::new(store.clone(), mechanics.clone(), sync.clone(), merge.clone());
    let repo = swarm_repo();
    let alpha = ids::generate();
    let beta = ids::generate();

    let s1 = manager
        .create_workspace(CreateWorkspaceRequest {
            repo: repo.clone(),
            agent_id: alpha.clone(),
            agent_level: AccessLevel::Write,
            base_branch: "main".into(),
            depends_on: None,
            task_id: None,
        })
        .await
        .unwrap();

    let s2 = manager
        .create_workspace(CreateWorkspaceRequest {
            repo: repo.clone(),
            agent_id: beta.clone(),
            agent_level: AccessLevel::Write,
            base_branch: "main".into(),
            depends_on: None,
            task_id: None,
        })
        .await
        .unwrap();

    manager.commit(&repo, &s1.id, "/wt", "a", &alpha).await.unwrap();
    manager.commit(&repo, &s2.id, "/wt", "b", &beta).await.unwrap();

    // Commit in swarm mode auto-merges: both changes reach the buffer HEAD.
    let buffer_files = fake.branch_files(&repo.buffer_branch);
    assert!(buffer_files.contains_key("a.txt"));
    assert!(buffer_files.contains_key("b.txt"));

    let reloaded_s1 = stream::load(&*store, &s1.id).await.unwrap();
    let reloaded_s2 = stream::load(&*store, &s2.id).await.unwrap();
    assert_eq!(reloaded_s1.status, StreamStatus::Merged);
    assert_eq!(reloaded_s2.status, StreamStatus::Merged);
}
