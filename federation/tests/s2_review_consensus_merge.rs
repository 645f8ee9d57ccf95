//! Scenario S2 (spec §8): a guild-owned, review-mode repo only enqueues a
//! stream for merge once a maintainer review pushes consensus over
//! threshold; a non-maintainer's approval alone must not be enough.

use std::sync::Arc;

use gitswarm_federation::domain::{
    AccessLevel, AgentAccess, ConsensusAuthority, MaintainerRole, MergeMode, OwnershipModel, Repo,
    RepoStage, Verdict,
};
use gitswarm_federation::git_mechanics::fake::FakeMechanics;
use gitswarm_federation::git_mechanics::GitMechanicsProvider;
use gitswarm_federation::ids;
use gitswarm_federation::merge::{MergeCoordinator, PluginRegistry};
use gitswarm_federation::store::{Param, Store};
use gitswarm_federation::store::sqlite::SqliteStore;
use gitswarm_federation::stream::{CreateWorkspaceRequest, StreamManager};
use gitswarm_federation::sync::SyncEngine;

fn guild_repo() -> Repo {
    Repo {
        id: "r2".into(),
        name: "guild-repo".into(),
        merge_mode: MergeMode::Review,
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
        stage: RepoStage::Growth,
        consensus_authority: ConsensusAuthority::Local,
    }
}

#[tokio::test]
async fn maintainer_approval_enqueues_merge_but_peer_approval_does_not() {
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
    let repo = guild_repo();

    let maintainer_id = ids::generate();
    let peer_id = ids::generate();
    store
        .exec(
            "INSERT INTO {{maintainer_grants}} (repo_id, agent_id, role) VALUES (?,?,?)",
            &[
                Param::Text(repo.id.clone()),
                Param::Text(maintainer_id.clone()),
                Param::Text("maintainer".into()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(
        store
            .exec(
                "SELECT role FROM {{maintainer_grants}} WHERE agent_id = ?",
                &[Param::Text(maintainer_id.clone())],
            )
            .await
            .unwrap()
            .first()
            .and_then(|r| r.get_str("role"))
            .map(str::to_string),
        Some("maintainer".to_string())
    );

    let author_id = ids::generate();
    let stream = manager
        .create_workspace(CreateWorkspaceRequest {
            repo: repo.clone(),
            agent_id: author_id.clone(),
            agent_level: AccessLevel::Write,
            base_branch: "main".into(),
            depends_on: None,
            task_id: None,
        })
        .await
        .unwrap();

    manager
        .commit(&repo, &stream.id, "/wt", "feature-work", &author_id)
        .await
        .unwrap();
    manager.submit_for_review(&stream.id).await.unwrap();

    // A non-maintainer's approval is recorded but cannot satisfy
    // evaluate_guild's "no_maintainer_reviews" gate on its own.
    manager
        .submit_review(&repo, &stream.id, &peer_id, Verdict::Approve, false, true)
        .await
        .unwrap();
    assert_eq!(merge.pending_count(&repo.id).await.unwrap(), 0);

    manager
        .submit_review(&repo, &stream.id, &maintainer_id, Verdict::Approve, false, true)
        .await
        .unwrap();

    assert_eq!(merge.pending_count(&repo.id).await.unwrap(), 1);
    let popped = merge.process_next(&repo).await.unwrap();
    assert_eq!(popped, Some(stream.id.clone()));
    assert!(fake.branch_files("buffer").contains_key("feature-work.txt"));
}
