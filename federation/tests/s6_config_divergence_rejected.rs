//! Scenario S6 (spec §8): a repo-owned field set in `.gitswarm/config.yml`
//! takes precedence over a server `PATCH` attempting to change the same
//! field — the patch is rejected wholesale, including any server-owned
//! fields bundled in the same request, and nothing is applied.

use gitswarm_federation::config::{reconcile_patch, ConfigError, RepoConfig};
use gitswarm_federation::RepoLayout;

#[test]
fn config_yml_on_disk_wins_over_conflicting_server_patch() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(dir.path());
    layout.ensure().unwrap();
    std::fs::write(layout.config_path(), "consensus_threshold: 0.8\n").unwrap();

    let cfg = RepoConfig::load(layout.config_path()).unwrap();
    assert_eq!(cfg.consensus_threshold, 0.8);

    let has_config_file = layout.config_path().exists();
    assert!(has_config_file);

    // The server patch names one repo-owned field and one server-owned
    // field together; the whole patch must be rejected, not split.
    let result = reconcile_patch(has_config_file, &["consensus_threshold", "min_karma"]);
    match result {
        Err(ConfigError::OwnershipConflict { fields }) => {
            assert_eq!(fields, vec!["consensus_threshold".to_string()]);
        }
        other => panic!("expected OwnershipConflict, got {other:?}"),
    }

    // Rejecting a patch never touches the file; the repo-owned value on
    // disk is exactly what it was before the (rejected) patch.
    let reloaded = RepoConfig::load(layout.config_path()).unwrap();
    assert_eq!(reloaded.consensus_threshold, 0.8);
}

#[test]
fn patch_with_only_server_owned_fields_applies_even_with_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RepoLayout::new(dir.path());
    layout.ensure().unwrap();
    std::fs::write(layout.config_path(), "consensus_threshold: 0.8\n").unwrap();

    let result = reconcile_patch(true, &["min_karma", "agent_access"]);
    assert!(result.is_ok());
}
