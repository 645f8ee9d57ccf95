//! Configuration (spec §6.2): a typed, `serde_yaml`-loaded repo-owned
//! config plus the server-owned settings that must never be settable from
//! the same file, grounded on `coordination/src/rollout/config.rs`'s
//! `serde(default)`-everywhere struct + `from_yaml_str` loader pattern.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{AgentAccess, BranchRule, DirectPush, MergeMode, OwnershipModel, RepoStage};
use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("server update touched repo-owned fields: {fields:?}")]
    OwnershipConflict { fields: Vec<String> },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Parse { .. } => ErrorKind::InvalidInput,
            Self::OwnershipConflict { .. } => ErrorKind::Conflict,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_true() -> bool {
    true
}
fn default_merge_mode() -> MergeMode {
    MergeMode::Review
}
fn default_ownership_model() -> OwnershipModel {
    OwnershipModel::Guild
}
fn default_threshold() -> f64 {
    0.66
}
fn default_min_reviews() -> u32 {
    1
}
fn default_human_review_weight() -> f64 {
    1.5
}
fn default_buffer_branch() -> String {
    "buffer".into()
}
fn default_promote_target() -> String {
    "main".into()
}
fn default_stabilize_timeout() -> u64 {
    1800
}
fn default_retry_count() -> u32 {
    3
}
fn default_flaky_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlakeDetectionConfig {
    pub enabled: bool,
    pub retry_count: u32,
    pub flaky_threshold: f64,
}

impl Default for FlakeDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_count: default_retry_count(),
            flaky_threshold: default_flaky_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub direct_push: DirectPush,
    #[serde(default)]
    pub required_approvals: u32,
    #[serde(default)]
    pub require_tests_pass: bool,
    #[serde(default)]
    pub consensus_threshold_override: Option<f64>,
    #[serde(default)]
    pub priority: i64,
}

impl Default for DirectPush {
    fn default() -> Self {
        DirectPush::All
    }
}

impl BranchRuleConfig {
    pub fn into_domain(self, repo_id: &str) -> BranchRule {
        BranchRule {
            repo_id: repo_id.to_string(),
            branch_pattern: self.pattern,
            direct_push: self.direct_push,
            required_approvals: self.required_approvals,
            require_tests_pass: self.require_tests_pass,
            consensus_threshold_override: self.consensus_threshold_override,
            priority: self.priority,
        }
    }
}

/// Repo-owned keys from spec §6.2, authoritative only from
/// `.gitswarm/config.yml`. Every field is `serde(default)` so a partial
/// file (or none at all) still loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    #[serde(default = "default_merge_mode")]
    pub merge_mode: MergeMode,
    #[serde(default = "default_ownership_model")]
    pub ownership_model: OwnershipModel,
    #[serde(default = "default_threshold")]
    pub consensus_threshold: f64,
    #[serde(default = "default_min_reviews")]
    pub min_reviews: u32,
    #[serde(default = "default_human_review_weight")]
    pub human_review_weight: f64,
    #[serde(default = "default_buffer_branch")]
    pub buffer_branch: String,
    #[serde(default = "default_promote_target")]
    pub promote_target: String,
    pub auto_promote_on_green: bool,
    #[serde(default = "default_true")]
    pub auto_revert_on_red: bool,
    pub stabilize_command: String,
    #[serde(default = "default_stabilize_timeout")]
    pub stabilize_timeout_seconds: u64,
    pub flake_detection: FlakeDetectionConfig,
    pub branch_rules: Vec<BranchRuleConfig>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            merge_mode: default_merge_mode(),
            ownership_model: default_ownership_model(),
            consensus_threshold: default_threshold(),
            min_reviews: default_min_reviews(),
            human_review_weight: default_human_review_weight(),
            buffer_branch: default_buffer_branch(),
            promote_target: default_promote_target(),
            auto_promote_on_green: false,
            auto_revert_on_red: true,
            stabilize_command: String::new(),
            stabilize_timeout_seconds: default_stabilize_timeout(),
            flake_detection: FlakeDetectionConfig::default(),
            branch_rules: Vec::new(),
        }
    }
}

impl RepoConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml_str(&raw, path)
    }

    fn from_yaml_str(raw: &str, path: &Path) -> ConfigResult<Self> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// All repo-owned field names, used by `reconcile_patch` to reject a
    /// server patch that touches any of them while a config.yml is present.
    pub const REPO_OWNED_FIELDS: &'static [&'static str] = &[
        "merge_mode",
        "ownership_model",
        "consensus_threshold",
        "min_reviews",
        "human_review_weight",
        "buffer_branch",
        "promote_target",
        "auto_promote_on_green",
        "auto_revert_on_red",
        "stabilize_command",
        "stabilize_timeout_seconds",
        "flake_detection",
        "branch_rules",
    ];
}

/// Server-owned keys (spec §6.2): settable only via the server API, never
/// from `config.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOwnedConfig {
    pub agent_access: AgentAccess,
    pub min_karma: f64,
    pub is_private: bool,
    pub stage: RepoStage,
    pub plugins_enabled: bool,
    pub require_human_approval: bool,
    pub human_can_force_merge: bool,
}

impl Default for ServerOwnedConfig {
    fn default() -> Self {
        Self {
            agent_access: AgentAccess::Public,
            min_karma: 0.0,
            is_private: false,
            stage: RepoStage::Seed,
            plugins_enabled: true,
            require_human_approval: false,
            human_can_force_merge: true,
        }
    }
}

/// `reconcile_patch(existing, has_config_file, patch_fields)` (spec §6.2):
/// a server-side `PATCH /repos/:id` that names any repo-owned field while a
/// `config.yml` is present on disk is rejected wholesale — it never applies
/// the server-owned subset of the patch either, matching S6's "server state
/// unchanged."
pub fn reconcile_patch(has_config_file: bool, patch_field_names: &[&str]) -> ConfigResult<()> {
    if !has_config_file {
        return Ok(());
    }
    let offending: Vec<String> = patch_field_names
        .iter()
        .filter(|f| RepoConfig::REPO_OWNED_FIELDS.contains(f))
        .map(|f| f.to_string())
        .collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::OwnershipConflict { fields: offending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_loads_all_defaults() {
        let cfg = RepoConfig::from_yaml_str("{}", Path::new("config.yml")).unwrap();
        assert_eq!(cfg.merge_mode, MergeMode::Review);
        assert_eq!(cfg.consensus_threshold, 0.66);
        assert_eq!(cfg.min_reviews, 1);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let cfg = RepoConfig::from_yaml_str("merge_mode: swarm\nmin_reviews: 2\n", Path::new("c.yml")).unwrap();
        assert_eq!(cfg.merge_mode, MergeMode::Swarm);
        assert_eq!(cfg.min_reviews, 2);
        assert_eq!(cfg.buffer_branch, "buffer");
    }

    #[test]
    fn server_patch_touching_repo_owned_field_is_rejected_when_config_file_present() {
        let result = reconcile_patch(true, &["consensus_threshold"]);
        assert!(matches!(
            result,
            Err(ConfigError::OwnershipConflict { fields }) if fields == vec!["consensus_threshold".to_string()]
        ));
    }

    #[test]
    fn server_owned_field_patch_is_allowed_even_with_config_file() {
        assert!(reconcile_patch(true, &["agent_access", "min_karma"]).is_ok());
    }

    #[test]
    fn any_patch_allowed_without_config_file() {
        assert!(reconcile_patch(false, &["consensus_threshold"]).is_ok());
    }
}
