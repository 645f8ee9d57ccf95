//! Identity & access (spec §4.3). Pure functions over rows the caller has
//! already fetched — this module makes no store calls itself, matching the
//! teacher's "pure, data-in/struct-out decision function" idiom seen in
//! `coordination/src/rollout/feature_flags.rs` (ordered-rule evaluation
//! over a `Vec<Rule>`) and `coordination/src/router/classifier.rs`.

use crate::domain::{
    AccessLevel, Agent, AgentAccess, BranchRule, DirectPush, ExplicitGrant, MaintainerGrant,
    MaintainerRole, Repo,
};
use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("agent {agent} lacks {action} on repo {repo} (resolved via {reason})")]
    Forbidden {
        agent: String,
        repo: String,
        action: String,
        reason: String,
    },
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Forbidden
    }
}

/// Where a permission decision was resolved from — surfaced to the caller
/// in `forbidden` errors per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionSource {
    ExplicitGrant,
    MaintainerRole,
    RepoAccessMode,
    PlatformDefault,
}

impl std::fmt::Display for PermissionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExplicitGrant => "explicit_grant",
            Self::MaintainerRole => "maintainer_role",
            Self::RepoAccessMode => "repo_access_mode",
            Self::PlatformDefault => "platform_default",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Permission {
    pub level: AccessLevel,
    pub source: PermissionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Merge,
    Settings,
    Delete,
}

/// `resolve_permissions(agent, repo) -> {level, source}` (spec §4.3).
///
/// Resolution order: explicit grant (honoring `expires_at`) -> maintainer
/// role (owner=admin, maintainer=maintain) -> repo access mode
/// (public->write; karma_threshold: karma>=threshold->write else read if
/// public else none; allowlist->none unless granted) -> platform default.
pub fn resolve_permissions(
    agent: &Agent,
    repo: &Repo,
    now: chrono::DateTime<chrono::Utc>,
    explicit_grant: Option<&ExplicitGrant>,
    maintainer_grant: Option<&MaintainerGrant>,
) -> Permission {
    if let Some(grant) = explicit_grant {
        let live = grant.expires_at.map(|exp| exp > now).unwrap_or(true);
        if live {
            return Permission {
                level: grant.level,
                source: PermissionSource::ExplicitGrant,
            };
        }
    }

    if let Some(grant) = maintainer_grant {
        let level = match grant.role {
            MaintainerRole::Owner => AccessLevel::Admin,
            MaintainerRole::Maintainer => AccessLevel::Maintain,
        };
        return Permission {
            level,
            source: PermissionSource::MaintainerRole,
        };
    }

    let level = match repo.agent_access {
        AgentAccess::Public => AccessLevel::Write,
        AgentAccess::KarmaThreshold => {
            if agent.karma >= repo.min_karma {
                AccessLevel::Write
            } else {
                AccessLevel::Read
            }
        }
        AgentAccess::Allowlist => AccessLevel::None,
    };
    Permission {
        level,
        source: PermissionSource::RepoAccessMode,
    }
}

fn action_requires(action: Action) -> AccessLevel {
    match action {
        Action::Read => AccessLevel::Read,
        Action::Write => AccessLevel::Write,
        Action::Merge => AccessLevel::Write,
        Action::Settings => AccessLevel::Maintain,
        Action::Delete => AccessLevel::Admin,
    }
}

/// `can_perform(agent, repo, action) -> bool`, mapping actions to allowed
/// levels (spec §4.3). `AccessLevel`'s declaration order is its rank, so
/// plain derived `Ord` gives us the comparison for free.
pub fn can_perform(level: AccessLevel, action: Action) -> bool {
    level >= action_requires(action)
}

/// Longest-literal-first match of `branch` against `rules`, `*` as glob.
/// Ties broken by the rule's explicit `priority` (higher wins).
pub fn match_branch_rule<'a>(branch: &str, rules: &'a [BranchRule]) -> Option<&'a BranchRule> {
    let mut candidates: Vec<&BranchRule> = rules
        .iter()
        .filter(|r| glob_match(&r.branch_pattern, branch))
        .collect();
    candidates.sort_by(|a, b| {
        literal_len(&b.branch_pattern)
            .cmp(&literal_len(&a.branch_pattern))
            .then(b.priority.cmp(&a.priority))
    });
    candidates.into_iter().next()
}

fn literal_len(pattern: &str) -> usize {
    pattern.chars().filter(|c| *c != '*').count()
}

fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    regex::Regex::new(&format!("^{escaped}$"))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// `can_push_to_branch(agent, repo, branch)` (spec §4.3): a matching rule
/// with `direct_push=none` always forces the stream-review path, i.e.
/// direct pushes are never allowed regardless of the agent's level.
pub fn can_push_to_branch(
    level: AccessLevel,
    branch: &str,
    rules: &[BranchRule],
) -> bool {
    match match_branch_rule(branch, rules) {
        None => level >= AccessLevel::Write,
        Some(rule) => match rule.direct_push {
            DirectPush::None => false,
            DirectPush::Maintainers => level >= AccessLevel::Maintain,
            DirectPush::All => level >= AccessLevel::Write,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentStatus, ConsensusAuthority, MergeMode, OwnershipModel, RepoStage};
    use chrono::Utc;

    fn agent(karma: f64) -> Agent {
        Agent {
            id: "a".into(),
            name: "a".into(),
            karma,
            status: AgentStatus::Active,
        }
    }

    fn repo(access: AgentAccess, min_karma: f64) -> Repo {
        Repo {
            id: "r".into(),
            name: "r".into(),
            merge_mode: MergeMode::Review,
            ownership_model: OwnershipModel::Guild,
            consensus_threshold: 0.66,
            min_reviews: 1,
            human_review_weight: 1.5,
            agent_access: access,
            min_karma,
            buffer_branch: "buffer".into(),
            promote_target: "main".into(),
            auto_promote_on_green: false,
            auto_revert_on_red: true,
            stabilize_command: String::new(),
            stage: RepoStage::Seed,
            consensus_authority: ConsensusAuthority::Local,
        }
    }

    #[test]
    fn public_repo_grants_write_by_default() {
        let p = resolve_permissions(&agent(0.0), &repo(AgentAccess::Public, 0.0), Utc::now(), None, None);
        assert_eq!(p.level, AccessLevel::Write);
        assert_eq!(p.source, PermissionSource::RepoAccessMode);
    }

    #[test]
    fn karma_threshold_falls_back_to_read() {
        let p = resolve_permissions(
            &agent(1.0),
            &repo(AgentAccess::KarmaThreshold, 10.0),
            Utc::now(),
            None,
            None,
        );
        assert_eq!(p.level, AccessLevel::Read);
    }

    #[test]
    fn allowlist_denies_without_grant() {
        let p = resolve_permissions(&agent(100.0), &repo(AgentAccess::Allowlist, 0.0), Utc::now(), None, None);
        assert_eq!(p.level, AccessLevel::None);
    }

    #[test]
    fn explicit_grant_expired_is_ignored() {
        let grant = ExplicitGrant {
            repo_id: "r".into(),
            agent_id: "a".into(),
            level: AccessLevel::Admin,
            expires_at: Some(Utc::now() - chrono::Duration::days(1)),
        };
        let p = resolve_permissions(
            &agent(0.0),
            &repo(AgentAccess::Allowlist, 0.0),
            Utc::now(),
            Some(&grant),
            None,
        );
        assert_eq!(p.level, AccessLevel::None);
    }

    #[test]
    fn branch_rule_none_blocks_direct_push_regardless_of_level() {
        let rules = vec![BranchRule {
            repo_id: "r".into(),
            branch_pattern: "main".into(),
            direct_push: DirectPush::None,
            required_approvals: 2,
            require_tests_pass: true,
            consensus_threshold_override: None,
            priority: 0,
        }];
        assert!(!can_push_to_branch(AccessLevel::Admin, "main", &rules));
    }

    #[test]
    fn longest_literal_wins_over_glob() {
        let rules = vec![
            BranchRule {
                repo_id: "r".into(),
                branch_pattern: "release/*".into(),
                direct_push: DirectPush::All,
                required_approvals: 0,
                require_tests_pass: false,
                consensus_threshold_override: None,
                priority: 0,
            },
            BranchRule {
                repo_id: "r".into(),
                branch_pattern: "release/stable".into(),
                direct_push: DirectPush::None,
                required_approvals: 0,
                require_tests_pass: false,
                consensus_threshold_override: None,
                priority: 0,
            },
        ];
        let matched = match_branch_rule("release/stable", &rules).unwrap();
        assert_eq!(matched.branch_pattern, "release/stable");
    }
}
