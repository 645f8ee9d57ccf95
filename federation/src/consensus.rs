//! Consensus service (spec §4.4). Structurally grounded on
//! `coordination/src/debate/consensus.rs`: a struct of thresholds, a pure
//! `evaluate(...)` function over a slice of recorded verdicts, and a
//! reason-carrying result — the closest match anywhere in the pack. The
//! karma-weighted `open` model's math has no teacher analog and is new.

use serde::{Deserialize, Serialize};

use crate::domain::{MaintainerGrant, MaintainerRole, OwnershipModel, Repo, Review, Verdict};
use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("review sync is stale; drain the sync queue before re-checking consensus")]
    StaleReviews,
    #[error("server consensus authority unreachable")]
    ServerUnavailable,
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StaleReviews => ErrorKind::StaleReviews,
            Self::ServerUnavailable => ErrorKind::ServerUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusReason {
    InsufficientReviews,
    OwnerRejected,
    AwaitingOwner,
    NoMaintainerReviews,
    BelowThreshold,
    ConsensusReached,
    ServerUnavailable,
    StaleReviews,
}

impl std::fmt::Display for ConsensusReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InsufficientReviews => "insufficient_reviews",
            Self::OwnerRejected => "owner_rejected",
            Self::AwaitingOwner => "awaiting_owner",
            Self::NoMaintainerReviews => "no_maintainer_reviews",
            Self::BelowThreshold => "below_threshold",
            Self::ConsensusReached => "consensus_reached",
            Self::ServerUnavailable => "server_unavailable",
            Self::StaleReviews => "stale_reviews",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub reached: bool,
    pub reason: ConsensusReason,
    pub ratio: Option<f64>,
    pub threshold: f64,
    pub approvals: f64,
    pub rejections: f64,
    pub is_server_authoritative: bool,
}

/// Most-recent verdict per reviewer. spec §3: "`(stream_id, reviewer_id)`
/// uniqueness — the most recent verdict replaces the prior." Callers fetch
/// raw rows from the store; this collapses them per the invariant so the
/// rest of this module never has to think about duplicate reviewer rows.
pub fn latest_per_reviewer(reviews: &[Review]) -> Vec<Review> {
    let mut latest: std::collections::HashMap<&str, &Review> = std::collections::HashMap::new();
    for r in reviews {
        latest
            .entry(r.reviewer_id.as_str())
            .and_modify(|cur| {
                if r.reviewed_at > cur.reviewed_at {
                    *cur = r;
                }
            })
            .or_insert(r);
    }
    latest.into_values().cloned().collect()
}

fn is_maintainer(agent_id: &str, grants: &[MaintainerGrant]) -> Option<MaintainerRole> {
    grants
        .iter()
        .find(|g| g.agent_id == agent_id)
        .map(|g| g.role)
}

/// `evaluate(stream_id, repo_id)` from spec §4.4. `reviews` must already be
/// the current (deduplicated) review set for the stream; `karma_by_agent`
/// supplies each open-model reviewer's karma.
pub fn evaluate(
    repo: &Repo,
    reviews: &[Review],
    maintainer_grants: &[MaintainerGrant],
    karma_by_agent: impl Fn(&str) -> f64,
    is_server_authoritative: bool,
) -> ConsensusResult {
    let reviews = latest_per_reviewer(reviews);
    let threshold = repo.consensus_threshold;

    match repo.ownership_model {
        OwnershipModel::Solo => evaluate_solo(&reviews, maintainer_grants, threshold, is_server_authoritative),
        OwnershipModel::Guild => evaluate_guild(
            &reviews,
            maintainer_grants,
            threshold,
            repo.min_reviews,
            is_server_authoritative,
        ),
        OwnershipModel::Open => evaluate_open(
            &reviews,
            threshold,
            repo.min_reviews,
            repo.human_review_weight,
            karma_by_agent,
            is_server_authoritative,
        ),
    }
}

fn evaluate_solo(
    reviews: &[Review],
    grants: &[MaintainerGrant],
    threshold: f64,
    is_server_authoritative: bool,
) -> ConsensusResult {
    let owner_reviews: Vec<&Review> = reviews
        .iter()
        .filter(|r| is_maintainer(&r.reviewer_id, grants) == Some(MaintainerRole::Owner))
        .collect();

    let owner_rejected = owner_reviews
        .iter()
        .any(|r| r.verdict == Verdict::RequestChanges);
    let owner_approved = owner_reviews
        .iter()
        .any(|r| r.verdict == Verdict::Approve);

    let (reached, reason) = if owner_rejected {
        (false, ConsensusReason::OwnerRejected)
    } else if owner_approved {
        (true, ConsensusReason::ConsensusReached)
    } else {
        (false, ConsensusReason::AwaitingOwner)
    };

    ConsensusResult {
        reached,
        reason,
        ratio: if owner_approved { Some(1.0) } else { None },
        threshold,
        approvals: owner_approved as u8 as f64,
        rejections: owner_rejected as u8 as f64,
        is_server_authoritative,
    }
}

fn evaluate_guild(
    reviews: &[Review],
    grants: &[MaintainerGrant],
    threshold: f64,
    min_reviews: u32,
    is_server_authoritative: bool,
) -> ConsensusResult {
    let maintainer_reviews: Vec<&Review> = reviews
        .iter()
        .filter(|r| is_maintainer(&r.reviewer_id, grants).is_some())
        .collect();

    if maintainer_reviews.is_empty() {
        return ConsensusResult {
            reached: false,
            reason: ConsensusReason::NoMaintainerReviews,
            ratio: None,
            threshold,
            approvals: 0.0,
            rejections: 0.0,
            is_server_authoritative,
        };
    }

    let approvals = maintainer_reviews
        .iter()
        .filter(|r| r.verdict == Verdict::Approve)
        .count() as f64;
    let rejections = maintainer_reviews
        .iter()
        .filter(|r| r.verdict == Verdict::RequestChanges)
        .count() as f64;
    let total = approvals + rejections;

    if (maintainer_reviews.len() as u32) < min_reviews {
        return ConsensusResult {
            reached: false,
            reason: ConsensusReason::InsufficientReviews,
            ratio: None,
            threshold,
            approvals,
            rejections,
            is_server_authoritative,
        };
    }

    let ratio = if total > 0.0 { approvals / total } else { 0.0 };
    let reached = total > 0.0 && ratio >= threshold && approvals > 0.0;

    ConsensusResult {
        reached,
        reason: if reached {
            ConsensusReason::ConsensusReached
        } else {
            ConsensusReason::BelowThreshold
        },
        ratio: Some(ratio),
        threshold,
        approvals,
        rejections,
        is_server_authoritative,
    }
}

fn evaluate_open(
    reviews: &[Review],
    threshold: f64,
    min_reviews: u32,
    human_review_weight: f64,
    karma_by_agent: impl Fn(&str) -> f64,
    is_server_authoritative: bool,
) -> ConsensusResult {
    if (reviews.len() as u32) < min_reviews {
        return ConsensusResult {
            reached: false,
            reason: ConsensusReason::InsufficientReviews,
            ratio: None,
            threshold,
            approvals: 0.0,
            rejections: 0.0,
            is_server_authoritative,
        };
    }

    let mut approval_weight = 0.0;
    let mut rejection_weight = 0.0;
    for r in reviews {
        if r.verdict == Verdict::Comment {
            continue;
        }
        let karma = karma_by_agent(&r.reviewer_id);
        let mut weight = (karma + 1.0).sqrt();
        if r.is_human {
            weight *= human_review_weight;
        }
        match r.verdict {
            Verdict::Approve => approval_weight += weight,
            Verdict::RequestChanges => rejection_weight += weight,
            Verdict::Comment => {}
        }
    }

    let total = approval_weight + rejection_weight;
    let ratio = if total > 0.0 {
        approval_weight / total
    } else {
        0.0
    };
    let reached = total > 0.0 && ratio >= threshold;

    ConsensusResult {
        reached,
        reason: if reached {
            ConsensusReason::ConsensusReached
        } else {
            ConsensusReason::BelowThreshold
        },
        ratio: Some(ratio),
        threshold,
        approvals: approval_weight,
        rejections: rejection_weight,
        is_server_authoritative,
    }
}
