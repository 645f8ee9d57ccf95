//! Stream lifecycle state machine (spec §4.6). Grounded directly on
//! `crates/swarm-agents/src/state_machine.rs`: a typed state enum, an
//! explicit `is_legal_transition` guard function, and an auditable
//! `TransitionRecord` log — adapted here to the stream lifecycle instead
//! of the orchestrator-loop lifecycle that file modeled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::StreamStatus;

/// ```text
/// active         -> in_review        (submit_for_review)
/// active         -> merged           (commit in swarm mode, auto-merge)
/// active         -> conflicted       (conflict on merge/cascade)
/// active         -> abandoned        (abandon)
/// in_review      -> merged           (consensus reached + merge)
/// in_review      -> active           (changes_requested)
/// in_review      -> conflicted       (conflict on merge/cascade)
/// in_review      -> abandoned        (abandon)
/// conflicted     -> active           (recommit)
/// conflicted     -> abandoned        (abandon)
/// ```
/// `merged` and `abandoned` are terminal (spec §3: "terminal statuses are
/// final").
pub fn is_legal_transition(from: StreamStatus, to: StreamStatus) -> bool {
    use StreamStatus::*;
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Active, InReview)
            | (Active, Merged)
            | (Active, Conflicted)
            | (Active, Abandoned)
            | (InReview, Merged)
            | (InReview, Active)
            | (InReview, Conflicted)
            | (InReview, Abandoned)
            | (Conflicted, Active)
            | (Conflicted, Abandoned)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub stream_id: String,
    pub from: StreamStatus,
    pub to: StreamStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use StreamStatus::*;

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        assert!(!is_legal_transition(Merged, Active));
        assert!(!is_legal_transition(Abandoned, InReview));
    }

    #[test]
    fn conflicted_recovers_via_recommit_only_to_active() {
        assert!(is_legal_transition(Conflicted, Active));
        assert!(!is_legal_transition(Conflicted, InReview));
    }
}
