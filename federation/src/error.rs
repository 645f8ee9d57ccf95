//! Top-level error kind taxonomy (spec §7) and the conversions that let
//! every subsystem's typed error collapse into a single reportable shape.

use std::fmt;

use crate::config::ConfigError;
use crate::consensus::ConsensusError;
use crate::git_mechanics::MechanicsError;
use crate::identity::AccessError;
use crate::ids::IdError;
use crate::merge::MergeError;
use crate::store::StoreError;
use crate::stream::StreamError;
use crate::sync::SyncError;

/// The error-kind taxonomy from spec §7. This is not a transport code; it is
/// the stable vocabulary callers (CLI or programmatic) match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    Forbidden,
    IllegalTransition,
    Conflict,
    StaleReviews,
    ServerUnavailable,
    Duplicate,
    Transient,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidInput => "invalid_input",
            Self::Forbidden => "forbidden",
            Self::IllegalTransition => "illegal_transition",
            Self::Conflict => "conflict",
            Self::StaleReviews => "stale_reviews",
            Self::ServerUnavailable => "server_unavailable",
            Self::Duplicate => "duplicate",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Aggregate error type returned by every public federation operation.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Mechanics(#[from] MechanicsError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invariant violation: {0}")]
    Fatal(String),
}

impl FederationError {
    /// Map to the stable spec §7 error kind, used for the CLI's
    /// `error: <kind>: <message>` line and for programmatic dispatch.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Id(_) => ErrorKind::InvalidInput,
            Self::Access(_) => ErrorKind::Forbidden,
            Self::Consensus(e) => e.kind(),
            Self::Mechanics(e) => e.kind(),
            Self::Stream(e) => e.kind(),
            Self::Merge(e) => e.kind(),
            Self::Sync(e) => e.kind(),
            Self::Config(e) => e.kind(),
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Render the single structured CLI failure line from spec §7:
    /// `error: <kind>: <message>`.
    pub fn cli_line(&self) -> String {
        format!("error: {}: {}", self.kind(), self)
    }
}

pub type FederationResult<T> = Result<T, FederationError>;
