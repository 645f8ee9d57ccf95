//! Sync engine (spec §4.8): an append-only local event queue, idempotent
//! batch replay against the server, a pull side for server-authored state,
//! and consensus-authority routing for `server`-authoritative repos.
//! Grounded on the outbox/replay shape of `coordination/src/events/bus.rs`
//! (monotonic sequence numbers, at-least-once delivery with a `seq` dedup
//! key) adapted from an in-process bus to an HTTP-backed offline queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::consensus::{ConsensusReason, ConsensusResult};
use crate::domain::{Repo, SyncEventType};
use crate::error::ErrorKind;
use crate::store::{Param, Row, Store};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error("server unreachable: {0}")]
    ServerUnavailable(String),
    #[error("server rejected event {seq}: {message}")]
    Rejected { seq: i64, message: String },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::ServerUnavailable(_) => ErrorKind::ServerUnavailable,
            Self::Rejected { .. } => ErrorKind::InvalidInput,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Typed payloads queued by every module that emits a sync event. Tagged so
/// the wire shape posted to the server carries its own `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEventPayload {
    StreamCreated { stream_id: String },
    StreamAbandoned { stream_id: String, reason: String },
    Commit { stream_id: String, message: String },
    Review { stream_id: String, reviewer_id: String, verdict: String },
    ConsensusReached { stream_id: String },
    MergeRequested { stream_id: String },
    MergeCompleted { stream_id: String, commit_hash: String },
    Stabilization { repo_id: String, result: String },
    Promotion { repo_id: String, commit_hash: String },
}

impl SyncEventPayload {
    fn event_type(&self) -> SyncEventType {
        match self {
            Self::StreamCreated { .. } => SyncEventType::StreamCreated,
            Self::StreamAbandoned { .. } => SyncEventType::StreamAbandoned,
            Self::Commit { .. } => SyncEventType::Commit,
            Self::Review { .. } => SyncEventType::Review,
            Self::ConsensusReached { .. } => SyncEventType::ConsensusReached,
            Self::MergeRequested { .. } => SyncEventType::MergeRequested,
            Self::MergeCompleted { .. } => SyncEventType::MergeCompleted,
            Self::Stabilization { .. } => SyncEventType::Stabilization,
            Self::Promotion { .. } => SyncEventType::Promotion,
        }
    }
}

/// One outcome per replayed event, spec §4.8.2: `ok`, `duplicate`, or
/// `error` (carrying whether the failure is terminal — dead-letter the
/// event rather than retry it).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayOutcome {
    Ok,
    Duplicate,
    Error { terminal: bool, message: String },
}

#[derive(Debug, Serialize)]
struct WireEvent {
    seq: i64,
    repo_id: String,
    event_type: String,
    payload: serde_json::Value,
    created_at: chrono::DateTime<Utc>,
}

fn row_to_wire(row: &Row) -> Option<(i64, WireEvent)> {
    let seq = row.get_i64("seq")?;
    Some((
        seq,
        WireEvent {
            seq,
            repo_id: row.get_str("repo_id")?.to_string(),
            event_type: row.get_str("event_type")?.to_string(),
            payload: row
                .get_str("payload")
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(serde_json::json!({})),
            created_at: row.get_timestamp("created_at").unwrap_or_else(Utc::now),
        },
    ))
}

/// A queued event is "dead" once it has failed terminally; it stays in the
/// table for audit but is skipped by future flush attempts.
pub struct SyncEngine {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    server_url: Option<String>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn Store>, server_url: Option<String>) -> Self {
        Self {
            store,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            server_url,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.server_url.is_some()
    }

    /// Append one event to the local queue. Never touches the network.
    pub async fn record_event(&self, repo_id: &str, payload: SyncEventPayload) -> SyncResult<()> {
        let event_type = serde_json::to_value(payload.event_type())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let payload_json = serde_json::to_value(&payload).unwrap_or(serde_json::json!({}));
        self.store
            .exec(
                "INSERT INTO {{sync_events}} (repo_id, event_type, payload, created_at, attempts) VALUES (?,?,?,?,0)",
                &[
                    Param::Text(repo_id.to_string()),
                    Param::Text(event_type),
                    Param::Text(payload_json.to_string()),
                    Param::Timestamp(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn pending(&self, repo_id: &str) -> SyncResult<Vec<Row>> {
        Ok(self
            .store
            .exec(
                "SELECT * FROM {{sync_events}} WHERE repo_id = ? AND dead = 0 ORDER BY seq ASC",
                &[Param::Text(repo_id.to_string())],
            )
            .await?)
    }

    /// `flush(repo_id)` (spec §4.8.2): push every queued event in `seq`
    /// order. A batch is idempotent on the server via `seq` dedup, so a
    /// flush that is interrupted and retried from scratch never double
    /// applies. Stops at the first terminal error to preserve ordering;
    /// transient failures (including total unreachability) leave the queue
    /// untouched for the next attempt.
    pub async fn flush(&self, repo_id: &str) -> SyncResult<usize> {
        let Some(base_url) = self.server_url.as_deref() else {
            return Err(SyncError::ServerUnavailable("no server configured".into()));
        };
        let rows = self.pending(repo_id).await?;
        let events: Vec<WireEvent> = rows.iter().filter_map(row_to_wire).map(|(_, e)| e).collect();
        if events.is_empty() {
            return Ok(0);
        }

        let resp = self
            .client
            .post(format!("{base_url}/sync/events"))
            .json(&events)
            .send()
            .await
            .map_err(|e| SyncError::ServerUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SyncError::ServerUnavailable(format!(
                "server returned {}",
                resp.status()
            )));
        }

        let outcomes: Vec<ReplayOutcome> = resp
            .json()
            .await
            .map_err(|e| SyncError::ServerUnavailable(e.to_string()))?;

        let mut flushed = 0usize;
        for (event, outcome) in events.iter().zip(outcomes.iter()) {
            match outcome {
                ReplayOutcome::Ok | ReplayOutcome::Duplicate => {
                    self.store
                        .exec(
                            "DELETE FROM {{sync_events}} WHERE seq = ?",
                            &[Param::Int(event.seq)],
                        )
                        .await?;
                    flushed += 1;
                }
                ReplayOutcome::Error { terminal, message } => {
                    if *terminal {
                        self.store
                            .exec(
                                "UPDATE {{sync_events}} SET dead = 1, last_error = ? WHERE seq = ?",
                                &[Param::Text(message.clone()), Param::Int(event.seq)],
                            )
                            .await?;
                    } else {
                        self.store
                            .exec(
                                "UPDATE {{sync_events}} SET attempts = attempts + 1, last_error = ? WHERE seq = ?",
                                &[Param::Text(message.clone()), Param::Int(event.seq)],
                            )
                            .await?;
                        return Ok(flushed);
                    }
                }
            }
        }
        Ok(flushed)
    }

    /// `poll(repo_id)` (spec §4.8.4): pull server-authored state (consensus
    /// decisions reached while this client was offline, stage progressions)
    /// as raw JSON for the caller to fold into local state. Returns `None`
    /// when no server is configured or it cannot be reached — callers treat
    /// that as "proceed on local-only authority," never as an error, since
    /// polling is advisory outside the `gated` merge mode.
    pub async fn poll(&self, repo_id: &str) -> Option<serde_json::Value> {
        let base_url = self.server_url.as_deref()?;
        let resp = self
            .client
            .get(format!("{base_url}/sync/state"))
            .query(&[("repo_id", repo_id)])
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json().await.ok()
    }

    /// Used by `consensus` routing (spec §4.8.3): a `gated` repo with
    /// server-side consensus authority must not claim consensus locally
    /// while the server is unreachable.
    pub async fn server_reachable(&self) -> bool {
        let Some(base_url) = self.server_url.as_deref() else {
            return false;
        };
        self.client
            .get(format!("{base_url}/sync/health"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn has_pending_review_events(&self, repo_id: &str) -> SyncResult<bool> {
        let rows = self.pending(repo_id).await?;
        Ok(rows
            .iter()
            .any(|r| r.get_str("event_type") == Some("review")))
    }

    async fn query_consensus(
        &self,
        repo_id: &str,
        stream_id: &str,
    ) -> SyncResult<ServerConsensusResponse> {
        let Some(base_url) = self.server_url.as_deref() else {
            return Err(SyncError::ServerUnavailable("no server configured".into()));
        };
        let resp = self
            .client
            .get(format!("{base_url}/sync/consensus"))
            .query(&[("repo_id", repo_id), ("stream_id", stream_id)])
            .send()
            .await
            .map_err(|e| SyncError::ServerUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SyncError::ServerUnavailable(format!(
                "server returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| SyncError::ServerUnavailable(e.to_string()))
    }

    /// Consensus-authority routing for `server`-authoritative repos (spec
    /// §4.8.3): drain the local event queue before asking the server to
    /// decide, so its answer never predates this client's own reviews. A
    /// review that hasn't synced yet forces `stale_reviews` rather than a
    /// silent fall back to local evaluation; a server that can't be reached
    /// at all forces `server_unavailable`. Infallible by design, mirroring
    /// `consensus::evaluate`'s non-throwing `{reached, reason, ...}` contract.
    pub async fn consensus_via_server(&self, repo: &Repo, stream_id: &str) -> ConsensusResult {
        let _ = self.flush(&repo.id).await;

        match self.has_pending_review_events(&repo.id).await {
            Ok(false) => {}
            _ => return stale_reviews_result(repo.consensus_threshold),
        }

        match self.query_consensus(&repo.id, stream_id).await {
            Ok(resp) => ConsensusResult {
                reached: resp.reached,
                reason: resp.reason,
                ratio: resp.ratio,
                threshold: repo.consensus_threshold,
                approvals: resp.approvals.unwrap_or(0.0),
                rejections: resp.rejections.unwrap_or(0.0),
                is_server_authoritative: true,
            },
            Err(_) => server_unavailable_result(repo.consensus_threshold),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerConsensusResponse {
    reached: bool,
    reason: ConsensusReason,
    ratio: Option<f64>,
    approvals: Option<f64>,
    rejections: Option<f64>,
}

fn stale_reviews_result(threshold: f64) -> ConsensusResult {
    ConsensusResult {
        reached: false,
        reason: ConsensusReason::StaleReviews,
        ratio: None,
        threshold,
        approvals: 0.0,
        rejections: 0.0,
        is_server_authoritative: true,
    }
}

fn server_unavailable_result(threshold: f64) -> ConsensusResult {
    ConsensusResult {
        reached: false,
        reason: ConsensusReason::ServerUnavailable,
        ratio: None,
        threshold,
        approvals: 0.0,
        rejections: 0.0,
        is_server_authoritative: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    #[tokio::test]
    async fn record_event_queues_without_network() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = SyncEngine::new(store.clone(), None);
        engine
            .record_event("r1", SyncEventPayload::StreamCreated { stream_id: "s1".into() })
            .await
            .unwrap();
        let pending = engine.pending("r1").await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn flush_without_server_is_server_unavailable() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = SyncEngine::new(store, None);
        let result = engine.flush("r1").await;
        assert!(matches!(result, Err(SyncError::ServerUnavailable(_))));
    }
}
