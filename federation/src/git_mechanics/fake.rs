//! In-process fake mechanics provider used by this crate's own tests.
//! Keeps enough state to exercise merges, conflicts, cascade rebase, and
//! bisect-by-rollback without touching a real git repository.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    AtomicOperation, CascadeOutcome, CommitOutcome, ConflictInfo, GitMechanicsProvider,
    MechanicsError, MechanicsResult, MergeOutcome,
};
use crate::ids;

#[derive(Debug, Clone, Default)]
struct StreamRecord {
    base: String,
    parent: Option<String>,
    pending_files: HashMap<String, String>,
    merged: bool,
}

#[derive(Debug, Clone, Default)]
struct BranchState {
    files: HashMap<String, String>,
    /// snapshot of `files` immediately after each applied operation, so
    /// `rollback_to_operation` can restore exactly that point.
    snapshots: Vec<(String, HashMap<String, String>)>,
}

#[derive(Default)]
struct FakeState {
    streams: HashMap<String, StreamRecord>,
    branches: HashMap<String, BranchState>,
    ops: Vec<AtomicOperation>,
    /// (stream_id, target) pairs that should conflict exactly once, then
    /// clear — simulates "agent resolves and recommits."
    forced_conflicts: HashMap<(String, String), ConflictInfo>,
}

/// In-memory stand-in for the external git mechanics provider (spec §4.5,
/// §6.4). Every method is synchronous under the hood; `async` is kept on
/// the trait because a real provider talks over a socket or a subprocess.
pub struct FakeMechanics {
    state: Mutex<FakeState>,
}

impl Default for FakeMechanics {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }
}

impl FakeMechanics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: force the next merge of `stream` into `target` to report
    /// a conflict on `files`.
    pub fn inject_conflict(&self, stream: &str, target: &str, files: &[&str]) {
        let mut st = self.state.lock().unwrap();
        st.forced_conflicts.insert(
            (stream.to_string(), target.to_string()),
            ConflictInfo {
                files: files.iter().map(|s| s.to_string()).collect(),
                src: stream.to_string(),
                tgt: target.to_string(),
            },
        );
    }

    pub fn branch_files(&self, branch: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .branches
            .get(branch)
            .cloned()
            .unwrap_or_default()
            .files
    }

    pub fn op_count(&self) -> usize {
        self.state.lock().unwrap().ops.len()
    }
}

#[async_trait]
impl GitMechanicsProvider for FakeMechanics {
    async fn create_stream(
        &self,
        _repo: &str,
        base: &str,
        parent: Option<&str>,
    ) -> MechanicsResult<String> {
        let id = ids::generate();
        let mut st = self.state.lock().unwrap();
        st.streams.insert(
            id.clone(),
            StreamRecord {
                base: base.to_string(),
                parent: parent.map(|s| s.to_string()),
                pending_files: HashMap::new(),
                merged: false,
            },
        );
        Ok(id)
    }

    async fn create_worktree(&self, stream: &str, agent: &str) -> MechanicsResult<String> {
        let st = self.state.lock().unwrap();
        if !st.streams.contains_key(stream) {
            return Err(MechanicsError::UnknownStream(stream.to_string()));
        }
        Ok(format!("/tmp/gitswarm-wt/{agent}/{stream}"))
    }

    async fn commit(
        &self,
        stream: &str,
        _worktree: &str,
        message: &str,
        _agent: &str,
    ) -> MechanicsResult<CommitOutcome> {
        let mut st = self.state.lock().unwrap();
        let rec = st
            .streams
            .get_mut(stream)
            .ok_or_else(|| MechanicsError::UnknownStream(stream.to_string()))?;
        // The fake models "one commit touches one path named after the
        // message" so tests can assert file-level effects deterministically.
        rec.pending_files
            .insert(format!("{message}.txt"), message.to_string());
        Ok(CommitOutcome {
            commit_hash: ids::generate(),
            change_id: ids::generate(),
        })
    }

    async fn merge_stream(&self, stream: &str, target: &str) -> MechanicsResult<MergeOutcome> {
        let mut st = self.state.lock().unwrap();
        if let Some(info) = st
            .forced_conflicts
            .remove(&(stream.to_string(), target.to_string()))
        {
            return Ok(MergeOutcome::Conflict(info));
        }
        let files = st
            .streams
            .get(stream)
            .ok_or_else(|| MechanicsError::UnknownStream(stream.to_string()))?
            .pending_files
            .clone();

        let branch = st.branches.entry(target.to_string()).or_default();
        for (path, content) in &files {
            branch.files.insert(path.clone(), content.clone());
        }
        let op_id = ids::generate();
        branch
            .snapshots
            .push((op_id.clone(), branch.files.clone()));

        st.ops.push(AtomicOperation {
            op_id: op_id.clone(),
            stream_id: Some(stream.to_string()),
            description: format!("merge {stream} into {target}"),
        });
        if let Some(rec) = st.streams.get_mut(stream) {
            rec.merged = true;
        }
        Ok(MergeOutcome::Merged { commit_hash: op_id })
    }

    async fn cascade_rebase(&self, streams: &[String]) -> MechanicsResult<Vec<CascadeOutcome>> {
        let mut st = self.state.lock().unwrap();
        let mut out = Vec::new();
        for s in streams {
            if let Some(rec) = st.streams.get_mut(s) {
                if rec.merged {
                    continue;
                }
                rec.base = "buffer".to_string();
                out.push(CascadeOutcome::Rebased {
                    stream_id: s.clone(),
                    new_base: rec.base.clone(),
                });
            } else {
                out.push(CascadeOutcome::Conflict {
                    stream_id: s.clone(),
                    info: ConflictInfo {
                        files: vec![],
                        src: s.clone(),
                        tgt: "buffer".to_string(),
                    },
                });
            }
        }
        Ok(out)
    }

    async fn rollback_to_operation(&self, op_id: &str) -> MechanicsResult<String> {
        let mut st = self.state.lock().unwrap();
        for branch in st.branches.values_mut() {
            if let Some(pos) = branch.snapshots.iter().position(|(id, _)| id == op_id) {
                let (_, files) = branch.snapshots[pos].clone();
                branch.files = files;
                branch.snapshots.truncate(pos + 1);
                return Ok(op_id.to_string());
            }
        }
        Err(MechanicsError::Failed(format!(
            "no snapshot for operation {op_id}"
        )))
    }

    async fn operations_since(&self, tag: &str) -> MechanicsResult<Vec<AtomicOperation>> {
        let st = self.state.lock().unwrap();
        if tag.is_empty() {
            return Ok(st.ops.clone());
        }
        let pos = st.ops.iter().position(|o| o.op_id == tag);
        match pos {
            Some(p) => Ok(st.ops[p + 1..].to_vec()),
            None => Ok(st.ops.clone()),
        }
    }

    async fn diff(&self, stream: &str, _against: &str) -> MechanicsResult<String> {
        let st = self.state.lock().unwrap();
        let rec = st
            .streams
            .get(stream)
            .ok_or_else(|| MechanicsError::UnknownStream(stream.to_string()))?;
        Ok(rec
            .pending_files
            .keys()
            .map(|k| format!("+++ {k}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn changed_files(&self, stream: &str) -> MechanicsResult<Vec<String>> {
        let st = self.state.lock().unwrap();
        let rec = st
            .streams
            .get(stream)
            .ok_or_else(|| MechanicsError::UnknownStream(stream.to_string()))?;
        Ok(rec.pending_files.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_then_rollback_restores_prior_snapshot() {
        let m = FakeMechanics::new();
        let s1 = m.create_stream("r", "main", None).await.unwrap();
        m.commit(&s1, "/wt", "a", "agent").await.unwrap();
        let MergeOutcome::Merged { commit_hash: op1 } =
            m.merge_stream(&s1, "buffer").await.unwrap()
        else {
            panic!("expected merge")
        };

        let s2 = m.create_stream("r", "main", None).await.unwrap();
        m.commit(&s2, "/wt", "b", "agent").await.unwrap();
        m.merge_stream(&s2, "buffer").await.unwrap();

        assert_eq!(m.branch_files("buffer").len(), 2);
        m.rollback_to_operation(&op1).await.unwrap();
        assert_eq!(m.branch_files("buffer").len(), 1);
    }
}
