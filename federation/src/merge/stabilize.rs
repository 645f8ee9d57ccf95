//! Stabilization test execution (spec §4.7.4): runs the repo's configured
//! command against the buffer and classifies the result, with a bounded
//! number of retries to distinguish a flaky result from a consistently red
//! one. Grounded on the subprocess-with-timeout shape of
//! `coordination/src/harness/runner.rs` (not kept — that module belonged to
//! the dropped benchmark harness — but its timeout/classify pattern carries
//! over here).

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

const FLAKE_RETRIES: usize = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizationOutcome {
    Green,
    Red,
    Flaky,
    Timeout,
}

#[async_trait]
pub trait StabilizationRunner: Send + Sync {
    async fn run(&self, repo_id: &str, buffer_ref: &str) -> StabilizationOutcome;
}

/// Runs `repo.stabilize_command` as a subprocess via the shell, grounded on
/// the teacher's own external-command invocation in
/// `coordination/src/shell_safety.rs` (not reused verbatim — that module's
/// allowlist/sanitization concern belongs to the dropped agent-command
/// surface — but its "shell out, capture status" shape is what this mirrors).
pub struct CommandRunner {
    pub command: String,
    pub timeout: Duration,
}

impl CommandRunner {
    pub fn new(command: String) -> Self {
        Self {
            command,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl StabilizationRunner for CommandRunner {
    async fn run(&self, _repo_id: &str, buffer_ref: &str) -> StabilizationOutcome {
        if self.command.trim().is_empty() {
            return StabilizationOutcome::Green;
        }
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("GITSWARM_BUFFER_REF", buffer_ref);

        match timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) if status.success() => StabilizationOutcome::Green,
            Ok(Ok(_)) => StabilizationOutcome::Red,
            Ok(Err(_)) => StabilizationOutcome::Red,
            Err(_) => StabilizationOutcome::Timeout,
        }
    }
}

/// Run once; on red, retry up to `FLAKE_RETRIES` times. A timeout is
/// reported as-is (never retried — a hung run isn't a flake signal). A
/// green after at least one red retry is `Flaky`; consistent red across all
/// attempts is `Red`.
pub async fn run_with_flake_detection(
    runner: &dyn StabilizationRunner,
    repo_id: &str,
    buffer_ref: &str,
) -> StabilizationOutcome {
    let first = runner.run(repo_id, buffer_ref).await;
    if !matches!(first, StabilizationOutcome::Red) {
        return first;
    }

    let mut saw_green = false;
    for _ in 0..FLAKE_RETRIES {
        match runner.run(repo_id, buffer_ref).await {
            StabilizationOutcome::Green => saw_green = true,
            StabilizationOutcome::Timeout => return StabilizationOutcome::Timeout,
            StabilizationOutcome::Red | StabilizationOutcome::Flaky => {}
        }
    }

    if saw_green {
        StabilizationOutcome::Flaky
    } else {
        StabilizationOutcome::Red
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedRunner {
        outcomes: Vec<StabilizationOutcome>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StabilizationRunner for ScriptedRunner {
        async fn run(&self, _repo_id: &str, _buffer_ref: &str) -> StabilizationOutcome {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.get(i).copied().unwrap_or(StabilizationOutcome::Red)
        }
    }

    #[tokio::test]
    async fn consistent_red_is_red_after_retries() {
        let runner = ScriptedRunner {
            outcomes: vec![StabilizationOutcome::Red; 3],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let outcome = run_with_flake_detection(&runner, "r", "buffer").await;
        assert_eq!(outcome, StabilizationOutcome::Red);
    }

    #[tokio::test]
    async fn red_then_green_is_flaky() {
        let runner = ScriptedRunner {
            outcomes: vec![StabilizationOutcome::Red, StabilizationOutcome::Green],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let outcome = run_with_flake_detection(&runner, "r", "buffer").await;
        assert_eq!(outcome, StabilizationOutcome::Flaky);
    }

    #[tokio::test]
    async fn green_first_try_short_circuits() {
        let runner = ScriptedRunner {
            outcomes: vec![StabilizationOutcome::Green],
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let outcome = run_with_flake_detection(&runner, "r", "buffer").await;
        assert_eq!(outcome, StabilizationOutcome::Green);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }
}
