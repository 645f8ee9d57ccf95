//! Tier-1 plugin dispatch (spec §4.7.6): best-effort hooks run after a
//! merge, stabilization, or promotion completes. A plugin failure is logged
//! and never fails the triggering operation — Tier-1 plugins observe, they
//! do not gate. Grounded on the sequential, non-blocking hook-chain pattern
//! in `coordination/src/router/middleware.rs`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::StabilizationResult;

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_merge_completed(&self, _repo_id: &str, _stream_id: &str) -> Result<(), String> {
        Ok(())
    }

    async fn on_stabilization(&self, _repo_id: &str, _result: StabilizationResult) -> Result<(), String> {
        Ok(())
    }

    async fn on_promotion(&self, _repo_id: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub async fn dispatch_merge_completed(&self, repo_id: &str, stream_id: &str) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_merge_completed(repo_id, stream_id).await {
                tracing::warn!(plugin = plugin.name(), %err, "plugin failed on merge_completed");
            }
        }
    }

    pub async fn dispatch_stabilization(&self, repo_id: &str, result: StabilizationResult) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_stabilization(repo_id, result).await {
                tracing::warn!(plugin = plugin.name(), %err, "plugin failed on stabilization");
            }
        }
    }

    pub async fn dispatch_promotion(&self, repo_id: &str) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_promotion(repo_id).await {
                tracing::warn!(plugin = plugin.name(), %err, "plugin failed on promotion");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin(Arc<AtomicUsize>);

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }
        async fn on_merge_completed(&self, _repo_id: &str, _stream_id: &str) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_runs_every_registered_plugin() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = PluginRegistry::new(vec![Arc::new(CountingPlugin(count.clone()))]);
        registry.dispatch_merge_completed("r", "s").await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
