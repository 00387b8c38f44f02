//! Metrics and observability

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Build engine metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetrics {
    /// Time since the engine was created (seconds)
    pub uptime_seconds: u64,

    /// Builds started
    pub builds_started: u64,

    /// Builds that produced an image
    pub builds_completed: u64,

    /// Builds that aborted with an error
    pub builds_failed: u64,

    /// Steps served from the layer cache
    pub cache_hits: u64,

    /// Steps that had to be executed
    pub cache_misses: u64,

    /// RUN commands handed to the sandbox
    pub run_executions: u64,

    /// Layers evicted from memory
    pub evictions: u64,

    /// Layers currently held in memory
    pub cached_layers: usize,
}

impl BuildMetrics {
    /// Fraction of steps served from cache, 0.0 when nothing ran yet.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Metrics collector
#[derive(Clone)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<BuildMetrics>>,
    start_time: chrono::DateTime<chrono::Utc>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(BuildMetrics::default())),
            start_time: chrono::Utc::now(),
        }
    }

    /// Get current metrics
    pub async fn get_metrics(&self) -> BuildMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.uptime_seconds = (chrono::Utc::now() - self.start_time)
            .num_seconds()
            .max(0) as u64;
        metrics
    }

    pub async fn build_started(&self) {
        self.metrics.write().await.builds_started += 1;
    }

    /// Record the end of a build.
    pub async fn build_finished(&self, success: bool) {
        let mut metrics = self.metrics.write().await;
        if success {
            metrics.builds_completed += 1;
        } else {
            metrics.builds_failed += 1;
        }
    }

    /// Record one step's cache outcome.
    pub async fn record_step(&self, cache_hit: bool) {
        let mut metrics = self.metrics.write().await;
        if cache_hit {
            metrics.cache_hits += 1;
        } else {
            metrics.cache_misses += 1;
        }
    }

    pub async fn add_run_execution(&self) {
        self.metrics.write().await.run_executions += 1;
    }

    /// Update cache occupancy
    pub async fn set_cache_state(&self, cached_layers: usize, evictions: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.cached_layers = cached_layers;
        metrics.evictions = evictions;
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
