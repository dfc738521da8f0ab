//! Component health scoring.
//!
//! Health is a product of three factors: reliability (non-error
//! fraction of observed events), a latency factor (1.0 under the
//! threshold, 0.5 over it) and an activity factor (0.0 for detached
//! components). The monitor only stores what the periodic sweep feeds
//! it; observation gathering lives with the component wrapper.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::{
    config::HealthConfig,
    event::envelope::{EventEnvelope, EventOperation, EventPriority, ValidationResult},
    wrapper::ComponentType,
};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Component not found: {0}")]
    ComponentNotFound(String),
    #[error("Recovery failed for {component}: {message}")]
    RecoveryFailed { component: String, message: String },
}

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUsage {
    pub queue_depth: usize,
    pub active_correlations: usize,
    pub estimated_memory_bytes: u64,
}

/// Stored result of the latest check for one component.
#[derive(Debug, Clone)]
pub struct HealthEntry {
    pub component: String,
    pub component_type: ComponentType,
    pub status: HealthStatus,
    pub score: f64,
    pub last_check: DateTime<Utc>,
    /// Checks in a row that came back non-healthy.
    pub consecutive_failures: u32,
    pub latency_ms: f64,
    pub reliability: f64,
    pub resources: ResourceUsage,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HealthEntry {
    /// Canonical `monitoring:health` envelope fed back into the bus for
    /// non-healthy components.
    pub fn to_alert_envelope(&self) -> ValidationResult<EventEnvelope> {
        let priority = if self.status == HealthStatus::Unhealthy {
            EventPriority::Critical
        } else {
            EventPriority::High
        };
        EventEnvelope::builder()
            .source("health-monitor")
            .event_type("monitoring:health")
            .operation(EventOperation::Alert)
            .target_id(&self.component)
            .priority(priority)
            .detail("status", self.status.to_string())
            .detail("score", self.score)
            .detail("reliability", self.reliability)
            .detail("latency_ms", self.latency_ms)
            .detail("consecutive_failures", self.consecutive_failures)
            .build()
    }
}

/// Point-in-time view of a component, gathered by the caller.
#[derive(Debug, Clone)]
pub struct ComponentObservation {
    pub component: String,
    pub component_type: ComponentType,
    pub is_active: bool,
    pub events_seen: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub active_correlations: usize,
    pub queue_depth: usize,
    pub estimated_memory_bytes: u64,
}

/// Hook invoked when a component transitions into `Unhealthy` and
/// auto-recovery is enabled. Errors are logged and absorbed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(&self, component: &str, entry: &HealthEntry) -> HealthResult<()>;
}

pub struct HealthMonitor {
    entries: Arc<DashMap<String, HealthEntry>>,
    config: HealthConfig,
    recovery: RwLock<Option<Arc<dyn RecoveryHandler>>>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config: config.clone(),
            recovery: RwLock::new(None),
        }
    }

    pub async fn set_recovery(&self, handler: Arc<dyn RecoveryHandler>) {
        *self.recovery.write().await = Some(handler);
    }

    fn threshold_for(&self, component: &str) -> f64 {
        self.config
            .component_thresholds
            .get(component)
            .copied()
            .unwrap_or(self.config.default_threshold)
    }

    /// Scores one observation, stores the resulting entry and fires the
    /// recovery hook on a transition into `Unhealthy`.
    pub async fn evaluate(&self, observation: &ComponentObservation) -> HealthEntry {
        let threshold = self.threshold_for(&observation.component);

        let reliability = if observation.events_seen == 0 {
            1.0
        } else {
            1.0 - (observation.error_count as f64 / observation.events_seen as f64)
        };
        let latency_threshold_ms = self.config.latency_threshold.as_secs_f64() * 1000.0;
        let latency_factor = if observation.avg_latency_ms <= latency_threshold_ms {
            1.0
        } else {
            0.5
        };
        let activity_factor = if observation.is_active { 1.0 } else { 0.0 };
        let score = reliability * latency_factor * activity_factor;

        let status = if score >= threshold {
            HealthStatus::Healthy
        } else if score >= threshold * 0.7 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        let previous = self
            .entries
            .get(&observation.component)
            .map(|e| (e.status, e.consecutive_failures));
        let consecutive_failures = match (previous, status) {
            (_, HealthStatus::Healthy) => 0,
            (Some((_, n)), _) => n + 1,
            (None, _) => 1,
        };
        let became_unhealthy = status == HealthStatus::Unhealthy
            && previous
                .map(|(prev_status, _)| prev_status != HealthStatus::Unhealthy)
                .unwrap_or(true);

        let entry = HealthEntry {
            component: observation.component.clone(),
            component_type: observation.component_type.clone(),
            status,
            score,
            last_check: Utc::now(),
            consecutive_failures,
            latency_ms: observation.avg_latency_ms,
            reliability,
            resources: ResourceUsage {
                queue_depth: observation.queue_depth,
                active_correlations: observation.active_correlations,
                estimated_memory_bytes: observation.estimated_memory_bytes,
            },
            metadata: HashMap::from([
                (
                    "events_seen".to_string(),
                    serde_json::json!(observation.events_seen),
                ),
                (
                    "error_count".to_string(),
                    serde_json::json!(observation.error_count),
                ),
            ]),
        };
        self.entries
            .insert(observation.component.clone(), entry.clone());
        debug!(
            component = %entry.component,
            status = %entry.status,
            score = entry.score,
            "health evaluated"
        );

        if became_unhealthy && self.config.auto_recovery {
            let handler = self.recovery.read().await.clone();
            if let Some(handler) = handler {
                if let Err(e) = handler.recover(&entry.component, &entry).await {
                    error!(component = %entry.component, error = %e, "recovery hook failed");
                }
            }
        }
        entry
    }

    /// Evaluates every observation and returns the fresh entries.
    pub async fn check_all(
        &self,
        observations: &[ComponentObservation],
    ) -> HashMap<String, HealthEntry> {
        let mut result = HashMap::new();
        for observation in observations {
            let entry = self.evaluate(observation).await;
            result.insert(entry.component.clone(), entry);
        }
        result
    }

    pub fn get(&self, component: &str) -> Option<HealthEntry> {
        self.entries.get(component).map(|e| e.clone())
    }

    pub fn entries(&self) -> Vec<HealthEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    pub fn remove(&self, component: &str) -> Option<HealthEntry> {
        self.entries.remove(component).map(|(_, entry)| entry)
    }

    /// Worst status across stored entries; `Healthy` when none exist.
    pub fn overall(&self) -> HealthStatus {
        let mut overall = HealthStatus::Healthy;
        for entry in self.entries.iter() {
            match entry.status {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Degraded | HealthStatus::Unknown => {
                    overall = HealthStatus::Degraded;
                }
                HealthStatus::Healthy => {}
            }
        }
        overall
    }
}
