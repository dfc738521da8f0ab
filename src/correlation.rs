//! Correlation tracking across envelopes that share a correlation id.
//!
//! Each id maps to one record accumulating its member events. Records
//! move from `Active` to exactly one terminal state: `Completed` when a
//! configured pattern is satisfied, `Failed` when a member reports
//! failure, `Timeout` when the TTL sweep finds the record idle past its
//! TTL. Terminal records stay readable until the following sweep evicts
//! them; a reused id after eviction starts a fresh record.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use strum_macros::Display;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    config::CorrelationConfig,
    event::envelope::{EventEnvelope, EventOperation},
};

#[derive(Debug, Error, PartialEq)]
pub enum CorrelationError {
    #[error("Invalid completion pattern: {0}")]
    InvalidPattern(String),
}

pub type CorrelationResult<T> = Result<T, CorrelationError>;

/// Completion rule parsed from a `"typeA->typeB"` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionPattern {
    pub from_type: String,
    pub to_type: String,
}

impl CompletionPattern {
    pub fn parse(raw: &str) -> CorrelationResult<Self> {
        let (from_type, to_type) = raw
            .split_once("->")
            .ok_or_else(|| CorrelationError::InvalidPattern(raw.to_string()))?;
        let from_type = from_type.trim();
        let to_type = to_type.trim();
        if from_type.is_empty() || to_type.is_empty() {
            return Err(CorrelationError::InvalidPattern(raw.to_string()));
        }
        Ok(Self {
            from_type: from_type.to_string(),
            to_type: to_type.to_string(),
        })
    }

    /// Lenient containment check: both endpoint types present anywhere
    /// in the record history, in any order, multiplicity ignored.
    fn satisfied_by(&self, record: &CorrelationRecord) -> bool {
        let mut has_from = false;
        let mut has_to = false;
        for event in &record.events {
            if event.event_type == self.from_type {
                has_from = true;
            }
            if event.event_type == self.to_type {
                has_to = true;
            }
        }
        has_from && has_to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum CorrelationStatus {
    #[default]
    Active,
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationPerformance {
    pub total_latency_ms: f64,
    /// Average of a time-decay score and the non-failure fraction of
    /// the member events, in `[0, 1]`.
    pub efficiency: f64,
    /// Fraction of the member-event capacity in use.
    pub resource_utilization: f64,
}

#[derive(Debug, Clone)]
pub struct CorrelationRecord {
    pub correlation_id: String,
    /// Member events in arrival order, capped at the configured depth
    /// (oldest evicted first).
    pub events: Vec<EventEnvelope>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub related_agents: HashSet<String>,
    pub related_tasks: HashSet<String>,
    pub related_components: HashSet<String>,
    /// Operation of the first member event.
    pub operation: EventOperation,
    pub status: CorrelationStatus,
    pub performance: CorrelationPerformance,
}

impl CorrelationRecord {
    fn new(correlation_id: String, operation: EventOperation) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            events: Vec::new(),
            start_time: now,
            last_update: now,
            related_agents: HashSet::new(),
            related_tasks: HashSet::new(),
            related_components: HashSet::new(),
            operation,
            status: CorrelationStatus::Active,
            performance: CorrelationPerformance::default(),
        }
    }

    fn merge_entities(&mut self, envelope: &EventEnvelope) {
        self.related_components.insert(envelope.source.clone());
        if let Some(serde_json::Value::String(agent)) = envelope.details.get("agent_id") {
            self.related_agents.insert(agent.clone());
        }
        if let Some(serde_json::Value::String(task)) = envelope.details.get("task_id") {
            self.related_tasks.insert(task.clone());
        }
        if let Some(serde_json::Value::String(component)) = envelope.details.get("component") {
            self.related_components.insert(component.clone());
        }
    }

    fn recompute_performance(&mut self, horizon: Duration, max_depth: usize) {
        let age = (self.last_update - self.start_time).to_std().unwrap_or_default();
        self.performance.total_latency_ms = age.as_secs_f64() * 1000.0;

        let time_score = if age.is_zero() {
            1.0
        } else {
            (horizon.as_secs_f64() / age.as_secs_f64()).min(1.0)
        };
        let total = self.events.len();
        let failures = self.events.iter().filter(|e| e.is_failure()).count();
        let success_fraction = if total == 0 {
            1.0
        } else {
            (total - failures) as f64 / total as f64
        };
        self.performance.efficiency = (time_score + success_fraction) / 2.0;
        self.performance.resource_utilization = if max_depth == 0 {
            0.0
        } else {
            (total as f64 / max_depth as f64).min(1.0)
        };
    }
}

/// Tracks correlation records and runs the periodic TTL sweep.
pub struct CorrelationEngine {
    records: Arc<DashMap<String, CorrelationRecord>>,
    patterns: Vec<CompletionPattern>,
    config: CorrelationConfig,
    running: Arc<AtomicBool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CorrelationEngine {
    /// Builds an engine, parsing the configured completion patterns.
    pub fn new(config: &CorrelationConfig) -> CorrelationResult<Self> {
        let patterns = config
            .completion_patterns
            .iter()
            .map(|raw| CompletionPattern::parse(raw))
            .collect::<CorrelationResult<Vec<_>>>()?;
        Ok(Self {
            records: Arc::new(DashMap::new()),
            patterns,
            config: config.clone(),
            running: Arc::new(AtomicBool::new(false)),
            sweep_handle: Mutex::new(None),
        })
    }

    /// Folds one observed envelope into its correlation record.
    /// Envelopes without a correlation id are ignored, as are updates
    /// to records already in a terminal state.
    pub fn correlate(&self, envelope: &EventEnvelope) {
        if !self.config.enabled {
            return;
        }
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            return;
        };

        let mut record = self
            .records
            .entry(correlation_id.clone())
            .or_insert_with(|| {
                debug!(correlation_id = %correlation_id, "correlation opened");
                CorrelationRecord::new(correlation_id.clone(), envelope.operation.clone())
            });

        if record.status != CorrelationStatus::Active {
            return;
        }

        record.events.push(envelope.clone());
        if record.events.len() > self.config.max_depth {
            let excess = record.events.len() - self.config.max_depth;
            record.events.drain(..excess);
        }
        record.last_update = Utc::now();
        record.merge_entities(envelope);

        if envelope.operation == EventOperation::Fail {
            record.status = CorrelationStatus::Failed;
            debug!(correlation_id = %record.correlation_id, "correlation failed");
        } else if self.patterns.iter().any(|p| p.satisfied_by(&record)) {
            record.status = CorrelationStatus::Completed;
            debug!(correlation_id = %record.correlation_id, "correlation completed");
        }
        record.recompute_performance(self.config.time_horizon, self.config.max_depth);
    }

    pub fn get_correlation(&self, correlation_id: &str) -> Option<CorrelationRecord> {
        self.records.get(correlation_id).map(|r| r.clone())
    }

    pub fn list_active(&self) -> Vec<CorrelationRecord> {
        self.records
            .iter()
            .filter(|r| r.status == CorrelationStatus::Active)
            .map(|r| r.clone())
            .collect()
    }

    /// Active correlations that involve the given component.
    pub fn active_count_for(&self, component: &str) -> usize {
        self.records
            .iter()
            .filter(|r| {
                r.status == CorrelationStatus::Active
                    && r.related_components.contains(component)
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total member events across all records, for the memory gauge.
    pub fn member_count(&self) -> usize {
        self.records.iter().map(|r| r.events.len()).sum()
    }

    /// One sweep pass: idle Active records past the TTL are marked
    /// `Timeout`; records already terminal are evicted. A record marked
    /// on this pass is therefore evicted on the next one.
    pub fn sweep(&self) {
        sweep_records(&self.records, self.config.ttl);
    }

    /// Spawns the periodic sweep task. No-op when correlation is
    /// disabled or the task is already running.
    pub async fn start(&self) {
        if !self.config.enabled || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = self.running.clone();
        let records = self.records.clone();
        let ttl = self.config.ttl;
        let sweep_interval = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(sweep_interval);
            while running.load(Ordering::SeqCst) {
                interval_timer.tick().await;
                sweep_records(&records, ttl);
            }
        });
        *self.sweep_handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            handle.abort();
        }
    }
}

// Keys are collected before any mutation so no shard lock is held
// across a removal.
fn sweep_records(records: &DashMap<String, CorrelationRecord>, ttl: Duration) {
    let now = Utc::now();
    let mut timed_out: Vec<String> = Vec::new();
    let mut evict: Vec<String> = Vec::new();
    for entry in records.iter() {
        match entry.status {
            CorrelationStatus::Active => {
                let idle = (now - entry.last_update).to_std().unwrap_or_default();
                if idle > ttl {
                    timed_out.push(entry.correlation_id.clone());
                }
            }
            _ => evict.push(entry.correlation_id.clone()),
        }
    }
    for id in timed_out {
        if let Some(mut record) = records.get_mut(&id) {
            if record.status == CorrelationStatus::Active {
                record.status = CorrelationStatus::Timeout;
                warn!(correlation_id = %id, "correlation timed out");
            }
        }
    }
    for id in evict {
        records.remove(&id);
        debug!(correlation_id = %id, "terminal correlation evicted");
    }
}
