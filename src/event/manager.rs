//! The event layer facade.
//!
//! One `EventManager` owns a subscription registry, a dispatcher, the
//! correlation engine, the health monitor, the metrics collector and
//! the component wrapper, and runs the periodic tasks that keep them
//! current. Everything an adapter needs goes through this type.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{interval_at, timeout},
};
use tracing::{debug, info, warn};

use crate::config::EventLayerConfig;
use crate::correlation::{CorrelationEngine, CorrelationRecord};
use crate::event::dispatch::{DispatchOutcome, Dispatcher, EmitError, EmitResult};
use crate::event::envelope::{EventEnvelope, EventOperation, EventPriority};
use crate::event::subscription::{
    EventFilter, EventTransform, ListenerFn, ListenerResult, SubscribeOptions,
    SubscriptionRegistry, SubscriptionResult, TypePattern,
};
use crate::health::{
    ComponentObservation, HealthEntry, HealthError, HealthMonitor, HealthResult, HealthStatus,
    RecoveryHandler,
};
use crate::metrics::{EmitSample, MetricsCollector, MetricsSnapshot, ResourceGauges};
use crate::wrapper::{ComponentStats, ComponentWrapper, ForwardFn, NotificationSource, WrapResult};

/// Per-emit overrides. Fields left `None` keep what the envelope and
/// the layer configuration already say.
#[derive(Default, Clone)]
pub struct EmitOptions {
    pub priority: Option<EventPriority>,
    pub correlation_id: Option<String>,
    pub timeout: Option<Duration>,
}

/// What happened to one emitted envelope.
#[derive(Debug, Clone)]
pub struct EmitReceipt {
    pub event_id: String,
    pub outcome: DispatchOutcome,
    pub latency: Duration,
}

/// Per-event results of an `emit_batch` call.
#[derive(Debug)]
pub struct BatchReceipt {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<EmitResult<EmitReceipt>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuerySort {
    #[default]
    Timestamp,
    Priority,
}

/// History query: filter, sort, paginate.
#[derive(Default, Clone)]
pub struct QueryOptions {
    /// Exact type or single-level wildcard, like subscriptions.
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub min_priority: Option<EventPriority>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub sort: QuerySort,
    pub descending: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Snapshot returned by [`EventManager::health_check`].
#[derive(Debug, Clone)]
pub struct ManagerHealth {
    pub status: HealthStatus,
    pub running: bool,
    pub uptime: Duration,
    pub subscriptions: usize,
    pub attached_components: usize,
    pub active_correlations: usize,
    pub components: HashMap<String, HealthEntry>,
    pub metrics: MetricsSnapshot,
}

pub struct EventManager {
    name: String,
    config: EventLayerConfig,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    correlation: Arc<CorrelationEngine>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    wrapper: Arc<ComponentWrapper>,
    history: Arc<RwLock<VecDeque<EventEnvelope>>>,
    running: Arc<AtomicBool>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    emitted: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_weak: Weak<EventManager>,
}

impl EventManager {
    /// Builds a stopped manager. Fails when a configured completion
    /// pattern does not parse.
    pub fn new(name: impl Into<String>, config: EventLayerConfig) -> crate::error::Result<Arc<Self>> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), &config.processing));
        let correlation = Arc::new(CorrelationEngine::new(&config.correlation)?);
        let health = Arc::new(HealthMonitor::new(&config.health));
        let metrics = Arc::new(MetricsCollector::new(&config.monitoring));
        let name = name.into();

        Ok(Arc::new_cyclic(|weak: &Weak<EventManager>| {
            let forward = forward_into(weak.clone());
            Self {
                name,
                config,
                registry,
                dispatcher,
                correlation,
                health,
                metrics,
                wrapper: Arc::new(ComponentWrapper::new(forward)),
                history: Arc::new(RwLock::new(VecDeque::new())),
                running: Arc::new(AtomicBool::new(false)),
                started_at: RwLock::new(None),
                emitted: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
                self_weak: weak.clone(),
            }
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the layer: drain task, correlation sweep, health sweep,
    /// maintenance. Idempotent. Announces itself with a lifecycle
    /// envelope once running.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.write().await = Some(Utc::now());

        self.dispatcher.start().await;
        self.correlation.start().await;

        let mut tasks = self.tasks.lock().await;
        if self.config.health.enabled {
            tasks.push(self.spawn_health_sweep());
        }
        if self.config.monitoring.enabled {
            tasks.push(self.spawn_maintenance());
        }
        drop(tasks);

        info!(manager = %self.name, strategy = %self.config.processing.strategy,
            "event layer started");
        self.emit_lifecycle(EventOperation::Start).await;
    }

    /// Announces the stop, then halts the periodic tasks and delivers
    /// whatever is still parked on the queue or batch buffer.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.emit_lifecycle(EventOperation::Stop).await;
        self.running.store(false, Ordering::SeqCst);

        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.correlation.stop().await;
        self.dispatcher.stop().await;
        *self.started_at.write().await = None;
        info!(manager = %self.name, "event layer stopped");
    }

    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }

    /// Emits one envelope with default options.
    pub async fn emit(&self, envelope: EventEnvelope) -> EmitResult<EmitReceipt> {
        self.emit_with(envelope, &EmitOptions::default()).await
    }

    /// Validates, dispatches under the emission deadline, then feeds
    /// correlation, metrics and the history ring.
    pub async fn emit_with(
        &self,
        mut envelope: EventEnvelope,
        options: &EmitOptions,
    ) -> EmitResult<EmitReceipt> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EmitError::NotRunning);
        }
        if let Some(priority) = options.priority {
            envelope.priority = priority;
        }
        if let Some(correlation_id) = &options.correlation_id {
            envelope.correlation_id = Some(correlation_id.clone());
        }
        if let Err(e) = envelope.validate() {
            self.record_sample(&envelope.event_type, Duration::ZERO, false).await;
            return Err(e.into());
        }

        let deadline = options
            .timeout
            .unwrap_or(self.config.processing.emit_timeout);
        let started = Instant::now();
        let dispatched = timeout(deadline, self.dispatcher.dispatch(envelope.clone())).await;
        let latency = started.elapsed();

        let outcome = match dispatched {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.record_sample(&envelope.event_type, latency, false).await;
                return Err(e);
            }
            Err(_) => {
                self.record_sample(&envelope.event_type, latency, false).await;
                return Err(EmitError::Timeout(deadline));
            }
        };

        let success = match outcome {
            DispatchOutcome::Delivered(stats) => stats.failed == 0,
            DispatchOutcome::Flushed { stats, .. } => stats.failed == 0,
            DispatchOutcome::Enqueued { .. } | DispatchOutcome::Buffered { .. } => true,
        };
        self.correlation.correlate(&envelope);
        self.record_sample(&envelope.event_type, latency, success).await;
        self.push_history(envelope.clone()).await;
        self.emitted.fetch_add(1, Ordering::SeqCst);
        debug!(manager = %self.name, event_id = %envelope.id,
            event_type = %envelope.event_type, "event emitted");

        Ok(EmitReceipt {
            event_id: envelope.id,
            outcome,
            latency,
        })
    }

    /// Emits each envelope in order with shared options; one rejection
    /// does not stop the rest.
    pub async fn emit_batch(
        &self,
        envelopes: Vec<EventEnvelope>,
        options: &EmitOptions,
    ) -> BatchReceipt {
        let mut results = Vec::with_capacity(envelopes.len());
        let mut accepted = 0;
        let mut rejected = 0;
        for envelope in envelopes {
            match self.emit_with(envelope, options).await {
                Ok(receipt) => {
                    accepted += 1;
                    results.push(Ok(receipt));
                }
                Err(e) => {
                    warn!(manager = %self.name, error = %e, "batch emit item rejected");
                    rejected += 1;
                    results.push(Err(e));
                }
            }
        }
        BatchReceipt {
            accepted,
            rejected,
            results,
        }
    }

    /// Total envelopes accepted since construction.
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }

    // ---- subscriptions -------------------------------------------------

    pub fn subscribe(
        &self,
        patterns: &[&str],
        listener: ListenerFn,
        options: SubscribeOptions,
    ) -> String {
        self.registry.subscribe(patterns, listener, options)
    }

    /// Convenience wrapper for async closures.
    pub fn subscribe_fn<F, Fut>(&self, patterns: &[&str], f: F) -> String
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        let listener: ListenerFn = Arc::new(move |envelope| f(envelope).boxed());
        self.registry
            .subscribe(patterns, listener, SubscribeOptions::default())
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn unsubscribe_all(&self, pattern: Option<&str>) -> usize {
        self.registry.unsubscribe_all(pattern)
    }

    pub fn add_filter(&self, id: &str, filter: EventFilter) -> SubscriptionResult<()> {
        self.registry.add_filter(id, filter)
    }

    pub fn add_transform(&self, id: &str, transform: EventTransform) -> SubscriptionResult<()> {
        self.registry.add_transform(id, transform)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    // ---- component wrapping --------------------------------------------

    pub async fn attach(
        &self,
        source: Arc<dyn NotificationSource>,
        mappings: HashMap<String, String>,
    ) -> WrapResult<()> {
        self.wrapper.attach(source, mappings).await
    }

    pub async fn attach_all(
        &self,
        batch: Vec<(Arc<dyn NotificationSource>, HashMap<String, String>)>,
    ) -> usize {
        self.wrapper.attach_all(batch).await
    }

    pub async fn detach(&self, name: &str) -> WrapResult<()> {
        self.wrapper.detach(name).await
    }

    pub async fn component_stats(&self) -> Vec<ComponentStats> {
        self.wrapper.stats().await
    }

    // ---- correlation ---------------------------------------------------

    pub fn get_correlation(&self, correlation_id: &str) -> Option<CorrelationRecord> {
        self.correlation.get_correlation(correlation_id)
    }

    pub fn active_correlations(&self) -> Vec<CorrelationRecord> {
        self.correlation.list_active()
    }

    // ---- health and metrics --------------------------------------------

    pub async fn set_recovery(&self, handler: Arc<dyn RecoveryHandler>) {
        self.health.set_recovery(handler).await;
    }

    /// Re-scores every wrapped component and reports the layer's
    /// overall state.
    pub async fn health_check(&self) -> ManagerHealth {
        let observations = self.observations().await;
        let components = self.health.check_all(&observations).await;
        let status = if self.running.load(Ordering::SeqCst) {
            self.health.overall()
        } else {
            HealthStatus::Unknown
        };
        let uptime = match *self.started_at.read().await {
            Some(started) => (Utc::now() - started).to_std().unwrap_or_default(),
            None => Duration::ZERO,
        };
        ManagerHealth {
            status,
            running: self.running.load(Ordering::SeqCst),
            uptime,
            subscriptions: self.registry.len(),
            attached_components: self.wrapper.len(),
            active_correlations: self.correlation.list_active().len(),
            components,
            metrics: self.get_metrics().await,
        }
    }

    /// Scores a single wrapped component.
    pub async fn check_component(&self, name: &str) -> HealthResult<HealthEntry> {
        let observation = self
            .observations()
            .await
            .into_iter()
            .find(|o| o.component == name)
            .ok_or_else(|| HealthError::ComponentNotFound(name.to_string()))?;
        Ok(self.health.evaluate(&observation).await)
    }

    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let gauges = self.gauges().await;
        self.metrics.snapshot(&gauges).await
    }

    /// One pass of the periodic health sweep: re-score everything and
    /// emit an alert envelope for each non-Healthy component.
    pub async fn run_health_sweep(&self) {
        let observations = self.observations().await;
        if observations.is_empty() {
            return;
        }
        let entries = self.health.check_all(&observations).await;
        for entry in entries.values() {
            if entry.status == HealthStatus::Healthy {
                continue;
            }
            match entry.to_alert_envelope() {
                Ok(alert) => {
                    if let Err(e) = self.emit(alert).await {
                        debug!(manager = %self.name, component = %entry.component,
                            error = %e, "health alert not emitted");
                    }
                }
                Err(e) => {
                    warn!(manager = %self.name, component = %entry.component,
                        error = %e, "health alert envelope invalid")
                }
            }
        }
    }

    // ---- history -------------------------------------------------------

    /// Queries the bounded history ring.
    pub async fn query(&self, options: &QueryOptions) -> Vec<EventEnvelope> {
        let pattern = options.event_type.as_deref().map(TypePattern::new);
        let mut matches: Vec<EventEnvelope> = {
            let history = self.history.read().await;
            history
                .iter()
                .filter(|envelope| query_matches(envelope, options, pattern.as_ref()))
                .cloned()
                .collect()
        };
        match options.sort {
            QuerySort::Timestamp => matches.sort_by_key(|e| e.timestamp),
            QuerySort::Priority => matches.sort_by_key(|e| e.priority),
        }
        if options.descending {
            matches.reverse();
        }
        matches
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    // ---- internals -----------------------------------------------------

    async fn emit_lifecycle(&self, operation: EventOperation) {
        let envelope = EventEnvelope::builder()
            .source(&self.name)
            .event_type("uel:manager")
            .operation(operation)
            .target_id(&self.name)
            .detail("manager", self.name.clone())
            .build();
        match envelope {
            Ok(envelope) => {
                if let Err(e) = self.emit(envelope).await {
                    warn!(manager = %self.name, error = %e, "lifecycle event not emitted");
                }
            }
            Err(e) => warn!(manager = %self.name, error = %e, "lifecycle envelope invalid"),
        }
    }

    async fn record_sample(&self, event_type: &str, latency: Duration, success: bool) {
        if self.config.monitoring.enabled {
            self.metrics
                .record(EmitSample::new(event_type, latency, success))
                .await;
        }
    }

    async fn push_history(&self, envelope: EventEnvelope) {
        let mut history = self.history.write().await;
        history.push_back(envelope);
        while history.len() > self.config.monitoring.history_limit {
            history.pop_front();
        }
    }

    async fn gauges(&self) -> ResourceGauges {
        ResourceGauges {
            queue_size: self.dispatcher.queue_depth().await + self.dispatcher.pending_batch().await,
            subscriptions: self.registry.len(),
            correlation_members: self.correlation.member_count(),
            history_len: self.history.read().await.len(),
        }
    }

    async fn observations(&self) -> Vec<ComponentObservation> {
        let stats = self.wrapper.stats().await;
        if stats.is_empty() {
            return Vec::new();
        }
        let queue_depth =
            self.dispatcher.queue_depth().await + self.dispatcher.pending_batch().await;
        let memory = self.get_metrics().await.estimated_memory_bytes;
        stats
            .into_iter()
            .map(|s| {
                let active_correlations = self.correlation.active_count_for(&s.component);
                ComponentObservation {
                    component: s.component,
                    component_type: s.component_type,
                    is_active: s.is_active,
                    events_seen: s.events_seen,
                    error_count: s.error_count,
                    avg_latency_ms: s.avg_latency_ms,
                    active_correlations,
                    queue_depth,
                    estimated_memory_bytes: memory,
                }
            })
            .collect()
    }

    fn spawn_health_sweep(&self) -> JoinHandle<()> {
        let weak = self.self_weak.clone();
        let running = self.running.clone();
        let period = self.config.health.check_interval;
        tokio::spawn(async move {
            // First sweep a full period after start, not on spawn.
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.run_health_sweep().await;
            }
        })
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak = self.self_weak.clone();
        let running = self.running.clone();
        let period = self.config.monitoring.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.run_maintenance().await;
            }
        })
    }

    async fn run_maintenance(&self) {
        self.metrics.prune().await;
        let trimmed = {
            let mut history = self.history.write().await;
            let excess = history
                .len()
                .saturating_sub(self.config.monitoring.history_limit);
            for _ in 0..excess {
                history.pop_front();
            }
            excess
        };
        debug!(manager = %self.name, trimmed, "maintenance sweep");
    }
}

fn forward_into(weak: Weak<EventManager>) -> ForwardFn {
    Arc::new(move |envelope| {
        let weak = weak.clone();
        async move {
            match weak.upgrade() {
                Some(manager) => manager.emit(envelope).await.is_ok(),
                None => false,
            }
        }
        .boxed()
    })
}

fn query_matches(
    envelope: &EventEnvelope,
    options: &QueryOptions,
    pattern: Option<&TypePattern>,
) -> bool {
    if let Some(pattern) = pattern {
        if !pattern.matches(&envelope.event_type) {
            return false;
        }
    }
    if let Some(source) = &options.source {
        if source != &envelope.source {
            return false;
        }
    }
    if let Some(min) = options.min_priority {
        if envelope.priority < min {
            return false;
        }
    }
    if let Some(correlation_id) = &options.correlation_id {
        if envelope.correlation_id.as_ref() != Some(correlation_id) {
            return false;
        }
    }
    if let Some(since) = options.since {
        if envelope.timestamp < since {
            return false;
        }
    }
    if let Some(until) = options.until {
        if envelope.timestamp > until {
            return false;
        }
    }
    true
}
