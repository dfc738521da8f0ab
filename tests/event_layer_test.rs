use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::{sync::Mutex, time::sleep};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use uel_core::config::EventLayerConfig;
use uel_core::correlation::CorrelationStatus;
use uel_core::event::dispatch::{DispatchOutcome, EmitError, ProcessingStrategy};
use uel_core::event::subscription::{ListenerFn, SubscribeOptions};
use uel_core::health::HealthStatus;
use uel_core::wrapper::{
    ComponentType, NativeEvent, NativeHandler, NotificationSource, WrapResult,
};
use uel_core::{
    Error, EventEnvelope, EventManager, EventOperation, EventPriority, ManagerRegistry,
    QueryOptions, QuerySort,
};

#[ctor::ctor]
fn init() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Collects every delivered envelope behind a mutex.
#[derive(Clone, Default)]
struct EventCollector {
    events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl EventCollector {
    fn listener(&self) -> ListenerFn {
        let events = self.events.clone();
        Arc::new(move |envelope| {
            let events = events.clone();
            async move {
                events.lock().await.push(envelope);
                Ok(())
            }
            .boxed()
        })
    }

    async fn collected(&self) -> Vec<EventEnvelope> {
        self.events.lock().await.clone()
    }
}

/// Stand-in for a pre-existing component with its own callback bus.
struct LegacyScheduler {
    name: String,
    handlers: DashMap<String, NativeHandler>,
}

impl LegacyScheduler {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            handlers: DashMap::new(),
        })
    }

    async fn fire(&self, event: &str, payload: HashMap<String, serde_json::Value>) {
        let handler = self.handlers.get(event).map(|entry| entry.value().clone());
        if let Some(handler) = handler {
            handler(NativeEvent {
                name: event.to_string(),
                payload,
            })
            .await;
        }
    }
}

#[async_trait]
impl NotificationSource for LegacyScheduler {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Coordinator
    }

    async fn subscribe_native(&self, event: &str, handler: NativeHandler) -> WrapResult<()> {
        self.handlers.insert(event.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe_native(&self, event: &str) -> WrapResult<()> {
        self.handlers.remove(event);
        Ok(())
    }
}

fn load_event(n: usize) -> EventEnvelope {
    EventEnvelope::builder()
        .source("generator")
        .event_type("load:spike")
        .operation(EventOperation::Update)
        .target_id(&format!("spike-{n}"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_native_events_cross_into_canonical_envelopes() -> Result<(), Error> {
    let manager = EventManager::new("edge", EventLayerConfig::default())?;
    manager.start().await;

    let collector = EventCollector::default();
    manager.subscribe(&["sys:*"], collector.listener(), SubscribeOptions::default());

    let scheduler = LegacyScheduler::new("scheduler-7");
    let mappings = HashMap::from([("started".to_string(), "sys:lifecycle".to_string())]);
    manager.attach(scheduler.clone(), mappings).await?;

    let payload = HashMap::from([
        ("id".to_string(), serde_json::json!("job-42")),
        ("region".to_string(), serde_json::json!("eu-west")),
    ]);
    scheduler.fire("started", payload).await;
    sleep(Duration::from_millis(50)).await;

    let events = collector.collected().await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.event_type, "sys:lifecycle");
    assert_eq!(event.source, "scheduler-7");
    assert_eq!(event.operation, EventOperation::Start);
    assert_eq!(event.target_id, "job-42");
    // "sys" has no entry in the priority table.
    assert_eq!(event.priority, EventPriority::Medium);
    assert_eq!(
        event.details.get("region"),
        Some(&serde_json::json!("eu-west"))
    );

    let stats = manager.component_stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].component, "scheduler-7");
    assert_eq!(stats[0].events_seen, 1);
    assert_eq!(stats[0].error_count, 0);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_emit_is_rejected_outside_the_running_window() {
    let manager = EventManager::new("gate", EventLayerConfig::default()).unwrap();

    let before = manager.emit(load_event(0)).await;
    assert!(matches!(before, Err(EmitError::NotRunning)));

    manager.start().await;
    assert!(manager.is_running());
    assert!(manager.emit(load_event(1)).await.is_ok());

    manager.stop().await;
    assert!(!manager.is_running());
    let after = manager.emit(load_event(2)).await;
    assert!(matches!(after, Err(EmitError::NotRunning)));
}

#[tokio::test]
async fn test_queued_strategy_applies_backpressure() -> Result<(), Error> {
    let mut config = EventLayerConfig::default();
    config.processing.strategy = ProcessingStrategy::Queued;
    config.processing.queue_capacity = 4;
    // Long enough that only the immediate first drain tick runs.
    config.processing.drain_interval = Duration::from_secs(5);
    let manager = EventManager::new("queued", config)?;
    manager.start().await;

    let collector = EventCollector::default();
    manager.subscribe(&["load:*"], collector.listener(), SubscribeOptions::default());

    // Let the first tick clear the start lifecycle event out of the queue.
    sleep(Duration::from_millis(50)).await;

    for n in 0..4 {
        manager.emit(load_event(n)).await?;
    }
    let overflow = manager.emit(load_event(99)).await;
    assert!(matches!(overflow, Err(EmitError::QueueFull(4))));
    assert!(collector.collected().await.is_empty());

    // Stop flushes whatever is still queued.
    manager.stop().await;
    let drained = collector.collected().await;
    assert_eq!(drained.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_batched_strategy_flushes_at_size_and_on_stop() -> Result<(), Error> {
    let mut config = EventLayerConfig::default();
    config.processing.strategy = ProcessingStrategy::Batched;
    config.processing.batch_size = 3;
    let manager = EventManager::new("batched", config)?;
    manager.start().await;

    let collector = EventCollector::default();
    manager.subscribe(&["load:*"], collector.listener(), SubscribeOptions::default());

    // The start lifecycle event already sits in the buffer.
    manager.emit(load_event(0)).await?;
    let receipt = manager.emit(load_event(1)).await?;
    match receipt.outcome {
        DispatchOutcome::Flushed { batch, stats } => {
            assert_eq!(batch, 3);
            assert_eq!(stats.delivered, 2);
        }
        other => panic!("expected a flush, got {:?}", other),
    }
    assert_eq!(collector.collected().await.len(), 2);

    manager.emit(load_event(2)).await?;
    assert_eq!(collector.collected().await.len(), 2);

    manager.stop().await;
    let mut targets: Vec<String> = collector
        .collected()
        .await
        .iter()
        .map(|event| event.target_id.clone())
        .collect();
    targets.sort();
    assert_eq!(targets, vec!["spike-0", "spike-1", "spike-2"]);
    Ok(())
}

#[tokio::test]
async fn test_correlation_completes_across_related_emits() -> Result<(), Error> {
    let manager = EventManager::new("swarm", EventLayerConfig::coordination())?;
    manager.start().await;

    let task = EventEnvelope::builder()
        .source("planner")
        .event_type("coordination:task")
        .operation(EventOperation::Init)
        .target_id("task-3")
        .correlation_id("flight-7")
        .detail("agent_id", "agent-1")
        .build()?;
    manager.emit(task).await?;

    let record = manager.get_correlation("flight-7").unwrap();
    assert_eq!(record.status, CorrelationStatus::Active);
    assert_eq!(manager.active_correlations().len(), 1);

    let result = EventEnvelope::builder()
        .source("worker")
        .event_type("coordination:result")
        .operation(EventOperation::Complete)
        .target_id("task-3")
        .correlation_id("flight-7")
        .detail("agent_id", "agent-2")
        .build()?;
    manager.emit(result).await?;

    let record = manager.get_correlation("flight-7").unwrap();
    assert_eq!(record.status, CorrelationStatus::Completed);
    assert_eq!(record.events.len(), 2);
    assert!(record.related_agents.contains("agent-1"));
    assert!(record.related_agents.contains("agent-2"));
    assert!(record.related_components.contains("planner"));
    assert!(record.related_components.contains("worker"));
    assert!(manager.active_correlations().is_empty());

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_inactive_component_raises_a_health_alert() -> Result<(), Error> {
    let manager = EventManager::new("ward", EventLayerConfig::default())?;
    manager.start().await;

    let collector = EventCollector::default();
    manager.subscribe(
        &["monitoring:*"],
        collector.listener(),
        SubscribeOptions::default(),
    );

    let channel = LegacyScheduler::new("flaky-channel");
    let mappings = HashMap::from([("message".to_string(), "communication:message".to_string())]);
    manager.attach(channel, mappings).await?;

    // Detached components score zero and drop straight to Unhealthy.
    manager.detach("flaky-channel").await?;
    manager.run_health_sweep().await;
    sleep(Duration::from_millis(50)).await;

    let alerts = collector.collected().await;
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.event_type, "monitoring:health");
    assert_eq!(alert.source, "health-monitor");
    assert_eq!(alert.operation, EventOperation::Alert);
    assert_eq!(alert.priority, EventPriority::Critical);
    assert_eq!(alert.target_id, "flaky-channel");

    let health = manager.health_check().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.attached_components, 1);
    let entry = health.components.get("flaky-channel").unwrap();
    assert_eq!(entry.status, HealthStatus::Unhealthy);
    assert!(entry.consecutive_failures >= 1);

    // The alert also lands in history like any other emission.
    let recorded = manager
        .query(&QueryOptions {
            event_type: Some("monitoring:health".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(recorded.len(), 1);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_history_query_filters_sorts_and_paginates() -> Result<(), Error> {
    let manager = EventManager::new("ledger", EventLayerConfig::default())?;
    manager.start().await;

    let base = Utc::now();
    for n in 0..5 {
        let priority = if n % 2 == 0 {
            EventPriority::High
        } else {
            EventPriority::Low
        };
        let event = EventEnvelope::builder()
            .source("runner")
            .event_type("job:done")
            .operation(EventOperation::Complete)
            .target_id(&format!("job-{n}"))
            .priority(priority)
            .timestamp(base + chrono::Duration::milliseconds(n))
            .build()?;
        manager.emit(event).await?;
    }

    let jobs = manager
        .query(&QueryOptions {
            event_type: Some("job:*".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(jobs.len(), 5);

    let high = manager
        .query(&QueryOptions {
            event_type: Some("job:*".to_string()),
            min_priority: Some(EventPriority::High),
            ..Default::default()
        })
        .await;
    assert_eq!(high.len(), 3);

    let page = manager
        .query(&QueryOptions {
            event_type: Some("job:*".to_string()),
            sort: QuerySort::Timestamp,
            descending: true,
            offset: 1,
            limit: Some(2),
            ..Default::default()
        })
        .await;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].target_id, "job-3");
    assert_eq!(page[1].target_id, "job-2");

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_registry_runs_profiles_side_by_side() -> Result<(), Error> {
    let registry = ManagerRegistry::new();
    registry.create("swarm", EventLayerConfig::coordination())?;
    registry.create("telemetry", EventLayerConfig::monitoring())?;
    registry.create("messaging", EventLayerConfig::communication())?;

    let duplicate = registry.create("telemetry", EventLayerConfig::monitoring());
    assert!(matches!(duplicate, Err(Error::Registry(_))));
    assert_eq!(registry.len(), 3);

    registry.start_all().await;
    for name in registry.list() {
        assert!(registry.get(&name).unwrap().is_running());
    }

    let swarm = registry.get("swarm").unwrap();
    let event = EventEnvelope::builder()
        .source("planner")
        .event_type("coordination:task")
        .operation(EventOperation::Init)
        .target_id("task-1")
        .build()?;
    swarm.emit(event).await?;

    // Shutdown stops the managers but keeps them registered.
    registry.shutdown_all(Duration::from_secs(1)).await;
    assert_eq!(registry.len(), 3);
    for name in registry.list() {
        assert!(!registry.get(&name).unwrap().is_running());
    }

    assert!(registry.remove("messaging").await);
    assert_eq!(registry.len(), 2);
    Ok(())
}
