//! Component wrapping: native notifications in, canonical envelopes out.
//!
//! A component is wrapped through the [`NotificationSource`] capability
//! interface; the wrapper never sees the component's concrete type.
//! For each mapped native event it registers one handler that rebuilds
//! the notification as a canonical envelope and forwards it into the
//! layer's emit path.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::event::envelope::{EventEnvelope, EventOperation, ValidationResult};

#[derive(Debug, Error)]
pub enum WrapError {
    #[error("Component already attached: {0}")]
    AlreadyAttached(String),
    #[error("Native subscribe failed for {component}:{event}: {message}")]
    SubscribeFailed {
        component: String,
        event: String,
        message: String,
    },
    #[error("Native unsubscribe failed for {component}:{event}: {message}")]
    UnsubscribeFailed {
        component: String,
        event: String,
        message: String,
    },
}

pub type WrapResult<T> = Result<T, WrapError>;

/// Kind of component being wrapped, used by health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ComponentType {
    #[default]
    Coordinator,
    Monitor,
    Channel,
    NeuralEngine,
    WorkflowEngine,
    #[strum(default)]
    #[strum(to_string = "{0}")]
    Custom(String),
}

/// Notification as produced by a wrapped component's own system.
#[derive(Debug, Clone)]
pub struct NativeEvent {
    pub name: String,
    pub payload: HashMap<String, serde_json::Value>,
}

pub type NativeHandler = Arc<dyn Fn(NativeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability interface a component must offer to be wrapped: register
/// and remove handlers for its named native events. Nothing else about
/// the component is assumed.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    fn name(&self) -> String;

    fn component_type(&self) -> ComponentType;

    async fn subscribe_native(&self, event: &str, handler: NativeHandler) -> WrapResult<()>;

    async fn unsubscribe_native(&self, event: &str) -> WrapResult<()>;
}

/// Forwarding seam into the emit pipeline. Returns whether the envelope
/// was accepted; rejections count against the component's error stats.
pub type ForwardFn = Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, bool> + Send + Sync>;

struct WrappedComponent {
    source: Arc<dyn NotificationSource>,
    component_type: ComponentType,
    /// Native event name to canonical event type.
    mappings: HashMap<String, String>,
    is_active: AtomicBool,
    events_seen: AtomicU64,
    error_count: AtomicU64,
    last_seen: RwLock<DateTime<Utc>>,
    /// Exponential moving average over forward latency.
    avg_latency_ms: RwLock<f64>,
}

/// Snapshot of one wrapped component's counters.
#[derive(Debug, Clone)]
pub struct ComponentStats {
    pub component: String,
    pub component_type: ComponentType,
    pub is_active: bool,
    pub events_seen: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub last_seen: DateTime<Utc>,
}

pub struct ComponentWrapper {
    components: Arc<DashMap<String, Arc<WrappedComponent>>>,
    forward: ForwardFn,
}

impl ComponentWrapper {
    pub fn new(forward: ForwardFn) -> Self {
        Self {
            components: Arc::new(DashMap::new()),
            forward,
        }
    }

    /// Wraps one component: registers a native handler per mapping.
    /// Handlers already registered are rolled back if a later one
    /// fails, and the error is returned to the caller.
    pub async fn attach(
        &self,
        source: Arc<dyn NotificationSource>,
        mappings: HashMap<String, String>,
    ) -> WrapResult<()> {
        let name = source.name();
        if self.components.contains_key(&name) {
            return Err(WrapError::AlreadyAttached(name));
        }

        let component = Arc::new(WrappedComponent {
            source: source.clone(),
            component_type: source.component_type(),
            mappings: mappings.clone(),
            is_active: AtomicBool::new(true),
            events_seen: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_seen: RwLock::new(Utc::now()),
            avg_latency_ms: RwLock::new(0.0),
        });

        let mut registered: Vec<String> = Vec::new();
        for (native_name, canonical_type) in &mappings {
            let handler =
                self.native_handler(&name, native_name, canonical_type, component.clone());
            if let Err(e) = source.subscribe_native(native_name, handler).await {
                for done in &registered {
                    if let Err(undo) = source.unsubscribe_native(done).await {
                        warn!(component = %name, native = %done, error = %undo,
                            "rollback unsubscribe failed");
                    }
                }
                return Err(e);
            }
            registered.push(native_name.clone());
        }

        self.components.insert(name.clone(), component);
        info!(component = %name, mappings = mappings.len(), "component attached");
        Ok(())
    }

    /// Wraps a batch, skipping components that fail and logging why.
    /// Returns how many attached.
    pub async fn attach_all(
        &self,
        batch: Vec<(Arc<dyn NotificationSource>, HashMap<String, String>)>,
    ) -> usize {
        let mut attached = 0;
        for (source, mappings) in batch {
            let name = source.name();
            match self.attach(source, mappings).await {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!(component = %name, error = %e, "skipping component that failed to wrap")
                }
            }
        }
        attached
    }

    /// Removes the native handlers and marks the component inactive.
    /// Idempotent: detaching an unknown or already-detached component
    /// is a no-op. The stats record stays until [`Self::remove`].
    pub async fn detach(&self, name: &str) -> WrapResult<()> {
        let Some(component) = self.components.get(name).map(|c| c.clone()) else {
            return Ok(());
        };
        if !component.is_active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for native_name in component.mappings.keys() {
            if let Err(e) = component.source.unsubscribe_native(native_name).await {
                warn!(component = %name, native = %native_name, error = %e,
                    "native unsubscribe failed");
            }
        }
        info!(component = %name, "component detached");
        Ok(())
    }

    /// Detaches and drops the stats record.
    pub async fn remove(&self, name: &str) -> bool {
        // detach never propagates unsubscribe failures
        let _ = self.detach(name).await;
        self.components.remove(name).is_some()
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub async fn stats(&self) -> Vec<ComponentStats> {
        let components: Vec<(String, Arc<WrappedComponent>)> = self
            .components
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut result = Vec::new();
        for (name, component) in components {
            result.push(ComponentStats {
                component: name,
                component_type: component.component_type.clone(),
                is_active: component.is_active.load(Ordering::SeqCst),
                events_seen: component.events_seen.load(Ordering::SeqCst),
                error_count: component.error_count.load(Ordering::SeqCst),
                avg_latency_ms: *component.avg_latency_ms.read().await,
                last_seen: *component.last_seen.read().await,
            });
        }
        result
    }

    fn native_handler(
        &self,
        component_name: &str,
        native_name: &str,
        canonical_type: &str,
        component: Arc<WrappedComponent>,
    ) -> NativeHandler {
        let forward = self.forward.clone();
        let component_name = component_name.to_string();
        let native_name = native_name.to_string();
        let canonical_type = canonical_type.to_string();

        Arc::new(move |native: NativeEvent| {
            let forward = forward.clone();
            let component = component.clone();
            let component_name = component_name.clone();
            let native_name = native_name.clone();
            let canonical_type = canonical_type.clone();
            async move {
                if !component.is_active.load(Ordering::SeqCst) {
                    return;
                }
                let started = Instant::now();
                component.events_seen.fetch_add(1, Ordering::SeqCst);
                *component.last_seen.write().await = Utc::now();

                let envelope = match build_canonical(
                    &component_name,
                    &native_name,
                    &canonical_type,
                    native,
                ) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        component.error_count.fetch_add(1, Ordering::SeqCst);
                        warn!(component = %component_name, native = %native_name, error = %e,
                            "dropping unmappable native event");
                        return;
                    }
                };
                debug!(component = %component_name, native = %native_name,
                    event_type = %envelope.event_type, "forwarding native event");

                let accepted = forward(envelope).await;
                if !accepted {
                    component.error_count.fetch_add(1, Ordering::SeqCst);
                }

                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let mut avg = component.avg_latency_ms.write().await;
                *avg = if *avg == 0.0 {
                    elapsed_ms
                } else {
                    *avg * 0.9 + elapsed_ms * 0.1
                };
            }
            .boxed()
        })
    }
}

/// Rebuilds a native notification as a canonical envelope: operation is
/// inferred from the native name, target comes from the payload
/// (`target_id`, then `id`) or falls back to the component, and the
/// whole payload is carried in `details`.
fn build_canonical(
    component: &str,
    native_name: &str,
    canonical_type: &str,
    native: NativeEvent,
) -> ValidationResult<EventEnvelope> {
    let target_id = native
        .payload
        .get("target_id")
        .or_else(|| native.payload.get("id"))
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| component.to_string());
    let correlation_id = native
        .payload
        .get("correlation_id")
        .and_then(|v| v.as_str().map(str::to_string));

    let mut builder = EventEnvelope::builder()
        .source(component)
        .event_type(canonical_type)
        .operation(EventOperation::infer(native_name))
        .target_id(&target_id)
        .details(native.payload);
    if let Some(correlation_id) = correlation_id {
        builder = builder.correlation_id(&correlation_id);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::envelope::EventPriority;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    struct FakeComponent {
        name: String,
        handlers: Arc<DashMap<String, NativeHandler>>,
        fail_subscribe: bool,
    }

    impl FakeComponent {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                handlers: Arc::new(DashMap::new()),
                fail_subscribe: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                handlers: Arc::new(DashMap::new()),
                fail_subscribe: true,
            })
        }

        async fn fire(&self, name: &str, payload: HashMap<String, serde_json::Value>) {
            let handler = self.handlers.get(name).map(|h| h.clone());
            if let Some(handler) = handler {
                handler(NativeEvent {
                    name: name.to_string(),
                    payload,
                })
                .await;
            }
        }
    }

    #[async_trait]
    impl NotificationSource for FakeComponent {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn component_type(&self) -> ComponentType {
            ComponentType::Coordinator
        }

        async fn subscribe_native(&self, event: &str, handler: NativeHandler) -> WrapResult<()> {
            if self.fail_subscribe {
                return Err(WrapError::SubscribeFailed {
                    component: self.name.clone(),
                    event: event.to_string(),
                    message: "native bus unavailable".to_string(),
                });
            }
            self.handlers.insert(event.to_string(), handler);
            Ok(())
        }

        async fn unsubscribe_native(&self, event: &str) -> WrapResult<()> {
            self.handlers.remove(event);
            Ok(())
        }
    }

    fn collecting_forward(sink: Arc<Mutex<Vec<EventEnvelope>>>) -> ForwardFn {
        Arc::new(move |envelope| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(envelope);
                true
            }
            .boxed()
        })
    }

    fn rejecting_forward() -> ForwardFn {
        Arc::new(|_envelope| async { false }.boxed())
    }

    fn lifecycle_mapping() -> HashMap<String, String> {
        HashMap::from([("started".to_string(), "coordination:lifecycle".to_string())])
    }

    #[tokio::test]
    async fn native_event_becomes_canonical_envelope() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let wrapper = ComponentWrapper::new(collecting_forward(sink.clone()));
        let component = FakeComponent::new("swarm-coordinator");

        wrapper
            .attach(component.clone(), lifecycle_mapping())
            .await
            .unwrap();
        component
            .fire(
                "started",
                HashMap::from([
                    ("id".to_string(), serde_json::json!("agent-42")),
                    ("pool".to_string(), serde_json::json!("default")),
                ]),
            )
            .await;

        let events = sink.lock().await;
        assert_eq!(events.len(), 1);
        let envelope = &events[0];
        assert_eq!(envelope.source, "swarm-coordinator");
        assert_eq!(envelope.event_type, "coordination:lifecycle");
        assert_eq!(envelope.operation, EventOperation::Start);
        assert_eq!(envelope.target_id, "agent-42");
        assert_eq!(envelope.priority, EventPriority::High);
        assert_eq!(envelope.details["pool"], serde_json::json!("default"));
    }

    #[tokio::test]
    async fn correlation_id_is_lifted_from_payload() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let wrapper = ComponentWrapper::new(collecting_forward(sink.clone()));
        let component = FakeComponent::new("orchestrator");

        wrapper
            .attach(
                component.clone(),
                HashMap::from([("taskCompleted".to_string(), "workflow:task".to_string())]),
            )
            .await
            .unwrap();
        component
            .fire(
                "taskCompleted",
                HashMap::from([("correlation_id".to_string(), serde_json::json!("run-7"))]),
            )
            .await;

        let events = sink.lock().await;
        assert_eq!(events[0].operation, EventOperation::Complete);
        assert_eq!(events[0].correlation_id.as_deref(), Some("run-7"));
        // target falls back to the component name
        assert_eq!(events[0].target_id, "orchestrator");
    }

    #[tokio::test]
    async fn duplicate_attach_is_rejected() {
        let wrapper = ComponentWrapper::new(rejecting_forward());
        let component = FakeComponent::new("dup");

        wrapper
            .attach(component.clone(), lifecycle_mapping())
            .await
            .unwrap();
        let second = wrapper.attach(component, lifecycle_mapping()).await;
        assert!(matches!(second, Err(WrapError::AlreadyAttached(_))));
        assert_eq!(wrapper.len(), 1);
    }

    #[tokio::test]
    async fn detach_is_idempotent_and_stops_forwarding() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let wrapper = ComponentWrapper::new(collecting_forward(sink.clone()));
        let component = FakeComponent::new("worker");

        wrapper
            .attach(component.clone(), lifecycle_mapping())
            .await
            .unwrap();
        wrapper.detach("worker").await.unwrap();
        assert!(component.handlers.is_empty());

        wrapper.detach("worker").await.unwrap();
        wrapper.detach("never-attached").await.unwrap();

        // a handler retained by the native side no longer forwards
        component.fire("started", HashMap::new()).await;
        assert!(sink.lock().await.is_empty());

        let stats = wrapper.stats().await;
        assert_eq!(stats.len(), 1);
        assert!(!stats[0].is_active);
    }

    #[tokio::test]
    async fn attach_all_skips_failing_components() {
        let wrapper = ComponentWrapper::new(rejecting_forward());
        let good: Arc<dyn NotificationSource> = FakeComponent::new("good");
        let bad: Arc<dyn NotificationSource> = FakeComponent::failing("bad");

        let attached = wrapper
            .attach_all(vec![
                (bad, lifecycle_mapping()),
                (good, lifecycle_mapping()),
            ])
            .await;
        assert_eq!(attached, 1);
        assert!(wrapper.is_attached("good"));
        assert!(!wrapper.is_attached("bad"));
    }

    #[tokio::test]
    async fn rejected_forward_counts_as_component_error() {
        let wrapper = ComponentWrapper::new(rejecting_forward());
        let component = FakeComponent::new("noisy");

        wrapper
            .attach(component.clone(), lifecycle_mapping())
            .await
            .unwrap();
        component.fire("started", HashMap::new()).await;
        component.fire("started", HashMap::new()).await;

        let stats = wrapper.stats().await;
        assert_eq!(stats[0].events_seen, 2);
        assert_eq!(stats[0].error_count, 2);
        assert!(stats[0].avg_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn remove_drops_the_stats_record() {
        let wrapper = ComponentWrapper::new(rejecting_forward());
        let component = FakeComponent::new("gone");
        wrapper
            .attach(component, lifecycle_mapping())
            .await
            .unwrap();

        assert!(wrapper.remove("gone").await);
        assert!(!wrapper.remove("gone").await);
        assert!(wrapper.is_empty());
    }
}
