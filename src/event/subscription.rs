//! Subscription storage and type-pattern matching.
//!
//! The registry owns every live subscription and answers "who gets this
//! envelope" for the dispatcher. Matching is by event-type pattern;
//! filters and transforms are evaluated later, per subscriber, inside
//! the delivery pipeline.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::envelope::{EventEnvelope, EventPriority};

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Subscription not found: {0}")]
    NotFound(String),
}

pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Error returned by a listener; caught per subscriber by the delivery
/// pipeline, never propagated to the emitter.
#[derive(Debug, Error)]
#[error("Listener failed: {message}")]
pub struct ListenerError {
    pub message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type ListenerResult = Result<(), ListenerError>;
pub type ListenerFn =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, ListenerResult> + Send + Sync>;

/// Compiled event-type pattern: exact, or single-level wildcard where a
/// `*` segment matches exactly one segment (`"a:*"` matches `"a:b"` but
/// neither `"a"` nor `"a:b:c"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypePattern {
    pattern: String,
    segments: Vec<String>,
    is_wildcard: bool,
}

impl TypePattern {
    pub fn new(pattern: &str) -> Self {
        let segments: Vec<String> = pattern.split(':').map(str::to_string).collect();
        let is_wildcard = segments.iter().any(|s| s == "*");
        Self {
            pattern: pattern.to_string(),
            segments,
            is_wildcard,
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        if !self.is_wildcard {
            return self.pattern == event_type;
        }
        let parts: Vec<&str> = event_type.split(':').collect();
        if parts.len() != self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(parts)
            .all(|(segment, part)| segment == "*" || segment == part)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }
}

pub type FilterPredicate = Arc<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

/// Declarative subscriber-side filter. All populated criteria must hold
/// for the envelope to pass.
#[derive(Default, Clone)]
pub struct EventFilter {
    pub event_types: Option<Vec<TypePattern>>,
    pub sources: Option<Vec<String>>,
    pub min_priority: Option<EventPriority>,
    /// Key/value equality against `details`.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub predicate: Option<FilterPredicate>,
}

impl EventFilter {
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|p| p.matches(&envelope.event_type)) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| s == &envelope.source) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if envelope.priority < min {
                return false;
            }
        }
        if let Some(metadata) = &self.metadata {
            for (key, expected) in metadata {
                if envelope.details.get(key) != Some(expected) {
                    return false;
                }
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(envelope) {
                return false;
            }
        }
        true
    }
}

pub type MapFn = Arc<dyn Fn(EventEnvelope) -> EventEnvelope + Send + Sync>;
pub type EnrichFn = Arc<dyn Fn(&mut EventEnvelope) + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

/// Per-subscriber rewrite of the envelope copy, applied after the
/// filter. Stages run map, enrich, validate in that order.
#[derive(Default, Clone)]
pub struct EventTransform {
    pub map: Option<MapFn>,
    pub enrich: Option<EnrichFn>,
    pub validate: Option<ValidateFn>,
}

impl EventTransform {
    /// Returns `None` when the validate stage rejects the envelope; the
    /// delivery pipeline then skips this subscriber only.
    pub fn apply(&self, envelope: EventEnvelope) -> Option<EventEnvelope> {
        let mut envelope = match &self.map {
            Some(map) => map(envelope),
            None => envelope,
        };
        if let Some(enrich) = &self.enrich {
            enrich(&mut envelope);
        }
        if let Some(validate) = &self.validate {
            if !validate(&envelope) {
                return None;
            }
        }
        Some(envelope)
    }
}

/// Options accepted at subscribe time.
#[derive(Default)]
pub struct SubscribeOptions {
    pub filter: Option<EventFilter>,
    pub transform: Option<EventTransform>,
    /// Delivery ordering among subscribers of the same envelope.
    pub priority: EventPriority,
}

/// One live subscription. Identity fields are fixed at subscribe time;
/// only `active`, the counters and the attached filter/transform change
/// afterwards.
pub struct Subscription {
    pub id: String,
    pub patterns: Vec<TypePattern>,
    listener: ListenerFn,
    filter: Option<EventFilter>,
    transform: Option<EventTransform>,
    pub priority: EventPriority,
    pub created: DateTime<Utc>,
    active: AtomicBool,
    delivered: AtomicU64,
}

/// Snapshot handed to the dispatcher for one matching subscriber.
#[derive(Clone)]
pub struct DeliveryTarget {
    pub subscription_id: String,
    pub listener: ListenerFn,
    pub filter: Option<EventFilter>,
    pub transform: Option<EventTransform>,
    pub priority: EventPriority,
}

/// Registry of live subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Arc<DashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for the given type patterns and returns the
    /// subscription id.
    pub fn subscribe(
        &self,
        patterns: &[&str],
        listener: ListenerFn,
        options: SubscribeOptions,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let subscription = Subscription {
            id: id.clone(),
            patterns: patterns.iter().map(|p| TypePattern::new(p)).collect(),
            listener,
            filter: options.filter,
            transform: options.transform,
            priority: options.priority,
            created: Utc::now(),
            active: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        };
        debug!(subscription_id = %id, patterns = ?patterns, "subscribed");
        self.subscriptions.insert(id.clone(), subscription);
        id
    }

    /// Removes a subscription. Returns `false` when the id is unknown.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscriptions.remove(id).is_some();
        if removed {
            debug!(subscription_id = %id, "unsubscribed");
        }
        removed
    }

    /// Removes every subscription, or only those registered under the
    /// given pattern string. Returns the number removed.
    pub fn unsubscribe_all(&self, pattern: Option<&str>) -> usize {
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| match pattern {
                Some(pattern) => entry.patterns.iter().any(|p| p.as_str() == pattern),
                None => true,
            })
            .map(|entry| entry.id.clone())
            .collect();
        for id in &ids {
            self.subscriptions.remove(id);
        }
        ids.len()
    }

    /// Attaches (or replaces) the filter of an existing subscription.
    pub fn add_filter(&self, id: &str, filter: EventFilter) -> SubscriptionResult<()> {
        let mut subscription = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
        subscription.filter = Some(filter);
        Ok(())
    }

    /// Attaches (or replaces) the transform of an existing subscription.
    pub fn add_transform(&self, id: &str, transform: EventTransform) -> SubscriptionResult<()> {
        let mut subscription = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
        subscription.transform = Some(transform);
        Ok(())
    }

    /// Pauses or resumes delivery for a subscription.
    pub fn set_active(&self, id: &str, active: bool) -> SubscriptionResult<()> {
        let subscription = self
            .subscriptions
            .get(id)
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
        subscription.active.store(active, Ordering::SeqCst);
        Ok(())
    }

    /// Snapshot of active subscribers matching the event type, ordered
    /// by subscription priority (highest first).
    pub fn targets_for(&self, event_type: &str) -> Vec<DeliveryTarget> {
        let mut targets: Vec<DeliveryTarget> = self
            .subscriptions
            .iter()
            .filter(|entry| {
                entry.active.load(Ordering::SeqCst)
                    && entry.patterns.iter().any(|p| p.matches(event_type))
            })
            .map(|entry| DeliveryTarget {
                subscription_id: entry.id.clone(),
                listener: entry.listener.clone(),
                filter: entry.filter.clone(),
                transform: entry.transform.clone(),
                priority: entry.priority,
            })
            .collect();
        targets.sort_by(|a, b| b.priority.cmp(&a.priority));
        targets
    }

    /// Bumps the delivered counter after a successful listener call.
    pub fn record_delivery(&self, id: &str) {
        if let Some(subscription) = self.subscriptions.get(id) {
            subscription.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn delivered_count(&self, id: &str) -> Option<u64> {
        self.subscriptions
            .get(id)
            .map(|s| s.delivered.load(Ordering::SeqCst))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
