//! Canonical event envelope shared by every component of the layer.
//!
//! An envelope is the unit of traffic on the bus: a stable identity, a
//! `domain:subtype` type string, a lifecycle operation and an open
//! `details` payload. Envelopes are immutable once emitted; enrichment
//! happens on per-subscriber copies inside the delivery pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Structural validation failure raised before dispatch.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Delivery priority carried by every envelope.
///
/// Ordering follows severity, so `Critical` sorts above `Low`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Lifecycle operation an envelope describes.
///
/// The closed set covers the taxonomy used by the built-in components;
/// anything else round-trips through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EventOperation {
    Init,
    Start,
    Stop,
    Spawn,
    Complete,
    Fail,
    Alert,
    #[default]
    Update,
    #[strum(default)]
    #[strum(to_string = "{0}")]
    Custom(String),
}

impl EventOperation {
    /// Derives the canonical operation from a native notification name.
    ///
    /// Matching is substring-based on the last path segment, so
    /// `"agent:spawned"`, `"taskCompleted"` and `"started"` all map
    /// without per-component tables.
    pub fn infer(native: &str) -> Self {
        let name = native
            .rsplit(|c: char| c == ':' || c == '.')
            .next()
            .unwrap_or(native)
            .to_ascii_lowercase();
        if name.contains("init") {
            Self::Init
        } else if name.contains("start") {
            Self::Start
        } else if name.contains("stop") || name.contains("shutdown") {
            Self::Stop
        } else if name.contains("spawn") {
            Self::Spawn
        } else if name.contains("complet") || name.contains("finish") {
            Self::Complete
        } else if name.contains("fail") || name.contains("error") {
            Self::Fail
        } else if name.contains("alert") {
            Self::Alert
        } else if name.contains("updat") || name.contains("progress") {
            Self::Update
        } else {
            Self::Custom(native.to_string())
        }
    }
}

impl Serialize for EventOperation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventOperation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

lazy_static! {
    /// Priority assigned by the builder when none is given, keyed by the
    /// `domain:` prefix of the event type.
    static ref DEFAULT_PRIORITIES: HashMap<&'static str, EventPriority> = {
        let mut map = HashMap::new();
        map.insert("system", EventPriority::Critical);
        map.insert("uel", EventPriority::Critical);
        map.insert("coordination", EventPriority::High);
        map.insert("monitoring", EventPriority::Medium);
        map.insert("communication", EventPriority::Medium);
        map.insert("workflow", EventPriority::Medium);
        map.insert("neural", EventPriority::Low);
        map
    };
}

/// Default priority for an event type, falling back to `Medium` for
/// prefixes outside the built-in table.
pub fn default_priority_for(event_type: &str) -> EventPriority {
    let prefix = event_type.split(':').next().unwrap_or_default();
    DEFAULT_PRIORITIES.get(prefix).copied().unwrap_or_default()
}

/// The canonical envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Open `domain:subtype` taxonomy, e.g. `"coordination:agent"`.
    pub event_type: String,
    pub operation: EventOperation,
    pub target_id: String,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new()
    }

    /// Checks structural presence of the required fields.
    pub fn validate(&self) -> ValidationResult<()> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField { field: "id" });
        }
        if self.source.is_empty() {
            return Err(ValidationError::MissingField { field: "source" });
        }
        if self.event_type.is_empty() {
            return Err(ValidationError::MissingField { field: "event_type" });
        }
        if let EventOperation::Custom(name) = &self.operation {
            if name.is_empty() {
                return Err(ValidationError::MissingField { field: "operation" });
            }
        }
        if self.target_id.is_empty() {
            return Err(ValidationError::MissingField { field: "target_id" });
        }
        Ok(())
    }

    /// Failure marker used by correlation and health accounting.
    pub fn is_failure(&self) -> bool {
        if self.operation == EventOperation::Fail {
            return true;
        }
        match self.details.get("success") {
            Some(serde_json::Value::Bool(false)) => true,
            _ => self.details.contains_key("error"),
        }
    }
}

/// Builder for [`EventEnvelope`].
///
/// Fills identity, timestamp and priority when the caller leaves them
/// out; `build` runs the same validation the emit path applies.
#[derive(Default)]
pub struct EnvelopeBuilder {
    id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    source: Option<String>,
    event_type: Option<String>,
    operation: Option<EventOperation>,
    target_id: Option<String>,
    priority: Option<EventPriority>,
    correlation_id: Option<String>,
    details: HashMap<String, serde_json::Value>,
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn operation(mut self, operation: EventOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn target_id(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }

    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn details(mut self, details: HashMap<String, serde_json::Value>) -> Self {
        self.details = details;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> ValidationResult<EventEnvelope> {
        let event_type = self
            .event_type
            .ok_or(ValidationError::MissingField { field: "event_type" })?;
        let envelope = EventEnvelope {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source: self
                .source
                .ok_or(ValidationError::MissingField { field: "source" })?,
            operation: self.operation.unwrap_or_default(),
            target_id: self
                .target_id
                .ok_or(ValidationError::MissingField { field: "target_id" })?,
            priority: self
                .priority
                .unwrap_or_else(|| default_priority_for(&event_type)),
            correlation_id: self.correlation_id,
            details: self.details,
            event_type,
        };
        envelope.validate()?;
        Ok(envelope)
    }
}
