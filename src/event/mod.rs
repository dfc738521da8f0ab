//! # Unified Event Layer
//!
//! The event layer gives every subsystem one canonical way to announce
//! and observe what is happening. Components keep their own native
//! notification mechanisms; the layer wraps them, normalizes their
//! notifications into [`envelope::EventEnvelope`]s and routes those to
//! pattern-based subscribers.
//!
//! ## Architecture Overview
//!
//! The layer consists of the following key components:
//!
//! - **EventEnvelope**: the canonical event record (id, source, type,
//!   operation, priority, correlation id, details)
//! - **SubscriptionRegistry**: pattern-matched subscriptions with
//!   per-subscriber filters and transforms
//! - **Dispatcher**: immediate, queued, batched or throttled delivery
//! - **EventManager**: the facade owning both plus correlation, health
//!   and metrics
//!
//! ## Event Flow
//!
//! ```text
//! ┌───────────┐ native  ┌─────────┐ envelope ┌─────────┐ deliver ┌────────────┐
//! │ Component │────────▶│ Wrapper │─────────▶│ Manager │────────▶│ Subscriber │
//! └───────────┘         └─────────┘          └────┬────┘         └────────────┘
//!                                                 │
//!                                    ┌────────────┼────────────┐
//!                               ┌────▼────┐  ┌────▼────┐  ┌────▼────┐
//!                               │ Correl. │  │ Metrics │  │ History │
//!                               └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! 1. A wrapped component fires a native notification
//! 2. The wrapper rebuilds it as a canonical envelope and forwards it
//! 3. The manager validates, dispatches to matching subscribers and
//!    feeds correlation, metrics and the history ring
//!
//! ## Usage Examples
//!
//! ### Emitting and subscribing
//!
//! ```rust,no_run
//! # use uel_core::config::EventLayerConfig;
//! # use uel_core::event::envelope::EventEnvelope;
//! # use uel_core::event::manager::EventManager;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = EventManager::new("coordination", EventLayerConfig::coordination())?;
//! manager.start().await;
//!
//! manager.subscribe_fn(&["agent:*"], |event| async move {
//!     println!("agent event: {} from {}", event.event_type, event.source);
//!     Ok(())
//! });
//!
//! let event = EventEnvelope::builder()
//!     .source("swarm-coordinator")
//!     .event_type("agent:spawned")
//!     .target_id("agent-42")
//!     .build()?;
//! manager.emit(event).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Querying history and checking health
//!
//! ```rust,no_run
//! # use uel_core::config::EventLayerConfig;
//! # use uel_core::event::manager::{EventManager, QueryOptions};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! # let manager = EventManager::new("monitoring", EventLayerConfig::monitoring())?;
//! let recent = manager
//!     .query(&QueryOptions {
//!         event_type: Some("monitoring:*".to_string()),
//!         limit: Some(10),
//!         ..Default::default()
//!     })
//!     .await;
//! println!("{} recent monitoring events", recent.len());
//!
//! let health = manager.health_check().await;
//! println!("layer status: {}", health.status);
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod envelope;
pub mod manager;
pub mod subscription;
