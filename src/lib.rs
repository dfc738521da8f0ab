//! # UEL: Unified Event Layer
//!
//! uel-core gives heterogeneous subsystems (coordinators, monitors,
//! communication channels, neural and workflow engines) one canonical
//! way to announce and observe events, without replacing the native
//! notification mechanisms those components already have.
//!
//! ## Technical Foundations
//!
//! ### 1. Canonical Envelopes
//! Every event is an [`event::envelope::EventEnvelope`]: id, timestamp,
//! source, `domain:action` type, inferred operation, priority,
//! optional correlation id and free-form details. Envelopes are
//! validated before dispatch.
//!
//! ### 2. Pattern Subscriptions and Dispatch Strategies
//! Subscribers register exact types or single-level wildcards
//! (`"agent:*"`) with optional per-subscriber filters and transforms
//! ([`event::subscription`]). Delivery runs immediate, queued, batched
//! or throttled ([`event::dispatch`]), with a bounded queue that
//! rejects new events when full.
//!
//! ### 3. Component Wrapping
//! Existing components are attached through a small capability
//! interface ([`wrapper::NotificationSource`]); their native
//! notifications are rebuilt as canonical envelopes and forwarded into
//! the layer ([`wrapper`]).
//!
//! ### 4. Correlation, Health and Metrics
//! Envelopes sharing a correlation id accumulate into records with
//! completion patterns and TTL eviction ([`correlation`]). Wrapped
//! components are scored and alerted on ([`health`]), and every emit
//! feeds a rolling metrics window ([`metrics`]).
//!
//! ### 5. One Facade per Subsystem
//! An [`event::manager::EventManager`] owns all of the above; the
//! [`registry::ManagerRegistry`] holds one named manager per subsystem
//! and drives fleet-wide start and shutdown. Configuration profiles
//! live in [`config`].
//!
//! ## Event Flow
//!
//! ```text
//! native notification → wrapper → envelope → dispatch → subscribers
//!                                     │
//!                                     ├─ correlation records
//!                                     ├─ metrics window
//!                                     └─ history ring
//! ```

pub mod config;
pub mod correlation;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod wrapper;

// Re-exports
pub use error::*;
pub use event::envelope::*;
pub use event::manager::*;
pub use registry::*;
