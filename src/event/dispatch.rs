//! Delivery strategies and the per-subscriber delivery pipeline.
//!
//! Every envelope flows filter, transform, listener. The strategy only
//! decides *when* that pipeline runs: inline, from the drain task, as
//! part of a batch, or spaced by a throttle delay.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, sleep, timeout},
};
use tracing::{debug, warn};

use crate::config::ProcessingConfig;
use crate::event::envelope::{EventEnvelope, ValidationError};
use crate::event::subscription::{DeliveryTarget, SubscriptionRegistry};

/// When deliveries happen relative to the emit call.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessingStrategy {
    /// Deliver inline; the emit call awaits every listener.
    #[default]
    Immediate,
    /// Park on a bounded queue, drained on an interval.
    Queued,
    /// Accumulate and deliver whole batches in parallel.
    Batched,
    /// Deliver inline, then hold the throttle delay.
    Throttled,
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("Event layer is not running")]
    NotRunning,
    #[error("Event queue is full (capacity {0})")]
    QueueFull(usize),
    #[error("Emit timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub type EmitResult<T> = Result<T, EmitError>;

/// Tally of one fan-out. Filtered and transform-vetoed targets count as
/// matched but neither delivered nor failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryStats {
    fn merge(&mut self, other: DeliveryStats) {
        self.matched += other.matched;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// What the dispatcher did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Inline delivery finished before returning.
    Delivered(DeliveryStats),
    /// Parked on the queue for the drain task.
    Enqueued { queue_depth: usize },
    /// Held toward the next batch flush.
    Buffered { pending: usize },
    /// This envelope completed a batch and the whole batch went out.
    Flushed { batch: usize, stats: DeliveryStats },
}

/// Routes envelopes to matching subscribers under one strategy.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    config: ProcessingConfig,
    queue: Arc<Mutex<VecDeque<EventEnvelope>>>,
    batch: Arc<Mutex<Vec<EventEnvelope>>>,
    /// Serializes throttled deliveries one `throttle_delay` apart.
    throttle_gate: Mutex<()>,
    running: Arc<AtomicBool>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, config: &ProcessingConfig) -> Self {
        Self {
            registry,
            config: config.clone(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            batch: Arc::new(Mutex::new(Vec::new())),
            throttle_gate: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            drain_handle: Mutex::new(None),
        }
    }

    /// Spawns the drain task when the strategy needs one.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.config.strategy != ProcessingStrategy::Queued {
            return;
        }

        let queue = self.queue.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(config.drain_interval);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                drain_queue(&queue, &registry, &config).await;
            }
        });
        *self.drain_handle.lock().await = Some(handle);
    }

    /// Stops the drain task and delivers whatever is still parked.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.drain_handle.lock().await.take() {
            handle.abort();
        }
        self.flush().await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn dispatch(&self, envelope: EventEnvelope) -> EmitResult<DispatchOutcome> {
        match self.config.strategy {
            ProcessingStrategy::Immediate => {
                let stats = deliver_envelope(&self.registry, &self.config, &envelope).await;
                Ok(DispatchOutcome::Delivered(stats))
            }
            ProcessingStrategy::Queued => {
                let mut queue = self.queue.lock().await;
                if queue.len() >= self.config.queue_capacity {
                    return Err(EmitError::QueueFull(self.config.queue_capacity));
                }
                queue.push_back(envelope);
                Ok(DispatchOutcome::Enqueued {
                    queue_depth: queue.len(),
                })
            }
            ProcessingStrategy::Batched => {
                let (ready, pending) = {
                    let mut batch = self.batch.lock().await;
                    batch.push(envelope);
                    if batch.len() >= self.config.batch_size {
                        (Some(std::mem::take(&mut *batch)), 0)
                    } else {
                        (None, batch.len())
                    }
                };
                match ready {
                    Some(batch) => {
                        let size = batch.len();
                        let stats =
                            deliver_batch_items(&self.registry, &self.config, batch).await;
                        Ok(DispatchOutcome::Flushed { batch: size, stats })
                    }
                    None => Ok(DispatchOutcome::Buffered { pending }),
                }
            }
            ProcessingStrategy::Throttled => {
                let _gate = self.throttle_gate.lock().await;
                let stats = deliver_envelope(&self.registry, &self.config, &envelope).await;
                sleep(self.config.throttle_delay).await;
                Ok(DispatchOutcome::Delivered(stats))
            }
        }
    }

    /// Delivers everything parked on the queue and the batch buffer.
    pub async fn flush(&self) -> DeliveryStats {
        let mut total = drain_queue(&self.queue, &self.registry, &self.config).await;
        let residue: Vec<EventEnvelope> = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut *batch)
        };
        if !residue.is_empty() {
            total.merge(deliver_batch_items(&self.registry, &self.config, residue).await);
        }
        total
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn pending_batch(&self) -> usize {
        self.batch.lock().await.len()
    }
}

async fn drain_queue(
    queue: &Mutex<VecDeque<EventEnvelope>>,
    registry: &SubscriptionRegistry,
    config: &ProcessingConfig,
) -> DeliveryStats {
    let drained: Vec<EventEnvelope> = {
        let mut queue = queue.lock().await;
        queue.drain(..).collect()
    };
    let mut total = DeliveryStats::default();
    for envelope in &drained {
        total.merge(deliver_envelope(registry, config, envelope).await);
    }
    total
}

async fn deliver_batch_items(
    registry: &SubscriptionRegistry,
    config: &ProcessingConfig,
    batch: Vec<EventEnvelope>,
) -> DeliveryStats {
    let deliveries = batch
        .iter()
        .map(|envelope| deliver_envelope(registry, config, envelope));
    let mut total = DeliveryStats::default();
    for stats in join_all(deliveries).await {
        total.merge(stats);
    }
    total
}

/// Fans one envelope out to every matching subscriber, higher
/// subscriber priority first.
async fn deliver_envelope(
    registry: &SubscriptionRegistry,
    config: &ProcessingConfig,
    envelope: &EventEnvelope,
) -> DeliveryStats {
    let targets = registry.targets_for(&envelope.event_type);
    let mut stats = DeliveryStats {
        matched: targets.len(),
        ..Default::default()
    };
    for target in &targets {
        match deliver_target(config, envelope, target).await {
            DeliveryResult::Delivered => {
                registry.record_delivery(&target.subscription_id);
                stats.delivered += 1;
            }
            DeliveryResult::Filtered | DeliveryResult::Vetoed => {}
            DeliveryResult::Failed => stats.failed += 1,
        }
    }
    stats
}

enum DeliveryResult {
    Delivered,
    Filtered,
    Vetoed,
    Failed,
}

/// Runs the filter, transform, listener pipeline for one target.
/// Listener errors and timeouts are retried with linear backoff, then
/// logged and absorbed; they never reach the emitter.
async fn deliver_target(
    config: &ProcessingConfig,
    envelope: &EventEnvelope,
    target: &DeliveryTarget,
) -> DeliveryResult {
    if let Some(filter) = &target.filter {
        if !filter.matches(envelope) {
            return DeliveryResult::Filtered;
        }
    }
    let event = match &target.transform {
        Some(transform) => match transform.apply(envelope.clone()) {
            Some(event) => event,
            None => {
                debug!(subscription = %target.subscription_id,
                    event_type = %envelope.event_type, "transform vetoed delivery");
                return DeliveryResult::Vetoed;
            }
        },
        None => envelope.clone(),
    };

    let mut attempt: u32 = 0;
    loop {
        match timeout(config.emit_timeout, (target.listener)(event.clone())).await {
            Ok(Ok(())) => return DeliveryResult::Delivered,
            Ok(Err(e)) => {
                if attempt >= config.retry_attempts {
                    warn!(subscription = %target.subscription_id, error = %e,
                        attempts = attempt + 1, "listener failed, giving up");
                    return DeliveryResult::Failed;
                }
                debug!(subscription = %target.subscription_id, error = %e,
                    attempt, "listener failed, retrying");
            }
            Err(_) => {
                if attempt >= config.retry_attempts {
                    warn!(subscription = %target.subscription_id,
                        timeout_ms = config.emit_timeout.as_millis() as u64,
                        attempts = attempt + 1, "listener timed out, giving up");
                    return DeliveryResult::Failed;
                }
                debug!(subscription = %target.subscription_id,
                    attempt, "listener timed out, retrying");
            }
        }
        attempt += 1;
        sleep(config.retry_backoff * attempt).await;
    }
}
