//! Rolling-window emit metrics.
//!
//! The collector keeps one sample per delivery attempt inside a bounded
//! window and reduces them to a snapshot on demand. Pruning is lazy:
//! expired samples are dropped when a snapshot is taken (or by the
//! maintenance sweep), not on every record.

use std::{collections::HashMap, collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::config::MonitoringConfig;

/// One delivery attempt as seen by the metrics window.
#[derive(Debug, Clone)]
pub struct EmitSample {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub latency: Duration,
    pub success: bool,
}

impl EmitSample {
    pub fn new(event_type: &str, latency: Duration, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            latency,
            success,
        }
    }
}

/// Point-in-time gauges owned by the manager, folded into the snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceGauges {
    pub queue_size: usize,
    pub subscriptions: usize,
    pub correlation_members: usize,
    pub history_len: usize,
}

/// Reduced view over the current window.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub events_per_second: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Failed deliveries / total deliveries in the window.
    pub error_rate: f64,
    pub queue_size: usize,
    pub estimated_memory_bytes: u64,
    pub sample_count: usize,
    pub by_type: HashMap<String, u64>,
    pub window: Duration,
}

pub struct MetricsCollector {
    samples: RwLock<VecDeque<EmitSample>>,
    window: Duration,
    max_samples: usize,
}

impl MetricsCollector {
    pub fn new(config: &MonitoringConfig) -> Self {
        Self {
            samples: RwLock::new(VecDeque::new()),
            window: config.metrics_window,
            max_samples: config.max_samples,
        }
    }

    /// Records one delivery attempt. The hard sample cap is enforced
    /// here; window expiry is handled lazily.
    pub async fn record(&self, sample: EmitSample) {
        let mut samples = self.samples.write().await;
        samples.push_back(sample);
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Drops samples older than the window.
    pub async fn prune(&self) {
        let mut samples = self.samples.write().await;
        let now = Utc::now();
        samples.retain(|s| (now - s.timestamp).to_std().unwrap_or_default() <= self.window);
    }

    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }

    /// Prunes the window and reduces it to a snapshot.
    pub async fn snapshot(&self, gauges: &ResourceGauges) -> MetricsSnapshot {
        let mut samples = self.samples.write().await;
        let now = Utc::now();
        samples.retain(|s| (now - s.timestamp).to_std().unwrap_or_default() <= self.window);

        let count = samples.len();
        let mut latencies: Vec<f64> = samples
            .iter()
            .map(|s| s.latency.as_secs_f64() * 1000.0)
            .collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        let failures = samples.iter().filter(|s| !s.success).count();
        let avg = if count == 0 {
            0.0
        } else {
            latencies.iter().sum::<f64>() / count as f64
        };
        let by_type = samples.iter().fold(HashMap::new(), |mut acc, sample| {
            *acc.entry(sample.event_type.clone()).or_insert(0) += 1;
            acc
        });
        let window_secs = self.window.as_secs_f64().max(f64::EPSILON);

        MetricsSnapshot {
            events_per_second: count as f64 / window_secs,
            avg_latency_ms: avg,
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            error_rate: if count == 0 {
                0.0
            } else {
                failures as f64 / count as f64
            },
            queue_size: gauges.queue_size,
            estimated_memory_bytes: estimate_memory(gauges, count),
            sample_count: count,
            by_type,
            window: self.window,
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice: 1-based rank
/// `floor(n * q)` clamped to `[1, n]`.
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * quantile).floor() as usize;
    let rank = rank.clamp(1, sorted.len());
    sorted[rank - 1]
}

fn estimate_memory(gauges: &ResourceGauges, samples: usize) -> u64 {
    (gauges.subscriptions as u64) * 256
        + (gauges.correlation_members as u64) * 512
        + (samples as u64) * 64
        + (gauges.history_len as u64) * 512
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(&MonitoringConfig::default())
    }

    #[tokio::test]
    async fn percentiles_follow_rank_rule() {
        let collector = collector();
        for ms in 1..=100u64 {
            collector
                .record(EmitSample::new(
                    "workflow:task",
                    Duration::from_millis(ms),
                    true,
                ))
                .await;
        }

        let snapshot = collector.snapshot(&ResourceGauges::default()).await;
        assert_eq!(snapshot.sample_count, 100);
        assert_eq!(snapshot.p95_latency_ms, 95.0);
        assert_eq!(snapshot.p99_latency_ms, 99.0);
        assert_eq!(snapshot.avg_latency_ms, 50.5);
    }

    #[tokio::test]
    async fn error_rate_counts_failed_samples() {
        let collector = collector();
        for success in [true, true, true, false] {
            collector
                .record(EmitSample::new(
                    "neural:training",
                    Duration::from_millis(5),
                    success,
                ))
                .await;
        }

        let snapshot = collector.snapshot(&ResourceGauges::default()).await;
        assert_eq!(snapshot.error_rate, 0.25);
        assert_eq!(snapshot.by_type["neural:training"], 4);
    }

    #[tokio::test]
    async fn window_prunes_expired_samples() {
        let collector = collector();
        let mut stale = EmitSample::new("a:b", Duration::from_millis(1), true);
        stale.timestamp = Utc::now() - chrono::Duration::seconds(600);
        collector.record(stale).await;
        collector
            .record(EmitSample::new("a:b", Duration::from_millis(1), true))
            .await;

        assert_eq!(collector.sample_count().await, 2);
        let snapshot = collector.snapshot(&ResourceGauges::default()).await;
        assert_eq!(snapshot.sample_count, 1);
        assert_eq!(collector.sample_count().await, 1);
    }

    #[tokio::test]
    async fn record_enforces_sample_cap() {
        let config = MonitoringConfig {
            max_samples: 3,
            ..Default::default()
        };
        let collector = MetricsCollector::new(&config);
        for ms in 1..=5u64 {
            collector
                .record(EmitSample::new("a:b", Duration::from_millis(ms), true))
                .await;
        }

        assert_eq!(collector.sample_count().await, 3);
        let snapshot = collector.snapshot(&ResourceGauges::default()).await;
        // oldest two were evicted, so the window holds 3..=5;
        // p99 rank over 3 samples is floor(3 * 0.99) = 2 -> 4.0
        assert_eq!(snapshot.p99_latency_ms, 4.0);
        assert_eq!(snapshot.avg_latency_ms, 4.0);
    }

    #[tokio::test]
    async fn empty_window_snapshots_to_zeroes() {
        let snapshot = collector().snapshot(&ResourceGauges::default()).await;
        assert_eq!(snapshot.sample_count, 0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
        assert_eq!(snapshot.p95_latency_ms, 0.0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.events_per_second, 0.0);
    }

    #[tokio::test]
    async fn memory_estimate_folds_gauges() {
        let collector = collector();
        collector
            .record(EmitSample::new("a:b", Duration::from_millis(1), true))
            .await;
        let gauges = ResourceGauges {
            queue_size: 7,
            subscriptions: 2,
            correlation_members: 3,
            history_len: 4,
        };
        let snapshot = collector.snapshot(&gauges).await;
        assert_eq!(snapshot.queue_size, 7);
        assert_eq!(
            snapshot.estimated_memory_bytes,
            2 * 256 + 3 * 512 + 64 + 4 * 512
        );
    }
}
