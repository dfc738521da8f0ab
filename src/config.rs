use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

use crate::event::dispatch::ProcessingStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration for one event layer instance.
///
/// Every field deserializes with a default, so adapters can override a
/// handful of knobs and leave the rest to the profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventLayerConfig {
    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub strategy: ProcessingStrategy,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_drain_interval", with = "duration_ms")]
    pub drain_interval: Duration,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_throttle_delay", with = "duration_ms")]
    pub throttle_delay: Duration,

    #[serde(default = "default_emit_timeout", with = "duration_ms")]
    pub emit_timeout: Duration,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_backoff", with = "duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            strategy: ProcessingStrategy::default(),
            queue_capacity: default_queue_capacity(),
            drain_interval: default_drain_interval(),
            batch_size: default_batch_size(),
            throttle_delay: default_throttle_delay(),
            emit_timeout: default_emit_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_correlation_ttl", with = "duration_ms")]
    pub ttl: Duration,

    #[serde(default = "default_sweep_interval", with = "duration_ms")]
    pub sweep_interval: Duration,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_time_horizon", with = "duration_ms")]
    pub time_horizon: Duration,

    /// Completion patterns as `"typeA->typeB"` strings.
    #[serde(default)]
    pub completion_patterns: Vec<String>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl: default_correlation_ttl(),
            sweep_interval: default_sweep_interval(),
            max_depth: default_max_depth(),
            time_horizon: default_time_horizon(),
            completion_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_check_interval", with = "duration_ms")]
    pub check_interval: Duration,

    #[serde(default = "default_latency_threshold", with = "duration_ms")]
    pub latency_threshold: Duration,

    #[serde(default = "default_health_threshold")]
    pub default_threshold: f64,

    /// Per-component overrides for the healthy threshold.
    #[serde(default)]
    pub component_thresholds: HashMap<String, f64>,

    #[serde(default)]
    pub auto_recovery: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            check_interval: default_check_interval(),
            latency_threshold: default_latency_threshold(),
            default_threshold: default_health_threshold(),
            component_thresholds: HashMap::new(),
            auto_recovery: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_window", with = "duration_ms")]
    pub metrics_window: Duration,

    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_maintenance_interval", with = "duration_ms")]
    pub maintenance_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            metrics_window: default_metrics_window(),
            max_samples: default_max_samples(),
            history_limit: default_history_limit(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl EventLayerConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &str) -> ConfigResult<Self> {
        from_file(path)
    }

    /// Profile for swarm/agent coordination: inline delivery, long
    /// correlation windows, strict health bar.
    pub fn coordination() -> Self {
        let mut config = Self::default();
        config.processing.strategy = ProcessingStrategy::Immediate;
        config.correlation.ttl = Duration::from_secs(600);
        config.health.default_threshold = 0.8;
        config.correlation.completion_patterns =
            vec!["coordination:task->coordination:result".to_string()];
        config
    }

    /// Profile for health/metrics pipelines.
    pub fn monitoring() -> Self {
        let mut config = Self::default();
        config.processing.strategy = ProcessingStrategy::Immediate;
        config.correlation.ttl = Duration::from_secs(300);
        config.correlation.completion_patterns =
            vec!["monitoring:alert->monitoring:recovery".to_string()];
        config
    }

    /// Profile for messaging channels: throttled delivery to protect
    /// rate-limited transports.
    pub fn communication() -> Self {
        let mut config = Self::default();
        config.processing.strategy = ProcessingStrategy::Throttled;
        config.correlation.ttl = Duration::from_secs(300);
        config.health.default_threshold = 0.7;
        config.correlation.completion_patterns =
            vec!["communication:request->communication:response".to_string()];
        config
    }

    /// Profile for ML/neural engines: batched delivery, long-running
    /// correlations.
    pub fn neural() -> Self {
        let mut config = Self::default();
        config.processing.strategy = ProcessingStrategy::Batched;
        config.correlation.ttl = Duration::from_secs(900);
        config.health.default_threshold = 0.7;
        config.correlation.completion_patterns =
            vec!["neural:training->neural:checkpoint".to_string()];
        config
    }

    /// Profile for workflow/orchestration engines.
    pub fn workflow() -> Self {
        let mut config = Self::default();
        config.processing.strategy = ProcessingStrategy::Queued;
        config.correlation.ttl = Duration::from_secs(900);
        config.correlation.completion_patterns =
            vec!["workflow:start->workflow:complete".to_string()];
        config
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

// Default value definitions
fn default_true() -> bool {
    true
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_drain_interval() -> Duration {
    Duration::from_millis(100)
}
fn default_batch_size() -> usize {
    50
}
fn default_throttle_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_emit_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}
fn default_correlation_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_max_depth() -> usize {
    100
}
fn default_time_horizon() -> Duration {
    Duration::from_secs(60)
}
fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_latency_threshold() -> Duration {
    Duration::from_secs(1)
}
fn default_health_threshold() -> f64 {
    0.75
}
fn default_metrics_window() -> Duration {
    Duration::from_secs(300)
}
fn default_max_samples() -> usize {
    10_000
}
fn default_history_limit() -> usize {
    1000
}
fn default_maintenance_interval() -> Duration {
    Duration::from_secs(60)
}

// Serde helper for Duration fields expressed in milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
