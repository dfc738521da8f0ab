use thiserror::Error;

use crate::config::ConfigError;
use crate::correlation::CorrelationError;
use crate::event::dispatch::EmitError;
use crate::event::envelope::ValidationError;
use crate::event::subscription::SubscriptionError;
use crate::health::HealthError;
use crate::registry::RegistryError;
use crate::wrapper::WrapError;

/// Crate-wide error. Each module keeps its own narrow enum; this one
/// exists so `?` composes for callers working across subsystems.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Emit error: {0}")]
    Emit(#[from] EmitError),
    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),
    #[error("Wrap error: {0}")]
    Wrap(#[from] WrapError),
    #[error("Health error: {0}")]
    Health(#[from] HealthError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, Error>;
