//! Owner-scoped registry of named event layers.
//!
//! Adapters usually run one layer per subsystem (coordination,
//! monitoring, communication, ...). The registry holds them by name and
//! drives fleet-wide start and shutdown. Callers own the registry;
//! nothing here is process-global.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::EventLayerConfig;
use crate::event::manager::EventManager;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Manager already registered: {0}")]
    DuplicateManager(String),
}

#[derive(Default)]
pub struct ManagerRegistry {
    managers: DashMap<String, Arc<EventManager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and registers a stopped manager under `name`.
    pub fn create(
        &self,
        name: &str,
        config: EventLayerConfig,
    ) -> crate::error::Result<Arc<EventManager>> {
        if self.managers.contains_key(name) {
            return Err(RegistryError::DuplicateManager(name.to_string()).into());
        }
        let manager = EventManager::new(name, config)?;
        self.managers.insert(name.to_string(), manager.clone());
        info!(manager = %name, "event layer registered");
        Ok(manager)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EventManager>> {
        self.managers.get(name).map(|m| m.clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.managers.iter().map(|m| m.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Stops and removes one manager. Returns whether it existed.
    pub async fn remove(&self, name: &str) -> bool {
        match self.managers.remove(name) {
            Some((_, manager)) => {
                manager.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn start_all(&self) {
        let managers: Vec<Arc<EventManager>> =
            self.managers.iter().map(|m| m.clone()).collect();
        for manager in managers {
            manager.start().await;
        }
    }

    /// Stops every manager, bounding each stop by `deadline`. A manager
    /// that cannot stop in time is logged and skipped; the managers stay
    /// registered and can be started again.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let managers: Vec<(String, Arc<EventManager>)> = self
            .managers
            .iter()
            .map(|m| (m.key().clone(), m.clone()))
            .collect();
        for (name, manager) in managers {
            if timeout(deadline, manager.stop()).await.is_err() {
                warn!(manager = %name, "manager did not stop within the deadline");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn create_get_and_remove() {
        let registry = ManagerRegistry::new();
        let coordination = registry
            .create("coordination", EventLayerConfig::coordination())
            .unwrap();
        registry
            .create("monitoring", EventLayerConfig::monitoring())
            .unwrap();

        let duplicate = registry.create("coordination", EventLayerConfig::default());
        assert!(matches!(
            duplicate,
            Err(Error::Registry(RegistryError::DuplicateManager(_)))
        ));

        let fetched = registry.get("coordination").unwrap();
        assert!(Arc::ptr_eq(&fetched, &coordination));
        assert!(registry.get("unknown").is_none());

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["coordination", "monitoring"]);

        assert!(registry.remove("monitoring").await);
        assert!(!registry.remove("monitoring").await);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn start_all_and_shutdown_all() {
        let registry = ManagerRegistry::new();
        registry
            .create("coordination", EventLayerConfig::coordination())
            .unwrap();
        registry
            .create("workflow", EventLayerConfig::default())
            .unwrap();

        registry.start_all().await;
        for name in registry.list() {
            assert!(registry.get(&name).unwrap().is_running());
        }

        registry.shutdown_all(Duration::from_secs(1)).await;
        for name in registry.list() {
            assert!(!registry.get(&name).unwrap().is_running());
        }
        // still registered, restartable
        assert_eq!(registry.len(), 2);
    }
}
