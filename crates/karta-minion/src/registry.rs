//! Named minions and round-robin selection among them.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::MinionError;
use crate::service::{MinionHealth, MinionService};

/// A remote worker and the stub used to reach it.
#[derive(Clone)]
pub struct KartaMinion {
    pub name: String,
    pub address: String,
    pub service: Arc<dyn MinionService>,
}

impl KartaMinion {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        service: Arc<dyn MinionService>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            service,
        }
    }
}

impl std::fmt::Debug for KartaMinion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KartaMinion")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

/// Registered minions with round-robin selection.
#[derive(Default)]
pub struct MinionRegistry {
    minions: RwLock<Vec<Arc<KartaMinion>>>,
    cursor: AtomicUsize,
}

impl MinionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a minion, replacing any registered under the same name.
    pub fn add(&self, minion: KartaMinion) {
        let mut minions = self.minions.write();
        let minion = Arc::new(minion);
        match minions.iter_mut().find(|m| m.name == minion.name) {
            Some(slot) => *slot = minion,
            None => minions.push(minion),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut minions = self.minions.write();
        let before = minions.len();
        minions.retain(|m| m.name != name);
        minions.len() != before
    }

    pub fn get(&self, name: &str) -> Option<Arc<KartaMinion>> {
        self.minions.read().iter().find(|m| m.name == name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<KartaMinion>, MinionError> {
        self.get(name).ok_or_else(|| MinionError::UnknownMinion {
            name: name.to_string(),
        })
    }

    /// Next minion in registration order, wrapping around. `None` when empty.
    pub fn next(&self) -> Option<Arc<KartaMinion>> {
        let minions = self.minions.read();
        if minions.is_empty() {
            return None;
        }
        let slot = self.cursor.fetch_add(1, Ordering::SeqCst) % minions.len();
        minions.get(slot).cloned()
    }

    pub fn len(&self) -> usize {
        self.minions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.minions.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.minions.read().iter().map(|m| m.name.clone()).collect()
    }

    pub fn clear(&self) {
        self.minions.write().clear();
        self.cursor.store(0, Ordering::SeqCst);
    }

    /// Probes every minion; a failed probe is reported, not raised.
    pub fn health_check(&self) -> Vec<(String, Result<MinionHealth, MinionError>)> {
        let minions: Vec<Arc<KartaMinion>> = self.minions.read().clone();
        minions
            .into_iter()
            .map(|minion| {
                let health = minion.service.health();
                if let Err(err) = &health {
                    tracing::warn!(minion = %minion.name, error = %err, "minion health check failed");
                }
                (minion.name.clone(), health)
            })
            .collect()
    }
}
