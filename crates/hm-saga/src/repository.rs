//! Saga repository port with optimistic concurrency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use hm_core::{HeroError, Result};

use crate::instance::SagaInstance;

/// Persistence for saga instances, keyed by correlation id.
///
/// `update` is version-checked: it succeeds only when the stored version
/// equals the caller's loaded version, then advances it by one. Within a
/// single correlation this serializes orchestrator executions.
#[async_trait]
pub trait SagaRepository<S: Send + Sync>: Send + Sync {
    async fn find(&self, correlation_id: &str) -> Result<Option<SagaInstance<S>>>;

    /// Insert a new instance. Fails with `ConcurrencyConflict` when the
    /// correlation id already exists.
    async fn save(&self, instance: &SagaInstance<S>) -> Result<()>;

    /// Version-checked update. Returns the stored instance with its
    /// version advanced.
    async fn update(&self, instance: &SagaInstance<S>) -> Result<SagaInstance<S>>;

    async fn delete(&self, correlation_id: &str) -> Result<()>;

    async fn find_by_state(&self, state: &str) -> Result<Vec<SagaInstance<S>>>;

    /// Instances not yet completed whose `updated_at` is older than
    /// `older_than` — the timeout sweeper's feed.
    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<SagaInstance<S>>>;
}

pub struct InMemorySagaRepository<S> {
    instances: DashMap<String, SagaInstance<S>>,
}

impl<S> Default for InMemorySagaRepository<S> {
    fn default() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }
}

impl<S: Clone + Send + Sync> InMemorySagaRepository<S> {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> SagaRepository<S> for InMemorySagaRepository<S> {
    async fn find(&self, correlation_id: &str) -> Result<Option<SagaInstance<S>>> {
        Ok(self.instances.get(correlation_id).map(|i| i.clone()))
    }

    async fn save(&self, instance: &SagaInstance<S>) -> Result<()> {
        match self.instances.entry(instance.correlation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HeroError::ConcurrencyConflict(
                format!("saga '{}' already exists", instance.correlation_id),
            )),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(instance.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, instance: &SagaInstance<S>) -> Result<SagaInstance<S>> {
        let mut stored = self
            .instances
            .get_mut(&instance.correlation_id)
            .ok_or_else(|| {
                HeroError::storage_permanent(format!(
                    "saga '{}' not found",
                    instance.correlation_id
                ))
            })?;
        if stored.version != instance.version {
            return Err(HeroError::ConcurrencyConflict(format!(
                "saga '{}' version {} does not match loaded version {}",
                instance.correlation_id, stored.version, instance.version
            )));
        }
        let mut updated = instance.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, correlation_id: &str) -> Result<()> {
        self.instances.remove(correlation_id);
        Ok(())
    }

    async fn find_by_state(&self, state: &str) -> Result<Vec<SagaInstance<S>>> {
        Ok(self
            .instances
            .iter()
            .filter(|i| i.current_state == state)
            .map(|i| i.clone())
            .collect())
    }

    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<SagaInstance<S>>> {
        Ok(self
            .instances
            .iter()
            .filter(|i| !i.is_completed && i.updated_at < older_than)
            .map(|i| i.clone())
            .collect())
    }
}
