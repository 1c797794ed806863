//! Pool registry: data-source name → [`ConnectionPool`].
//!
//! Pools are created on first lookup by an injected factory and cached for
//! the registry's lifetime. A pool is never replaced once created.
//!
//! Lookups of existing pools only take the map's read lock. Creation runs
//! under a per-name guard, so concurrent first lookups of one name build
//! exactly one pool while lookups of other names proceed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::RegistryError;
use crate::pool::{ConnectionPool, PoolStats};

/// Builds the pool for a data-source name.
pub type PoolFactory = Box<dyn Fn(&str) -> Result<ConnectionPool, RegistryError> + Send + Sync>;

pub struct PoolRegistry {
    factory: PoolFactory,
    pools: RwLock<HashMap<String, ConnectionPool>>,
    /// Creation guards for names whose first lookup is in flight.
    creating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retired: AtomicBool,
}

impl PoolRegistry {
    pub fn new(factory: PoolFactory) -> Self {
        Self {
            factory,
            pools: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            retired: AtomicBool::new(false),
        }
    }

    /// Pool for `name`, creating it through the factory if absent.
    ///
    /// A retired registry only returns pools it already holds.
    pub fn get(&self, name: &str) -> Result<ConnectionPool, RegistryError> {
        if let Some(pool) = self.existing(name) {
            return Ok(pool);
        }
        if self.is_retired() {
            return Err(RegistryError::Retired(name.to_string()));
        }

        let guard = Arc::clone(
            self.creating
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name.to_string())
                .or_default(),
        );
        let created = {
            let _creating = guard.lock().unwrap_or_else(PoisonError::into_inner);
            self.create(name)
        };
        self.creating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        created
    }

    /// Runs with the creation guard for `name` held.
    fn create(&self, name: &str) -> Result<ConnectionPool, RegistryError> {
        // Another caller may have finished while we waited on the guard.
        if let Some(pool) = self.existing(name) {
            return Ok(pool);
        }
        if self.is_retired() {
            return Err(RegistryError::Retired(name.to_string()));
        }

        let pool = (self.factory)(name)?;
        let pool = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(pool)
            .clone();
        tracing::debug!(
            datasource = %name,
            capacity = pool.capacity(),
            "created connection pool"
        );
        Ok(pool)
    }

    /// Pool for `name` only if it was already created.
    pub fn existing(&self, name: &str) -> Option<ConnectionPool> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All pools, sorted by data-source name.
    pub fn all(&self) -> Vec<ConnectionPool> {
        let mut pools: Vec<_> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }

    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.all().iter().map(ConnectionPool::stats).collect()
    }

    /// Stop creating pools. Existing pools stay retrievable.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.names())
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}
