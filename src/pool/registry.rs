use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{PlaneError, Result};
use crate::pool::{ResourcePool, ResourceRequest, DEFAULT_POOL};

type PoolMap = HashMap<String, Arc<ResourcePool>>;

/// Read-mostly table of resource pools.
///
/// Readers take a cheap `Arc` snapshot; administrative edits build a new map
/// and swap it in, so a validation never observes a half-applied update.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: RwLock<Arc<PoolMap>>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    /// A registry holding only the default pool.
    pub fn new() -> Self {
        let mut map = PoolMap::new();
        map.insert(
            DEFAULT_POOL.to_string(),
            Arc::new(ResourcePool::default_pool()),
        );
        Self {
            pools: RwLock::new(Arc::new(map)),
        }
    }

    pub fn from_pools(pools: Vec<ResourcePool>) -> Result<Self> {
        let registry = Self::new();
        for pool in pools {
            registry.upsert(pool)?;
        }
        Ok(registry)
    }

    /// Load a JSON array of pools. The default pool is added if the file
    /// doesn't define one.
    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let pools: Vec<ResourcePool> = serde_json::from_str(&raw)?;
        Self::from_pools(pools)
    }

    pub fn snapshot(&self) -> Arc<PoolMap> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourcePool>> {
        self.snapshot().get(name).cloned()
    }

    /// All pools sorted by name.
    pub fn all(&self) -> Vec<Arc<ResourcePool>> {
        let mut pools: Vec<_> = self.snapshot().values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    /// Insert or replace a pool. Takes effect for runs created afterwards.
    pub fn upsert(&self, pool: ResourcePool) -> Result<()> {
        pool.check_definition()?;
        let mut guard = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = PoolMap::clone(&guard);
        tracing::info!(pool = %pool.name, backend = ?pool.backend, "Resource pool updated");
        next.insert(pool.name.clone(), Arc::new(pool));
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove a pool. The default pool can't be removed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_POOL {
            return Err(PlaneError::Validation(
                "the default pool cannot be removed".into(),
            ));
        }
        let mut guard = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.contains_key(name) {
            return Ok(false);
        }
        let mut next = PoolMap::clone(&guard);
        next.remove(name);
        *guard = Arc::new(next);
        Ok(true)
    }

    /// Resolve `pool` and validate/default `request` against the snapshot
    /// current at call time.
    pub fn validate(
        &self,
        pool: &str,
        request: &ResourceRequest,
    ) -> Result<(Arc<ResourcePool>, ResourceRequest)> {
        let pool = self
            .get(pool)
            .ok_or_else(|| PlaneError::PoolNotFound(pool.to_string()))?;
        let shaped = pool.validate(request)?;
        Ok((pool, shaped))
    }
}
