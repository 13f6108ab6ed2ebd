//! Resource pools: named, bounded allocation domains that tasks are
//! scheduled against.
//!
//! A pool shapes and validates a task's resource request before it is
//! handed to a backend; binding the request to physical capacity is the
//! backend's job.

pub mod registry;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PlaneError, Result};
use crate::scheduler::BackendKind;

pub use registry::PoolRegistry;

/// Name of the pool that always exists.
pub const DEFAULT_POOL: &str = "default";

pub const CPU: &str = "cpu";
pub const MEMORY_MB: &str = "memory_mb";
pub const GPU: &str = "gpu";

/// Bounds for one named resource within a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBound {
    pub name: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub default: Option<f64>,
}

impl ResourceBound {
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min: None,
            max: None,
            default: None,
        }
    }

    pub fn new(name: impl Into<String>, min: f64, max: f64, default: f64) -> Self {
        Self {
            name: name.into(),
            min: Some(min),
            max: Some(max),
            default: Some(default),
        }
    }

    fn check(&self, value: f64, pool: &str) -> Result<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(PlaneError::Validation(format!(
                "{} = {} is not a valid amount in pool {}",
                self.name, value, pool
            )));
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(PlaneError::Validation(format!(
                    "{} = {} exceeds max {} of pool {}",
                    self.name, value, max, pool
                )));
            }
        }
        if let Some(min) = self.min {
            if value < min {
                return Err(PlaneError::Validation(format!(
                    "{} = {} is below min {} of pool {}",
                    self.name, value, min, pool
                )));
            }
        }
        Ok(())
    }
}

/// Requested amounts keyed by resource name (`cpu`, `memory_mb`, `gpu`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequest(BTreeMap<String, f64>);

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.0.insert(name.into(), amount);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub name: String,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<ResourceBound>,
    /// Upper bound on simultaneously active tasks in this pool.
    #[serde(default)]
    pub max_running: Option<u32>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            node_selector: BTreeMap::new(),
            resources: Vec::new(),
            max_running: None,
        }
    }

    /// The always-present pool: local containers, unconstrained cpu and memory.
    pub fn default_pool() -> Self {
        Self::new(DEFAULT_POOL, BackendKind::Docker)
            .with_resource(ResourceBound::unbounded(CPU))
            .with_resource(ResourceBound::unbounded(MEMORY_MB))
    }

    pub fn with_resource(mut self, bound: ResourceBound) -> Self {
        self.resources.retain(|b| b.name != bound.name);
        self.resources.push(bound);
        self
    }

    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    pub fn with_max_running(mut self, max_running: u32) -> Self {
        self.max_running = Some(max_running);
        self
    }

    pub fn bound(&self, name: &str) -> Option<&ResourceBound> {
        self.resources.iter().find(|b| b.name == name)
    }

    /// Checks the pool definition itself: `min <= default <= max` for every
    /// declared resource, names unique.
    pub fn check_definition(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PlaneError::Validation("pool name must not be empty".into()));
        }
        for (i, bound) in self.resources.iter().enumerate() {
            if self.resources[..i].iter().any(|b| b.name == bound.name) {
                return Err(PlaneError::Validation(format!(
                    "pool {} declares {} twice",
                    self.name, bound.name
                )));
            }
            if let (Some(min), Some(max)) = (bound.min, bound.max) {
                if min > max {
                    return Err(PlaneError::Validation(format!(
                        "pool {}: {} min {} > max {}",
                        self.name, bound.name, min, max
                    )));
                }
            }
            if let Some(default) = bound.default {
                bound.check(default, &self.name)?;
            }
        }
        Ok(())
    }

    /// Validates `request` against this pool's bounds and fills in defaults
    /// for declared resources the request omits.
    pub fn validate(&self, request: &ResourceRequest) -> Result<ResourceRequest> {
        let mut shaped = BTreeMap::new();
        for (name, amount) in request.iter() {
            let bound = self.bound(name).ok_or_else(|| {
                PlaneError::Validation(format!(
                    "pool {} does not offer resource {}",
                    self.name, name
                ))
            })?;
            bound.check(*amount, &self.name)?;
            shaped.insert(name.clone(), *amount);
        }
        for bound in &self.resources {
            if shaped.contains_key(&bound.name) {
                continue;
            }
            if let Some(default) = bound.default {
                shaped.insert(bound.name.clone(), default);
            }
        }
        Ok(ResourceRequest(shaped))
    }
}
