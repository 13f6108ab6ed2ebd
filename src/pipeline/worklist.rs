use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PlaneError, Result};

/// Name of one in-memory worklist, e.g. `"due"` or `"running"`.
pub type ListName = &'static str;

/// An entity a pipeline can hold and checkpoint.
pub trait WorkItem: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identity used for worklist membership and checkpoint keys.
    fn key(&self) -> Uuid;
}

/// Named sets of entities with explicit move operations between them.
///
/// An entity is in at most one list at a time.
#[derive(Debug, Clone)]
pub struct WorkLists<E> {
    lists: BTreeMap<ListName, Vec<E>>,
}

pub type SharedWorkLists<E> = Arc<Mutex<WorkLists<E>>>;

impl<E: WorkItem> WorkLists<E> {
    pub fn new(names: &[ListName]) -> Self {
        Self {
            lists: names.iter().map(|n| (*n, Vec::new())).collect(),
        }
    }

    pub fn names(&self) -> Vec<ListName> {
        self.lists.keys().copied().collect()
    }

    /// The registered name matching `name`, if any.
    pub fn resolve(&self, name: &str) -> Option<ListName> {
        self.lists.keys().find(|n| **n == name).copied()
    }

    /// Put `entity` into `list`, replacing wherever it was before.
    pub fn insert(&mut self, list: ListName, entity: E) -> Result<()> {
        if !self.lists.contains_key(list) {
            return Err(PlaneError::Internal(format!("unknown worklist {}", list)));
        }
        self.remove(&entity.key());
        if let Some(entries) = self.lists.get_mut(list) {
            entries.push(entity);
        }
        Ok(())
    }

    pub fn get(&self, list: &str) -> &[E] {
        self.lists.get(list).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Which list holds `key`.
    pub fn locate(&self, key: &Uuid) -> Option<ListName> {
        self.lists
            .iter()
            .find(|(_, entries)| entries.iter().any(|e| e.key() == *key))
            .map(|(name, _)| *name)
    }

    pub fn find(&self, key: &Uuid) -> Option<&E> {
        self.lists
            .values()
            .flat_map(|entries| entries.iter())
            .find(|e| e.key() == *key)
    }

    pub fn contains(&self, key: &Uuid) -> bool {
        self.locate(key).is_some()
    }

    /// Move the entity to `to`, storing `entity` as its new value.
    pub fn move_to(&mut self, to: ListName, entity: E) -> Result<()> {
        self.insert(to, entity)
    }

    /// Replace the stored value of an entity without moving it.
    pub fn update(&mut self, entity: E) -> bool {
        let key = entity.key();
        for entries in self.lists.values_mut() {
            if let Some(slot) = entries.iter_mut().find(|e| e.key() == key) {
                *slot = entity;
                return true;
            }
        }
        false
    }

    pub fn remove(&mut self, key: &Uuid) -> Option<E> {
        for entries in self.lists.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.key() == *key) {
                return Some(entries.remove(pos));
            }
        }
        None
    }

    /// Every entity with the list holding it, in list order.
    pub fn entries(&self) -> Vec<(ListName, E)> {
        self.lists
            .iter()
            .flat_map(|(name, entries)| entries.iter().map(move |e| (*name, e.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lists.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
