//! Generic guarded state-advance driver with durable checkpoints.
//!
//! A [`Pipeline`] owns a set of named worklists and an ordered list of
//! [`Transition`]s. Each tick, every entity gets at most one transition:
//!
//! guard (`valid`) → `pre` + pre-checkpoint → `processing` → `post` →
//! post-checkpoint → move between lists → `success` (or `fail`, leaving the entity in place).
//!
//! The in-memory lists never run ahead of the checkpoint store: an entity is
//! only moved after the store has accepted the post-checkpoint, and a store
//! failure aborts the tick with the error.

pub mod checkpoint;
pub mod worklist;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{PlaneError, Result};

pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, Phase,
};
pub use worklist::{ListName, SharedWorkLists, WorkItem, WorkLists};

/// List name recorded for entities admitted from outside the pipeline.
const ADMIT: &str = "admit";

/// One guarded step of a pipeline.
#[async_trait]
pub trait Transition<E, C>: Send + Sync
where
    E: WorkItem,
    C: Send + Sync,
{
    fn name(&self) -> &'static str;

    /// Lists an entity must be in for this transition to be considered.
    fn sources(&self) -> &[ListName];

    /// Where the entity goes after success. `None` takes it out of the
    /// pipeline and archives its checkpoint.
    fn target(&self) -> Option<ListName>;

    async fn valid(&self, entity: &E, ctx: &C) -> bool;

    /// Stage the entity before side effects. The staged value is what the
    /// pre-checkpoint records and what `processing` receives, so anything
    /// the side effect must reuse on a retry (e.g. a planned identifier)
    /// belongs here.
    fn pre(&self, entity: &E, _ctx: &C) -> E {
        entity.clone()
    }

    async fn processing(&self, entity: E, ctx: &C) -> Result<E>;

    /// Finish the processed entity before it is checkpointed and moved.
    /// `before` is the staged value `processing` received.
    async fn post(&self, _before: &E, after: E, _ctx: &C) -> Result<E> {
        Ok(after)
    }

    async fn success(&self, _before: &E, _after: &E, _ctx: &C) {}

    async fn fail(&self, entity: &E, _ctx: &C, error: &PlaneError) {
        tracing::warn!(
            transition = self.name(),
            key = %entity.key(),
            error = %error,
            "Transition failed, entity left for retry"
        );
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub advanced: usize,
    pub failed: usize,
}

pub struct Pipeline<E, C> {
    name: &'static str,
    lists: SharedWorkLists<E>,
    store: Arc<dyn CheckpointStore>,
    transitions: Vec<Arc<dyn Transition<E, C>>>,
    tick_lock: Mutex<()>,
}

impl<E, C> Pipeline<E, C>
where
    E: WorkItem,
    C: Send + Sync,
{
    pub fn new(name: &'static str, lists: &[ListName], store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            name,
            lists: Arc::new(Mutex::new(WorkLists::new(lists))),
            store,
            transitions: Vec::new(),
            tick_lock: Mutex::new(()),
        }
    }

    /// Transitions are tried in registration order.
    pub fn with_transition<T>(mut self, transition: T) -> Self
    where
        T: Transition<E, C> + 'static,
    {
        self.transitions.push(Arc::new(transition));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lists(&self) -> SharedWorkLists<E> {
        self.lists.clone()
    }

    /// Durably add `entity` to `list`. Returns false if the entity is
    /// already in the pipeline.
    pub async fn admit(&self, list: ListName, entity: E) -> Result<bool> {
        let key = entity.key();
        let mut lists = self.lists.lock().await;
        if lists.contains(&key) {
            return Ok(false);
        }
        let checkpoint = Checkpoint::new(key, self.name, ADMIT, Phase::Post, list, &entity)?;
        self.store.save(&checkpoint).await?;
        lists.insert(list, entity)?;
        tracing::debug!(pipeline = self.name, key = %key, list, "Entity admitted");
        Ok(true)
    }

    /// Rebuild the worklists from the checkpoint store. Must run before the
    /// first tick.
    pub async fn recover(&self) -> Result<usize> {
        let checkpoints = self.store.active().await?;
        let mut lists = self.lists.lock().await;
        let mut restored = 0;
        for checkpoint in checkpoints {
            if checkpoint.pipeline != self.name {
                continue;
            }
            let Some(list) = lists.resolve(&checkpoint.list) else {
                tracing::warn!(
                    pipeline = self.name,
                    key = %checkpoint.key,
                    list = %checkpoint.list,
                    "Checkpoint names an unknown list, skipping"
                );
                continue;
            };
            let entity: E = match serde_json::from_value(checkpoint.entity) {
                Ok(entity) => entity,
                Err(e) => {
                    tracing::warn!(pipeline = self.name, key = %checkpoint.key, error = %e, "Undecodable checkpoint, skipping");
                    continue;
                }
            };
            if checkpoint.phase == Phase::Pre {
                tracing::info!(
                    pipeline = self.name,
                    key = %checkpoint.key,
                    transition = %checkpoint.transition,
                    "Resuming interrupted transition"
                );
            }
            lists.insert(list, entity)?;
            restored += 1;
        }
        tracing::info!(pipeline = self.name, restored, "Worklists rebuilt from checkpoints");
        Ok(restored)
    }

    /// Give every entity at most one transition.
    pub async fn tick(&self, ctx: &C) -> Result<TickReport> {
        let _guard = self.tick_lock.lock().await;
        let snapshot = self.lists.lock().await.entries();
        let mut report = TickReport::default();

        for (list, entity) in snapshot {
            for transition in &self.transitions {
                if !transition.sources().contains(&list) {
                    continue;
                }
                if !transition.valid(&entity, ctx).await {
                    continue;
                }
                if self.apply(transition.as_ref(), list, &entity, ctx).await? {
                    report.advanced += 1;
                } else {
                    report.failed += 1;
                }
                break;
            }
        }
        Ok(report)
    }

    async fn apply(
        &self,
        transition: &dyn Transition<E, C>,
        list: ListName,
        entity: &E,
        ctx: &C,
    ) -> Result<bool> {
        let key = entity.key();
        let staged = transition.pre(entity, ctx);
        let pre = Checkpoint::new(key, self.name, transition.name(), Phase::Pre, list, &staged)?;
        self.store.save(&pre).await?;
        self.lists.lock().await.update(staged.clone());

        let processed = match transition.processing(staged.clone(), ctx).await {
            Ok(next) => transition.post(&staged, next, ctx).await,
            Err(e) => Err(e),
        };
        let next = match processed {
            Ok(next) => next,
            Err(e) => {
                transition.fail(&staged, ctx, &e).await;
                if e.is_infrastructure() {
                    return Err(e);
                }
                return Ok(false);
            }
        };

        match transition.target() {
            Some(target) => {
                let post =
                    Checkpoint::new(key, self.name, transition.name(), Phase::Post, target, &next)?;
                self.store.save(&post).await?;
                self.lists.lock().await.move_to(target, next.clone())?;
            }
            None => {
                self.store.archive(key).await?;
                self.lists.lock().await.remove(&key);
            }
        }
        tracing::debug!(
            pipeline = self.name,
            transition = transition.name(),
            key = %key,
            "Transition applied"
        );
        transition.success(&staged, &next, ctx).await;
        Ok(true)
    }
}
