
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mlplane::error::{PlaneError, Result};
use mlplane::pipeline::{
    CheckpointStore, FileCheckpointStore, ListName, MemoryCheckpointStore, Phase, Pipeline,
    Transition, WorkItem,
};

use test_harness::FlakyStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Parcel {
    id: Uuid,
    label: Option<String>,
    fragile: bool,
    broken: bool,
}

impl Parcel {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            label: None,
            fragile: false,
            broken: false,
        }
    }
}

impl WorkItem for Parcel {
    fn key(&self) -> Uuid {
        self.id
    }
}

#[derive(Default)]
struct Depot {
    shipped: Mutex<Vec<Uuid>>,
    failures: AtomicUsize,
    successes: AtomicUsize,
}

/// Labels a parcel; the label is planned before the side effect.
struct Pack;

#[async_trait]
impl Transition<Parcel, Depot> for Pack {
    fn name(&self) -> &'static str {
        "pack"
    }

    fn sources(&self) -> &[ListName] {
        &["new"]
    }

    fn target(&self) -> Option<ListName> {
        Some("packed")
    }

    async fn valid(&self, _parcel: &Parcel, _depot: &Depot) -> bool {
        true
    }

    fn pre(&self, parcel: &Parcel, _depot: &Depot) -> Parcel {
        let mut staged = parcel.clone();
        if staged.label.is_none() {
            staged.label = Some(Uuid::new_v4().to_string());
        }
        staged
    }

    async fn processing(&self, parcel: Parcel, _depot: &Depot) -> Result<Parcel> {
        if parcel.broken {
            return Err(PlaneError::Validation("parcel is broken".to_string()));
        }
        Ok(parcel)
    }

    async fn success(&self, _before: &Parcel, _after: &Parcel, depot: &Depot) {
        depot.successes.fetch_add(1, Ordering::SeqCst);
    }

    async fn fail(&self, _parcel: &Parcel, depot: &Depot, _error: &PlaneError) {
        depot.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fragile parcels are discarded before anything else is considered.
struct Discard;

#[async_trait]
impl Transition<Parcel, Depot> for Discard {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn sources(&self) -> &[ListName] {
        &["new", "packed"]
    }

    fn target(&self) -> Option<ListName> {
        None
    }

    async fn valid(&self, parcel: &Parcel, _depot: &Depot) -> bool {
        parcel.fragile
    }

    async fn processing(&self, parcel: Parcel, _depot: &Depot) -> Result<Parcel> {
        Ok(parcel)
    }
}

struct Ship;

#[async_trait]
impl Transition<Parcel, Depot> for Ship {
    fn name(&self) -> &'static str {
        "ship"
    }

    fn sources(&self) -> &[ListName] {
        &["packed"]
    }

    fn target(&self) -> Option<ListName> {
        None
    }

    async fn valid(&self, _parcel: &Parcel, _depot: &Depot) -> bool {
        true
    }

    async fn processing(&self, parcel: Parcel, depot: &Depot) -> Result<Parcel> {
        depot.shipped.lock().unwrap().push(parcel.id);
        Ok(parcel)
    }
}

const LISTS: [ListName; 2] = ["new", "packed"];

fn depot_pipeline(store: Arc<dyn CheckpointStore>) -> Pipeline<Parcel, Depot> {
    Pipeline::new("depot", &LISTS, store)
        .with_transition(Discard)
        .with_transition(Pack)
        .with_transition(Ship)
}

#[tokio::test]
async fn test_entity_advances_one_list_per_tick() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let pipeline = depot_pipeline(store.clone());
    let depot = Depot::default();
    let parcel = Parcel::new();
    pipeline.admit("new", parcel.clone()).await.unwrap();

    pipeline.tick(&depot).await.unwrap();
    let lists = pipeline.lists();
    assert_eq!(lists.lock().await.locate(&parcel.id), Some("packed"));
    assert!(depot.shipped.lock().unwrap().is_empty());

    pipeline.tick(&depot).await.unwrap();
    assert!(!lists.lock().await.contains(&parcel.id));
    assert_eq!(*depot.shipped.lock().unwrap(), vec![parcel.id]);

    // leaving the pipeline archives the checkpoint
    assert!(store.read(parcel.id).await.unwrap().is_none());
    let archived = store.archived(parcel.id).await.unwrap();
    assert_eq!(archived.transition, "pack");
    assert_eq!(depot.successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_first_valid_transition_wins() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let pipeline = depot_pipeline(store);
    let depot = Depot::default();
    let mut parcel = Parcel::new();
    parcel.fragile = true;
    pipeline.admit("new", parcel.clone()).await.unwrap();

    let report = pipeline.tick(&depot).await.unwrap();
    assert_eq!(report.advanced, 1);
    assert!(pipeline.lists().lock().await.is_empty());
    assert_eq!(depot.successes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_processing_leaves_entity_in_place() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let pipeline = depot_pipeline(store.clone());
    let depot = Depot::default();
    let mut parcel = Parcel::new();
    parcel.broken = true;
    pipeline.admit("new", parcel.clone()).await.unwrap();

    let report = pipeline.tick(&depot).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(depot.failures.load(Ordering::SeqCst), 1);

    let lists = pipeline.lists();
    let lists = lists.lock().await;
    assert_eq!(lists.locate(&parcel.id), Some("new"));
    // the staged value was kept, so a retry reuses the planned label
    let staged = lists.find(&parcel.id).unwrap().clone();
    assert!(staged.label.is_some());
    drop(lists);

    let checkpoint = store.read(parcel.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.phase, Phase::Pre);
    assert_eq!(checkpoint.list, "new");

    pipeline.tick(&depot).await.unwrap();
    let lists = pipeline.lists();
    assert_eq!(lists.lock().await.find(&parcel.id), Some(&staged));
}

#[tokio::test]
async fn test_store_failure_aborts_tick() {
    let store = FlakyStore::new();
    store.fail_post_of("pack");
    let pipeline = depot_pipeline(store.clone());
    let depot = Depot::default();
    let first = Parcel::new();
    let second = Parcel::new();
    pipeline.admit("new", first.clone()).await.unwrap();
    pipeline.admit("new", second.clone()).await.unwrap();

    let err = pipeline.tick(&depot).await.unwrap_err();
    assert!(err.is_infrastructure());
    // the lists never run ahead of the store
    let lists = pipeline.lists();
    assert_eq!(lists.lock().await.get("packed").len(), 0);
    assert_eq!(depot.successes.load(Ordering::SeqCst), 0);

    store.heal();
    pipeline.tick(&depot).await.unwrap();
    assert_eq!(lists.lock().await.get("packed").len(), 2);
}

#[tokio::test]
async fn test_recover_resumes_interrupted_transition_with_staged_entity() {
    let store = FlakyStore::new();
    store.fail_post_of("pack");
    let depot = Depot::default();
    let parcel = Parcel::new();
    {
        let pipeline = depot_pipeline(store.clone());
        pipeline.admit("new", parcel.clone()).await.unwrap();
        pipeline.tick(&depot).await.unwrap_err();
    }
    store.heal();

    let restarted = depot_pipeline(store.clone());
    assert_eq!(restarted.recover().await.unwrap(), 1);
    let planned = {
        let lists = restarted.lists();
        let lists = lists.lock().await;
        assert_eq!(lists.locate(&parcel.id), Some("new"));
        let label = lists.find(&parcel.id).unwrap().label.clone();
        label
    };
    assert!(planned.is_some());

    restarted.tick(&depot).await.unwrap();
    let lists = restarted.lists();
    let lists = lists.lock().await;
    assert_eq!(lists.locate(&parcel.id), Some("packed"));
    assert_eq!(lists.find(&parcel.id).unwrap().label, planned);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let depot = Depot::default();
    let kept = Parcel::new();
    let gone = Parcel::new();
    {
        let store = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
        let pipeline = depot_pipeline(store);
        pipeline.admit("new", kept.clone()).await.unwrap();
        pipeline.admit("packed", gone.clone()).await.unwrap();
        pipeline.tick(&depot).await.unwrap();
    }

    let store = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
    let restarted = depot_pipeline(store.clone());
    assert_eq!(restarted.recover().await.unwrap(), 1);
    let lists = restarted.lists();
    assert_eq!(lists.lock().await.locate(&kept.id), Some("packed"));
    assert!(!lists.lock().await.contains(&gone.id));
    assert!(store.read(gone.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_recover_ignores_other_pipelines() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let other: Pipeline<Parcel, Depot> =
        Pipeline::new("elsewhere", &LISTS, store.clone()).with_transition(Pack);
    other.admit("new", Parcel::new()).await.unwrap();

    let pipeline = depot_pipeline(store);
    assert_eq!(pipeline.recover().await.unwrap(), 0);
    assert!(pipeline.lists().lock().await.is_empty());
}

/// Packs in `processing` and seals the label in `post`.
struct Seal;

#[async_trait]
impl Transition<Parcel, Depot> for Seal {
    fn name(&self) -> &'static str {
        "seal"
    }

    fn sources(&self) -> &[ListName] {
        &["new"]
    }

    fn target(&self) -> Option<ListName> {
        Some("packed")
    }

    async fn valid(&self, _parcel: &Parcel, _depot: &Depot) -> bool {
        true
    }

    async fn processing(&self, mut parcel: Parcel, _depot: &Depot) -> Result<Parcel> {
        parcel.label = Some("packed".to_string());
        Ok(parcel)
    }

    async fn post(&self, before: &Parcel, mut after: Parcel, _depot: &Depot) -> Result<Parcel> {
        if before.broken {
            return Err(PlaneError::Validation("cannot seal a broken parcel".to_string()));
        }
        after.label = after.label.map(|label| format!("{label}+sealed"));
        Ok(after)
    }

    async fn fail(&self, _parcel: &Parcel, depot: &Depot, _error: &PlaneError) {
        depot.failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_post_hook_shapes_what_is_checkpointed_and_moved() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let pipeline: Pipeline<Parcel, Depot> =
        Pipeline::new("depot", &LISTS, store.clone()).with_transition(Seal);
    let depot = Depot::default();
    let parcel = Parcel::new();
    let mut broken = Parcel::new();
    broken.broken = true;
    pipeline.admit("new", parcel.clone()).await.unwrap();
    pipeline.admit("new", broken.clone()).await.unwrap();

    let report = pipeline.tick(&depot).await.unwrap();
    assert_eq!(report.advanced, 1);
    assert_eq!(report.failed, 1);

    let sealed = Some("packed+sealed".to_string());
    let lists = pipeline.lists();
    let lists = lists.lock().await;
    assert_eq!(lists.locate(&parcel.id), Some("packed"));
    assert_eq!(lists.find(&parcel.id).unwrap().label, sealed);
    let checkpoint = store.read(parcel.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.phase, Phase::Post);
    let saved: Parcel = serde_json::from_value(checkpoint.entity).unwrap();
    assert_eq!(saved.label, sealed);

    // a failing post hook counts as a failed transition
    assert_eq!(lists.locate(&broken.id), Some("new"));
    assert_eq!(lists.find(&broken.id).unwrap().label, None);
    assert_eq!(depot.failures.load(Ordering::SeqCst), 1);
    let checkpoint = store.read(broken.id).await.unwrap().unwrap();
    assert_eq!(checkpoint.phase, Phase::Pre);
}
