//! Program cache concurrency tests

mod helpers;

use async_trait::async_trait;
use helpers::{program, InMemoryStore};
use phenosync_import::cache::{CacheLoader, ProgramCache, StoreLoader};
use phenosync_import::store::{EntityRecord, ExternalStore, StoreError, StoreResult};
use phenosync_import::types::{EntityType, Germplasm, ProgramId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

/// Counts loads; each load takes long enough for callers to pile up, and can
/// be made to fail or to block on a gate
struct TestLoader {
    loads: AtomicUsize,
    fail: AtomicBool,
    gated: AtomicBool,
    gate: Notify,
}

impl TestLoader {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Notify::new(),
        })
    }

    fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// Local handle so the shared loader can implement the crate's loader trait
#[derive(Clone)]
struct SharedLoader(Arc<TestLoader>);

#[async_trait]
impl CacheLoader for SharedLoader {
    type Value = usize;

    async fn load(&self, _program: &ProgramId) -> StoreResult<usize> {
        let inner = &self.0;
        let n = inner.loads.fetch_add(1, Ordering::SeqCst) + 1;
        if inner.gated.load(Ordering::SeqCst) {
            inner.gate.notified().await;
        } else {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        if inner.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Request("load failed".to_string()));
        }
        Ok(n)
    }
}

#[tokio::test]
async fn concurrent_cold_gets_share_one_load() {
    let loader = TestLoader::new();
    let cache = ProgramCache::new(SharedLoader(Arc::clone(&loader)), 2);
    let p = program();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let p = p.clone();
        tasks.push(tokio::spawn(async move { cache.get(&p).await }));
    }
    let mut values = Vec::new();
    for task in tasks {
        values.push(*task.await.unwrap().unwrap());
    }

    assert_eq!(loader.load_count(), 1);
    assert!(values.iter().all(|v| *v == values[0]));
}

#[tokio::test]
async fn cold_load_failure_reaches_every_waiter() {
    let loader = TestLoader::new();
    loader.fail.store(true, Ordering::SeqCst);
    let cache = ProgramCache::new(SharedLoader(Arc::clone(&loader)), 2);
    let p = program();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let p = p.clone();
        tasks.push(tokio::spawn(async move { cache.get(&p).await }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }
    assert_eq!(loader.load_count(), 1);
    assert_eq!(cache.ready_count().await, 0);
}

#[tokio::test]
async fn cancelled_cold_get_does_not_abandon_the_load() {
    let loader = TestLoader::new();
    loader.gated.store(true, Ordering::SeqCst);
    let cache = ProgramCache::new(SharedLoader(Arc::clone(&loader)), 2);
    let p = program();

    // The first caller gives up while the load is parked on the gate
    let first = timeout(Duration::from_millis(20), cache.get(&p)).await;
    assert!(first.is_err());

    // The load is still running; release it and read normally
    loader.gated.store(false, Ordering::SeqCst);
    loader.gate.notify_waiters();
    let value = timeout(Duration::from_millis(500), cache.get(&p))
        .await
        .expect("get must not hang after a cancelled caller")
        .unwrap();
    assert_eq!(*value, 1);
    assert_eq!(loader.load_count(), 1);
}

#[tokio::test]
async fn duplicate_refresh_requests_collapse() {
    let loader = TestLoader::new();
    let cache = ProgramCache::new(SharedLoader(Arc::clone(&loader)), 2);
    let p = program();

    cache.get(&p).await.unwrap();
    assert_eq!(loader.load_count(), 1);

    cache.schedule_refresh(&p);
    cache.schedule_refresh(&p);
    cache.schedule_refresh(&p);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // One refresh ran; the duplicates were dropped
    assert_eq!(loader.load_count(), 2);
    assert_eq!(cache.ready_count().await, 1);
}

#[tokio::test]
async fn warm_read_is_immediate_while_refresh_is_in_flight() {
    let loader = TestLoader::new();
    let cache = ProgramCache::new(SharedLoader(Arc::clone(&loader)), 2);
    let p = program();

    let warm = cache.get(&p).await.unwrap();

    loader.gated.store(true, Ordering::SeqCst);
    cache.schedule_refresh(&p);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The refresh is parked on the gate; a read must not wait for it
    let read = timeout(Duration::from_millis(10), cache.get(&p)).await;
    assert_eq!(*read.unwrap().unwrap(), *warm);

    // Release the refresh and observe the new generation
    loader.gated.store(false, Ordering::SeqCst);
    loader.gate.notify_waiters();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(*cache.get(&p).await.unwrap() > *warm);
}

#[tokio::test]
async fn failed_refresh_invalidates_without_touching_held_values() {
    let loader = TestLoader::new();
    let cache = ProgramCache::new(SharedLoader(Arc::clone(&loader)), 2);
    let p = program();

    let held = cache.get(&p).await.unwrap();
    loader.fail.store(true, Ordering::SeqCst);
    cache.schedule_refresh(&p);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The entry is gone, the value already handed out is untouched
    assert_eq!(cache.ready_count().await, 0);
    assert_eq!(*held, 1);

    // Recovery is a plain cold load
    loader.fail.store(false, Ordering::SeqCst);
    assert!(cache.get(&p).await.is_ok());
    assert_eq!(cache.ready_count().await, 1);
}

#[tokio::test]
async fn store_loader_snapshots_program_collections() {
    let store = Arc::new(InMemoryStore::new());
    store
        .create(
            &program(),
            EntityType::Germplasm,
            vec![EntityRecord::Germplasm(Germplasm {
                name: "G1".to_string(),
                accession_number: None,
                female_parent: None,
                male_parent: None,
                breeding_method: None,
                db_id: None,
            })],
        )
        .await
        .unwrap();

    let cache = ProgramCache::new(StoreLoader::new(store), 2);
    let snapshot = cache.get(&program()).await.unwrap();

    assert_eq!(snapshot.germplasm.len(), 1);
    assert!(snapshot.germplasm.contains_key("G1"));
    assert!(snapshot.fetched_at.is_some());
}
