//! Per-program read cache over the external store
//!
//! Every reconciliation step looks entities up by natural key, so each
//! program keeps a cached snapshot of its remote collections. The cache is
//! the only state shared across concurrent requests for a program; its
//! per-program refresh gate is the sole required mutual-exclusion point.
//!
//! Concurrency contract:
//! - Cold load: the first caller starts the load on a spawned task and
//!   blocks on it; concurrent callers attach to the in-progress load handle
//!   and all observe the same result (single-flight). A caller cancelled
//!   mid-wait does not abandon the load.
//! - Warm read: returns the last good value immediately, even while a
//!   background refresh is in flight (possibly one generation stale).
//! - Refresh: at most one in flight per program; duplicate requests are
//!   dropped since the running refresh will observe the latest remote state
//!   anyway. Refresh bodies run on spawned tasks gated by a bounded pool.
//! - Refresh failure: the entry is invalidated and logged; readers holding
//!   the stale value are unaffected.

use crate::store::{search_all, ExternalStore, SearchFilter, StoreError, StoreResult};
use crate::types::{
    Dataset, EntityType, Germplasm, ObservationUnit, ProgramId, ProgramLocation, Study, Trial,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, warn};

/// Source of a program's cached value
#[async_trait]
pub trait CacheLoader: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    async fn load(&self, program: &ProgramId) -> StoreResult<Self::Value>;
}

type LoadResult<V> = StoreResult<Arc<V>>;

/// Cache entry: a ready value, or a cold load other callers can attach to
enum Entry<V> {
    Ready(Arc<V>),
    Loading(watch::Receiver<Option<LoadResult<V>>>),
}

struct CacheState<V> {
    entries: HashMap<ProgramId, Entry<V>>,
    /// Programs with a refresh queued or running
    refreshing: HashSet<ProgramId>,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            refreshing: HashSet::new(),
        }
    }
}

/// Role a `get` caller plays, decided under the state lock
enum Role<V> {
    Hit(Arc<V>),
    Waiter(watch::Receiver<Option<LoadResult<V>>>),
    Loader {
        tx: watch::Sender<Option<LoadResult<V>>>,
        rx: watch::Receiver<Option<LoadResult<V>>>,
    },
}

pub struct ProgramCache<L: CacheLoader> {
    loader: Arc<L>,
    state: Arc<Mutex<CacheState<L::Value>>>,
    refresh_pool: Arc<Semaphore>,
}

impl<L: CacheLoader> Clone for ProgramCache<L> {
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
            state: Arc::clone(&self.state),
            refresh_pool: Arc::clone(&self.refresh_pool),
        }
    }
}

impl<L: CacheLoader> ProgramCache<L> {
    /// Create a cache with a bounded background refresh pool
    pub fn new(loader: L, refresh_workers: usize) -> Self {
        Self {
            loader: Arc::new(loader),
            state: Arc::new(Mutex::new(CacheState::new())),
            refresh_pool: Arc::new(Semaphore::new(refresh_workers.max(1))),
        }
    }

    /// Current cached value for the program
    ///
    /// Blocks only on a cold (first) load for this program; load failure
    /// propagates to every caller blocked on that load. A warm value is
    /// returned immediately regardless of any in-flight refresh.
    ///
    /// The load body runs on a spawned task, not inside the calling future:
    /// a caller that gives up (timeout, dropped request) leaves the load
    /// running, and later callers still observe its result.
    pub async fn get(&self, program: &ProgramId) -> StoreResult<Arc<L::Value>> {
        let role = {
            let mut state = self.state.lock().await;
            match state.entries.get(program) {
                Some(Entry::Ready(value)) => Role::Hit(Arc::clone(value)),
                Some(Entry::Loading(rx)) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state
                        .entries
                        .insert(program.clone(), Entry::Loading(rx.clone()));
                    Role::Loader { tx, rx }
                }
            }
        };

        match role {
            Role::Hit(value) => Ok(value),
            Role::Waiter(rx) => Self::await_load(rx).await,
            Role::Loader { tx, rx } => {
                debug!(program = %program, "Cold cache load");
                self.spawn_load(program.clone(), tx);
                Self::await_load(rx).await
            }
        }
    }

    fn spawn_load(&self, program: ProgramId, tx: watch::Sender<Option<LoadResult<L::Value>>>) {
        let loader = Arc::clone(&self.loader);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let result = loader.load(&program).await.map(Arc::new);
            {
                let mut state = state.lock().await;
                match &result {
                    Ok(value) => {
                        state
                            .entries
                            .insert(program.clone(), Entry::Ready(Arc::clone(value)));
                    }
                    Err(error) => {
                        warn!(program = %program, error = %error, "Cold cache load failed");
                        // Clear the Loading entry so the next access performs
                        // a real load; never stomp a Ready value that landed
                        // in the meantime
                        if matches!(state.entries.get(&program), Some(Entry::Loading(_))) {
                            state.entries.remove(&program);
                        }
                    }
                }
            }
            // Everyone blocked on this load observes the same result
            let _ = tx.send(Some(result));
        });
    }

    async fn await_load(
        mut rx: watch::Receiver<Option<LoadResult<L::Value>>>,
    ) -> StoreResult<Arc<L::Value>> {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(StoreError::Request(
                    "cache load ended without a result".to_string(),
                ));
            }
        }
    }

    /// Eager warm-up at process start
    ///
    /// Loads all programs concurrently. Individual failures are logged, not
    /// propagated; the failed program cold-loads on first access instead.
    pub async fn populate(&self, programs: &[ProgramId]) {
        let loads = programs.iter().map(|program| async move {
            if let Err(error) = self.get(program).await {
                warn!(program = %program, error = %error, "Cache warm-up failed");
            }
        });
        futures::future::join_all(loads).await;
    }

    /// Run a remote mutation, then schedule (not await) a refresh
    ///
    /// The mutation result is returned immediately. There is no ordering
    /// guarantee that the scheduled refresh observes the just-posted
    /// mutation: a refresh already in flight may snapshot earlier remote
    /// state. Bounded staleness, not linearizable.
    pub async fn post<T, F, Fut>(&self, program: &ProgramId, mutation: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let result = mutation().await?;
        self.schedule_refresh(program);
        Ok(result)
    }

    /// Drop the cached entry; the next `get` performs a real load
    pub async fn invalidate(&self, program: &ProgramId) {
        let mut state = self.state.lock().await;
        if matches!(state.entries.get(program), Some(Entry::Ready(_))) {
            state.entries.remove(program);
        }
    }

    /// Queue a background refresh for the program
    ///
    /// Single-flight: if a refresh is already queued or running for this
    /// program the request is dropped. Readers keep the stale value until
    /// the refresh lands.
    pub fn schedule_refresh(&self, program: &ProgramId) {
        let program = program.clone();
        let loader = Arc::clone(&self.loader);
        let state = Arc::clone(&self.state);
        let pool = Arc::clone(&self.refresh_pool);

        tokio::spawn(async move {
            {
                let mut state = state.lock().await;
                if !state.refreshing.insert(program.clone()) {
                    debug!(program = %program, "Refresh already in flight, dropping request");
                    return;
                }
            }

            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };

            debug!(program = %program, "Background cache refresh");
            let result = loader.load(&program).await;

            let mut state = state.lock().await;
            state.refreshing.remove(&program);
            match result {
                Ok(value) => {
                    state
                        .entries
                        .insert(program.clone(), Entry::Ready(Arc::new(value)));
                    debug!(program = %program, "Cache refresh complete");
                }
                Err(error) => {
                    // Invalidate so the next access performs a real load, but
                    // never stomp a cold load that started in the meantime.
                    warn!(program = %program, error = %error, "Cache refresh failed, invalidating entry");
                    if matches!(state.entries.get(&program), Some(Entry::Ready(_))) {
                        state.entries.remove(&program);
                    }
                }
            }
        });
    }

    /// Number of programs currently holding a ready value (diagnostics)
    pub async fn ready_count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| matches!(e, Entry::Ready(_)))
            .count()
    }
}

// ============================================================================
// Program Snapshot Loader
// ============================================================================

/// Cached view of one program's remote collections, keyed by natural key
///
/// Observations are not bulk-cached; the observation processor fetches the
/// slots referenced by a batch directly.
#[derive(Debug, Clone, Default)]
pub struct ProgramData {
    pub germplasm: HashMap<String, Germplasm>,
    pub locations: HashMap<String, ProgramLocation>,
    pub trials: HashMap<String, Trial>,
    pub studies: HashMap<String, Study>,
    pub observation_units: HashMap<String, ObservationUnit>,
    pub datasets: HashMap<String, Dataset>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Loads a [`ProgramData`] snapshot through the store boundary
pub struct StoreLoader {
    store: Arc<dyn ExternalStore>,
}

impl StoreLoader {
    pub fn new(store: Arc<dyn ExternalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CacheLoader for StoreLoader {
    type Value = ProgramData;

    async fn load(&self, program: &ProgramId) -> StoreResult<ProgramData> {
        let everything = SearchFilter::default();
        let mut data = ProgramData::default();

        for record in search_all(&*self.store, program, EntityType::Germplasm, &everything).await? {
            if let Some(g) = record.into_germplasm() {
                data.germplasm.insert(g.natural_key(), g);
            }
        }
        for record in search_all(&*self.store, program, EntityType::Location, &everything).await? {
            if let Some(l) = record.into_location() {
                data.locations.insert(l.natural_key(), l);
            }
        }
        for record in search_all(&*self.store, program, EntityType::Trial, &everything).await? {
            if let Some(t) = record.into_trial() {
                data.trials.insert(t.natural_key(), t);
            }
        }
        for record in search_all(&*self.store, program, EntityType::Study, &everything).await? {
            if let Some(s) = record.into_study() {
                data.studies.insert(s.natural_key(), s);
            }
        }
        for record in
            search_all(&*self.store, program, EntityType::ObservationUnit, &everything).await?
        {
            if let Some(u) = record.into_observation_unit() {
                data.observation_units.insert(u.natural_key(), u);
            }
        }
        for record in search_all(&*self.store, program, EntityType::Dataset, &everything).await? {
            if let Some(d) = record.into_dataset() {
                data.datasets.insert(d.natural_key(), d);
            }
        }

        data.fetched_at = Some(Utc::now());
        debug!(
            program = %program,
            germplasm = data.germplasm.len(),
            studies = data.studies.len(),
            units = data.observation_units.len(),
            "Program snapshot loaded"
        );
        Ok(data)
    }
}

/// The cache instantiation used by the upload orchestrator
pub type BrapiCache = ProgramCache<StoreLoader>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingLoader {
        fn new() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CacheLoader for Arc<CountingLoader> {
        type Value = usize;

        async fn load(&self, _program: &ProgramId) -> StoreResult<usize> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Request("load failed".to_string()));
            }
            Ok(n)
        }
    }

    #[tokio::test]
    async fn warm_hit_does_not_reload() {
        let loader = Arc::new(CountingLoader::new());
        let cache = ProgramCache::new(Arc::clone(&loader), 2);
        let program = ProgramId::new("p1");

        let first = cache.get(&program).await.unwrap();
        let second = cache.get(&program).await.unwrap();
        assert_eq!(*first, *second);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cold_load_failure_propagates_and_clears_entry() {
        let loader = Arc::new(CountingLoader::new());
        loader.fail.store(true, Ordering::SeqCst);
        let cache = ProgramCache::new(Arc::clone(&loader), 2);
        let program = ProgramId::new("p1");

        assert!(cache.get(&program).await.is_err());
        assert_eq!(cache.ready_count().await, 0);

        // Recovery: next access performs a real load
        loader.fail.store(false, Ordering::SeqCst);
        assert!(cache.get(&program).await.is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let loader = Arc::new(CountingLoader::new());
        let cache = ProgramCache::new(Arc::clone(&loader), 2);
        let program = ProgramId::new("p1");

        let first = cache.get(&program).await.unwrap();
        cache.invalidate(&program).await;
        let second = cache.get(&program).await.unwrap();
        assert_ne!(*first, *second);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn post_returns_mutation_result() {
        let loader = Arc::new(CountingLoader::new());
        let cache = ProgramCache::new(Arc::clone(&loader), 2);
        let program = ProgramId::new("p1");

        let out = cache
            .post(&program, || async { Ok::<_, StoreError>(42) })
            .await
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn post_propagates_mutation_failure() {
        let loader = Arc::new(CountingLoader::new());
        let cache = ProgramCache::new(Arc::clone(&loader), 2);
        let program = ProgramId::new("p1");

        let out: StoreResult<usize> = cache
            .post(&program, || async {
                Err(StoreError::Request("boom".to_string()))
            })
            .await;
        assert!(out.is_err());
    }
}
