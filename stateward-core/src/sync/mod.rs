/*!
Collection sync manager.

Keeps a local cache of remote collections:

1. **Cache lookup**: a stored entry is used while it is younger than the
   cache duration and decodes cleanly.
2. **Fetch**: otherwise the whole collection is fetched (with retries),
   its timestamps normalized, and the result written back, compressed when
   it holds more than `collection_compress_min_items` documents.
3. **Live reconciliation**: while online, one subscription per collection
   replaces the in-memory copy and re-persists it uncompressed. A live
   update that lands while a sync is running wins over that sync's result
   for the same collection.

Callers always see uncompressed documents.
*/

pub mod normalize;
pub mod remote;

use crate::config::EngineConfig;
use crate::delegate::CompressionDelegate;
use crate::record::{RecordKind, StorageRecord};
use crate::tiers::RecordStore;
use crate::{Result, StatewardError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use stateward_retry::{classify, with_backoff, RetryError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use normalize::{normalize_documents, timestamp_to_iso};
pub use remote::{Document, InMemoryBackend, RemoteBackend, Subscription, Update};

/// Sync state as observed by the application
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    /// Percentage of collections processed in the current run
    pub progress: f32,
    /// Completion time of the last fully successful run
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Where a collection's data came from in a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionSource {
    Cache,
    Remote,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    /// Collections that were synced, and from where
    pub synced: Vec<(String, CollectionSource)>,
    /// Collections that failed; their previous in-memory data is kept
    pub errors: Vec<(String, StatewardError)>,
    pub total_records: usize,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn source(&self, collection: &str) -> Option<CollectionSource> {
        self.synced
            .iter()
            .find(|(name, _)| name == collection)
            .map(|(_, source)| *source)
    }
}

#[derive(Debug)]
pub enum SyncOutcome {
    /// Another sync was already running
    Skipped,
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped => None,
        }
    }
}

/// In-memory copy of one collection
///
/// `generation` counts live updates and clears. A sync result computed
/// against an older generation is stale and must not replace the entry.
#[derive(Default)]
struct CollectionEntry {
    documents: Option<Arc<Vec<Document>>>,
    generation: u64,
}

type CollectionMap = RwLock<HashMap<String, CollectionEntry>>;

struct SyncFlag<'a>(&'a AtomicBool);

impl Drop for SyncFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CollectionSyncManager {
    config: Arc<EngineConfig>,
    backend: Arc<dyn RemoteBackend>,
    store: Arc<dyn RecordStore>,
    delegate: Arc<CompressionDelegate>,
    data: Arc<CollectionMap>,
    syncing: AtomicBool,
    status: watch::Sender<SyncStatus>,
    live: Mutex<Vec<JoinHandle<()>>>,
}

impl CollectionSyncManager {
    pub fn new(
        config: Arc<EngineConfig>,
        backend: Arc<dyn RemoteBackend>,
        store: Arc<dyn RecordStore>,
        delegate: Arc<CompressionDelegate>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            config,
            backend,
            store,
            delegate,
            data: Arc::new(RwLock::new(HashMap::new())),
            syncing: AtomicBool::new(false),
            status,
            live: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// In-memory documents of a collection (empty when unknown)
    pub fn collection(&self, name: &str) -> Arc<Vec<Document>> {
        self.data
            .read()
            .ok()
            .and_then(|data| data.get(name).and_then(|e| e.documents.clone()))
            .unwrap_or_default()
    }

    /// Names of the collections currently held in memory
    pub fn loaded_collections(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .data
            .read()
            .map(|data| {
                data.iter()
                    .filter(|(_, e)| e.documents.is_some())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Time since the last fully successful sync
    pub fn cache_age(&self) -> Option<Duration> {
        let last = self.status.borrow().last_sync?;
        (Utc::now() - last).to_std().ok()
    }

    /// Whether the last successful sync is still inside the cache duration
    pub fn is_cache_valid(&self) -> bool {
        self.cache_age()
            .is_some_and(|age| age < self.config.cache_duration)
    }

    fn generation(&self, name: &str) -> u64 {
        self.data
            .read()
            .ok()
            .and_then(|data| data.get(name).map(|e| e.generation))
            .unwrap_or(0)
    }

    /// Replace a collection unless it changed since `seen` was read
    fn replace_if_current(&self, name: &str, documents: Vec<Document>, seen: u64) -> bool {
        match self.data.write() {
            Ok(mut data) => {
                let entry = data.entry(name.to_string()).or_default();
                if entry.generation != seen {
                    debug!(collection = %name, "Collection changed during sync, keeping newer copy");
                    return false;
                }
                entry.documents = Some(Arc::new(documents));
                true
            }
            Err(_) => {
                warn!(collection = %name, "Collection map poisoned, sync result dropped");
                false
            }
        }
    }

    /// Sync every tracked collection concurrently
    ///
    /// With `force` the cache is bypassed. A call made while another sync
    /// is running returns [`SyncOutcome::Skipped`].
    pub async fn sync_all(&self, force: bool) -> SyncOutcome {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync already in progress");
            return SyncOutcome::Skipped;
        }
        let _flag = SyncFlag(&self.syncing);

        self.status.send_modify(|s| {
            s.syncing = true;
            s.progress = 0.0;
            s.last_error = None;
        });
        info!(force, "Starting collection sync");

        let names = self.config.tracked_collections.clone();
        let total = names.len().max(1);
        let done = AtomicUsize::new(0);

        let results = join_all(names.iter().map(|name| {
            let done = &done;
            async move {
                let seen = self.generation(name);
                let result = self.sync_one(name, force, seen).await.map(|(source, documents)| {
                    let count = documents.len();
                    self.replace_if_current(name, documents, seen);
                    (source, count)
                });
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.status
                    .send_modify(|s| s.progress = finished as f32 * 100.0 / total as f32);
                (name.clone(), result)
            }
        }))
        .await;

        let mut report = SyncReport::default();
        for (name, result) in results {
            match result {
                Ok((source, count)) => {
                    report.total_records += count;
                    report.synced.push((name, source));
                }
                Err(e) => {
                    warn!(collection = %name, error = %e, "Collection sync failed");
                    report.errors.push((name, e));
                }
            }
        }

        let last_error = report
            .errors
            .first()
            .map(|(_, e)| e.to_string());
        let success = report.is_success();
        self.status.send_modify(|s| {
            s.syncing = false;
            s.progress = 100.0;
            if success {
                s.last_sync = Some(Utc::now());
            }
            s.last_error = last_error;
        });
        info!(
            total_records = report.total_records,
            failed = report.errors.len(),
            "Collection sync finished"
        );

        SyncOutcome::Completed(report)
    }

    async fn sync_one(
        &self,
        name: &str,
        force: bool,
        seen: u64,
    ) -> Result<(CollectionSource, Vec<Document>)> {
        if !force {
            if let Some(documents) = self.load_valid(name).await {
                debug!(collection = %name, count = documents.len(), "Using cached collection");
                return Ok((CollectionSource::Cache, documents));
            }
        }

        let mut documents = self.fetch(name).await?;
        normalize_documents(&mut documents, &self.config.timestamp_fields);
        debug!(collection = %name, count = documents.len(), "Fetched collection");

        let record = self.encode(name, &documents).await?;
        if self.generation(name) != seen {
            debug!(collection = %name, "Live update arrived during fetch, not caching fetched copy");
        } else if let Err(e) = persist(Arc::clone(&self.store), record).await {
            warn!(collection = %name, error = %e, "Failed to cache collection, keeping it in memory");
        }

        Ok((CollectionSource::Remote, documents))
    }

    async fn fetch(&self, name: &str) -> Result<Vec<Document>> {
        let backend = Arc::clone(&self.backend);
        let collection = name.to_string();

        with_backoff("fetch_collection", move |_attempt| {
            let backend = Arc::clone(&backend);
            let collection = collection.clone();
            Box::pin(async move {
                backend
                    .fetch(&collection)
                    .await
                    .map_err(|e| classify("fetch_collection", e))
            })
        })
        .await
        .map_err(|e| retry_error_into(name, e))
    }

    /// Build the cache record, compressing large collections when possible
    async fn encode(&self, name: &str, documents: &[Document]) -> Result<StorageRecord> {
        let plain = serde_json::to_string(documents)?;
        let kind = RecordKind::Collection(name.to_string());
        let count = documents.len();

        if count <= self.config.collection_compress_min_items {
            return Ok(StorageRecord::plain(name, kind, plain, count));
        }

        match self
            .delegate
            .compress(plain.clone(), name, self.config.collection_compress_timeout)
            .await
        {
            Ok(encoded) => Ok(StorageRecord::new(name, kind, &plain, encoded, true, count)),
            Err(e) => {
                warn!(collection = %name, error = %e, "Compression failed, caching uncompressed");
                #[cfg(feature = "metrics")]
                crate::observability::with_metrics(|m| m.compression_fallbacks_total.inc());
                Ok(StorageRecord::plain(name, kind, plain, count))
            }
        }
    }

    /// A fresh, decodable cache entry; anything else is a miss
    async fn load_valid(&self, name: &str) -> Option<Vec<Document>> {
        let store = Arc::clone(&self.store);
        let id = name.to_string();
        let read = tokio::task::spawn_blocking(move || store.get(&id)).await;

        let record = match read {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                miss();
                return None;
            }
            Ok(Err(e)) => {
                warn!(collection = %name, error = %e, "Cache read failed");
                miss();
                return None;
            }
            Err(e) => {
                warn!(collection = %name, error = %e, "Cache reader failed");
                miss();
                return None;
            }
        };

        let now = Utc::now().timestamp_millis();
        if !record.is_fresh(now, self.config.cache_duration) {
            debug!(collection = %name, age = ?record.age(now), "Cache expired");
            miss();
            return None;
        }

        match self.decode(record).await {
            Ok(documents) => {
                #[cfg(feature = "metrics")]
                crate::observability::with_metrics(|m| m.cache_hits_total.inc());
                Some(documents)
            }
            Err(e) => {
                warn!(collection = %name, error = %e, "Malformed cache entry, treating as miss");
                miss();
                None
            }
        }
    }

    async fn decode(&self, record: StorageRecord) -> Result<Vec<Document>> {
        let plain = if record.compressed {
            self.delegate
                .decompress(record.data.clone(), self.config.collection_compress_timeout)
                .await?
        } else {
            record.data.clone()
        };
        record.verify(&plain)?;
        Ok(serde_json::from_str(&plain)?)
    }

    /// Load every valid cache entry into memory; returns how many were found
    pub async fn load_cached(&self) -> usize {
        let mut loaded = 0;
        for name in &self.config.tracked_collections {
            let seen = self.generation(name);
            if let Some(documents) = self.load_valid(name).await {
                debug!(collection = %name, count = documents.len(), "Loaded collection from cache");
                if self.replace_if_current(name, documents, seen) {
                    loaded += 1;
                }
            }
        }
        if loaded > 0 {
            info!(loaded, "Collections loaded from cache");
        }
        loaded
    }

    /// Attach one live subscription per tracked collection
    ///
    /// Existing subscriptions are dropped first. A collection whose
    /// subscription cannot be attached is logged and skipped. Returns the
    /// number of subscriptions attached.
    pub async fn attach_live(&self) -> usize {
        self.detach_live();

        let mut handles = Vec::new();
        for name in &self.config.tracked_collections {
            match self.backend.subscribe(name).await {
                Ok(subscription) => handles.push(tokio::spawn(reconcile(
                    name.clone(),
                    subscription,
                    Arc::clone(&self.data),
                    Arc::clone(&self.store),
                    self.config.timestamp_fields.clone(),
                ))),
                Err(e) => warn!(collection = %name, error = %e, "Failed to attach live listener"),
            }
        }

        let attached = handles.len();
        match self.live.lock() {
            Ok(mut live) => live.extend(handles),
            Err(_) => {
                warn!("Listener list poisoned, detaching new listeners");
                handles.iter().for_each(JoinHandle::abort);
                return 0;
            }
        }
        debug!(attached, "Live listeners attached");
        attached
    }

    /// Drop every live subscription
    pub fn detach_live(&self) {
        if let Ok(mut live) = self.live.lock() {
            for handle in live.drain(..) {
                handle.abort();
            }
        }
    }

    /// Number of live listeners still running
    pub fn live_listeners(&self) -> usize {
        self.live
            .lock()
            .map(|live| live.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// React to a connectivity change
    ///
    /// Going online forces a full re-fetch and re-attaches the listeners;
    /// going offline detaches them and keeps serving what is cached.
    pub async fn set_online(&self, online: bool) -> Option<SyncOutcome> {
        self.status.send_modify(|s| s.online = online);
        if online {
            info!("Connectivity restored");
            let outcome = self.sync_all(true).await;
            self.attach_live().await;
            Some(outcome)
        } else {
            info!("Connectivity lost, serving cached collections");
            self.detach_live();
            None
        }
    }

    /// Wipe the on-disk cache and the in-memory collections
    pub async fn clear_cache(&self) -> Result<()> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.clear())
            .await
            .map_err(|e| StatewardError::storage(format!("cache clear failed: {e}")))??;

        if let Ok(mut data) = self.data.write() {
            for entry in data.values_mut() {
                entry.documents = None;
                entry.generation += 1;
            }
        }
        self.status.send_modify(|s| s.last_sync = None);
        info!("Collection cache cleared");
        Ok(())
    }
}

impl Drop for CollectionSyncManager {
    fn drop(&mut self) {
        self.detach_live();
    }
}

fn miss() {
    #[cfg(feature = "metrics")]
    crate::observability::with_metrics(|m| m.cache_misses_total.inc());
}

/// Store a live update, superseding any sync result still in flight
fn store_live(data: &CollectionMap, name: &str, documents: Vec<Document>) {
    match data.write() {
        Ok(mut data) => {
            let entry = data.entry(name.to_string()).or_default();
            entry.documents = Some(Arc::new(documents));
            entry.generation += 1;
        }
        Err(_) => warn!(collection = %name, "Collection map poisoned, update dropped"),
    }
}

async fn persist(store: Arc<dyn RecordStore>, record: StorageRecord) -> Result<()> {
    tokio::task::spawn_blocking(move || store.put(&record))
        .await
        .map_err(|e| StatewardError::storage(format!("cache writer failed: {e}")))?
}

fn retry_error_into(collection: &str, error: RetryError) -> StatewardError {
    match error.into_source().downcast::<StatewardError>() {
        Ok(error) => *error,
        Err(other) => StatewardError::remote_permanent(collection, other.to_string()),
    }
}

/// Apply live updates for one collection until the stream ends or errors
async fn reconcile(
    name: String,
    mut subscription: Subscription,
    data: Arc<CollectionMap>,
    store: Arc<dyn RecordStore>,
    timestamp_fields: Vec<String>,
) {
    while let Some(update) = subscription.next().await {
        let mut documents = match update {
            Ok(documents) => documents,
            Err(e) => {
                warn!(collection = %name, error = %e, "Live listener failed");
                break;
            }
        };
        normalize_documents(&mut documents, &timestamp_fields);

        let record = match serde_json::to_string(&documents) {
            Ok(plain) => StorageRecord::plain(
                name.as_str(),
                RecordKind::Collection(name.clone()),
                plain,
                documents.len(),
            ),
            Err(e) => {
                warn!(collection = %name, error = %e, "Failed to serialize live update");
                continue;
            }
        };
        debug!(collection = %name, count = documents.len(), "Live update received");
        store_live(&data, &name, documents);

        let store = Arc::clone(&store);
        let collection = name.clone();
        tokio::spawn(async move {
            if let Err(e) = persist(store, record).await {
                warn!(collection = %collection, error = %e, "Failed to re-persist live update");
            }
        });
    }
    debug!(collection = %name, "Live listener ended");
}
