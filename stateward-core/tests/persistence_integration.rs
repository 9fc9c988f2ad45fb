/*!
End-to-end tests for saving and restoring application state through the
public API, on real on-disk tiers.
*/

use serde_json::{json, Value};
use stateward_core::compression::{decompress_text, CompressionAdapter};
use stateward_core::tiers::STATE_TABLE;
use stateward_core::{
    CompressionDelegate, EngineConfig, FileFlatStore, FlatStore, GzipCompressor,
    InMemoryBackend, MemoryRecordStore, RecordStore, SaveOutcome, SaveTrigger, Section, SessionFlatStore, SkipReason,
    SqliteRecordStore, StateRegistry, StateService, StatewardError, StorageRecord, Tier,
    TierManager, APP_STATE_ID,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Value shared between the test and a registered provider
#[derive(Clone, Default)]
struct Field(Arc<Mutex<Option<Value>>>);

impl Field {
    fn with(value: Value) -> Self {
        Self(Arc::new(Mutex::new(Some(value))))
    }

    fn get(&self) -> Option<Value> {
        self.0.lock().unwrap().clone()
    }

    fn set(&self, value: Value) {
        *self.0.lock().unwrap() = Some(value);
    }

    fn register(&self, registry: &StateRegistry, section: Section, key: &str) {
        let read = self.clone();
        let write = self.clone();
        registry.register_fn(
            section,
            key,
            move || read.get(),
            move |value| {
                write.set(value.clone());
                true
            },
        );
    }
}

struct App {
    registry: Arc<StateRegistry>,
    tab: Field,
    user: Field,
    notes: Field,
}

impl App {
    fn new(tab: Option<Value>, user: Option<Value>, notes: Option<Value>) -> Self {
        let registry = Arc::new(StateRegistry::new());
        let tab = tab.map(Field::with).unwrap_or_default();
        let user = user.map(Field::with).unwrap_or_default();
        let notes = notes.map(Field::with).unwrap_or_default();
        tab.register(&registry, Section::ActiveTab, "main");
        user.register(&registry, Section::UserId, "session");
        notes.register(&registry, Section::Form, "notes");
        Self {
            registry,
            tab,
            user,
            notes,
        }
    }

    fn blank() -> Self {
        Self::new(None, None, None)
    }
}

/// Record store counting writes and optionally refusing every call
#[derive(Default)]
struct CountingStore {
    inner: MemoryRecordStore,
    puts: AtomicUsize,
    offline: bool,
}

impl CountingStore {
    fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    fn check(&self) -> stateward_core::Result<()> {
        if self.offline {
            Err(StatewardError::tier_unavailable("primary", "storage blocked"))
        } else {
            Ok(())
        }
    }
}

impl RecordStore for CountingStore {
    fn put(&self, record: &StorageRecord) -> stateward_core::Result<()> {
        self.check()?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(record)
    }

    fn get(&self, id: &str) -> stateward_core::Result<Option<StorageRecord>> {
        self.check()?;
        self.inner.get(id)
    }

    fn delete(&self, id: &str) -> stateward_core::Result<()> {
        self.check()?;
        self.inner.delete(id)
    }

    fn list(&self) -> stateward_core::Result<Vec<StorageRecord>> {
        self.check()?;
        self.inner.list()
    }

    fn clear(&self) -> stateward_core::Result<()> {
        self.check()?;
        self.inner.clear()
    }
}

struct StallingCompressor(Duration);

impl CompressionAdapter for StallingCompressor {
    fn compress(&self, data: &[u8]) -> stateward_core::Result<Vec<u8>> {
        std::thread::sleep(self.0);
        GzipCompressor::new().compress(data)
    }

    fn decompress(&self, data: &[u8]) -> stateward_core::Result<Vec<u8>> {
        GzipCompressor::new().decompress(data)
    }

    fn algorithm_name(&self) -> &str {
        "stalling"
    }
}

fn saved(outcome: Option<SaveOutcome>) -> stateward_core::SaveReport {
    match outcome {
        Some(SaveOutcome::Saved(report)) => report,
        other => panic!("expected a save, got {other:?}"),
    }
}

#[tokio::test]
async fn test_round_trip_uncompressed() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default().with_data_dir(dir.path());

    let app = App::new(Some(json!("pontos")), Some(json!("u-42")), Some(json!({"nome": "Ana"})));
    let service = StateService::from_config(config.clone(), app.registry.clone()).unwrap();
    service.start().await;
    let report = saved(service.stop().await);
    assert!(!report.compressed);
    drop(service);

    let restored_app = App::blank();
    let service = StateService::from_config(config, restored_app.registry.clone()).unwrap();
    let restored = service.start().await.unwrap();
    service.stop().await;

    assert_eq!(restored.source, Tier::Primary);
    assert_eq!(restored_app.tab.get(), Some(json!("pontos")));
    assert_eq!(restored_app.user.get(), Some(json!("u-42")));
    assert_eq!(restored_app.notes.get(), Some(json!({"nome": "Ana"})));
}

#[tokio::test]
async fn test_round_trip_compressed_2000_byte_form() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default().with_data_dir(dir.path());
    let notes = json!({"obs": "a".repeat(2000)});

    let app = App::new(Some(json!("estoque")), None, Some(notes.clone()));
    let service = StateService::from_config(config.clone(), app.registry.clone()).unwrap();
    let report = saved(service.notify(SaveTrigger::Hidden).await);
    assert!(report.compressed);
    service.stop().await;
    drop(service);

    // The stored record is compressed and decodes to the same snapshot.
    let db = SqliteRecordStore::open(config.primary_db_path().unwrap(), STATE_TABLE).unwrap();
    let record = db.get(APP_STATE_ID).unwrap().unwrap();
    assert!(record.compressed);
    let plain = decompress_text(&GzipCompressor::new(), &record.data).unwrap();
    record.verify(&plain).unwrap();

    let restored_app = App::blank();
    let service = StateService::from_config(config, restored_app.registry.clone()).unwrap();
    service.start().await.unwrap();
    service.stop().await;
    assert_eq!(restored_app.notes.get(), Some(notes));
}

#[tokio::test]
async fn test_recapture_without_changes_writes_nothing() {
    let primary = Arc::new(CountingStore::default());
    let tiers = TierManager::new(
        primary.clone(),
        Arc::new(SessionFlatStore::new()),
        Arc::new(SessionFlatStore::new()),
    );
    let app = App::new(Some(json!("tarefas")), Some(json!("u-1")), None);
    let service = StateService::new(
        EngineConfig::default(),
        app.registry.clone(),
        tiers,
        Arc::new(CompressionDelegate::with_gzip()),
    )
    .unwrap();

    saved(service.notify(SaveTrigger::Interval).await);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = service.notify(SaveTrigger::Interval).await.unwrap();

    assert_eq!(second.skip_reason(), Some(SkipReason::NoChanges));
    assert_eq!(primary.puts.load(Ordering::SeqCst), 1);

    app.tab.set(json!("pontos"));
    saved(service.notify(SaveTrigger::Blur).await);
    assert_eq!(primary.puts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restore_falls_back_when_primary_unavailable() {
    let dir = TempDir::new().unwrap();
    let secondary_path = dir.path().join("critical.json");

    let app = App::new(Some(json!("avaliacoes")), Some(json!("u-9")), Some(json!({"a": 1})));
    let tiers = TierManager::new(
        Arc::new(CountingStore::offline()),
        Arc::new(FileFlatStore::new(&secondary_path)),
        Arc::new(SessionFlatStore::new()),
    );
    let service = StateService::new(
        EngineConfig::default(),
        app.registry.clone(),
        tiers.clone(),
        Arc::new(CompressionDelegate::with_gzip()),
    )
    .unwrap();

    let report = saved(service.notify(SaveTrigger::Unload).await);
    assert!(report.failed(Tier::Primary));
    assert!(!report.failed(Tier::Secondary));

    let restored_app = App::blank();
    let service = StateService::new(
        EngineConfig::default(),
        restored_app.registry.clone(),
        tiers,
        Arc::new(CompressionDelegate::with_gzip()),
    )
    .unwrap();
    let restored = service.start().await.unwrap();
    service.stop().await;

    assert_eq!(restored.source, Tier::Secondary);
    assert_eq!(restored_app.user.get(), Some(json!("u-9")));
    assert_eq!(restored_app.tab.get(), Some(json!("avaliacoes")));
}

#[tokio::test]
async fn test_unopenable_database_restores_from_secondary_file() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default()
        .with_data_dir(dir.path())
        .with_collections(["pontos"]);
    std::fs::create_dir_all(config.primary_db_path().unwrap()).unwrap();
    let critical = json!({"user_id": "u-7", "active_tab": "pontos"});
    FileFlatStore::new(config.secondary_path().unwrap())
        .put(critical.as_object().unwrap())
        .unwrap();

    let app = App::blank();
    let service = StateService::from_config(config, app.registry.clone()).unwrap();
    let restored = service.start().await.unwrap();

    assert_eq!(restored.source, Tier::Secondary);
    assert_eq!(app.user.get(), Some(json!("u-7")));
    assert_eq!(app.tab.get(), Some(json!("pontos")));

    // Saves still reach the secondary tier.
    app.tab.set(json!("tarefas"));
    let report = saved(service.notify(SaveTrigger::Blur).await);
    assert!(report.failed(Tier::Primary));
    assert!(!report.failed(Tier::Secondary));

    // Collections sync without a cache.
    let backend = InMemoryBackend::new();
    backend.set("pontos", vec![json!({"id": "p1"}).as_object().cloned().unwrap()]).unwrap();
    let manager = service.sync_manager(Arc::new(backend)).unwrap();
    assert!(manager.sync_all(false).await.report().unwrap().is_success());
    assert_eq!(manager.collection("pontos").len(), 1);
    service.stop().await;
}

#[tokio::test]
async fn test_tampered_primary_falls_through_to_secondary() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default().with_data_dir(dir.path());

    let app = App::new(Some(json!("pontos")), Some(json!("u-1")), None);
    let service = StateService::from_config(config.clone(), app.registry.clone()).unwrap();
    saved(service.notify(SaveTrigger::Unload).await);
    service.stop().await;
    drop(service);

    let db = SqliteRecordStore::open(config.primary_db_path().unwrap(), STATE_TABLE).unwrap();
    let mut record = db.get(APP_STATE_ID).unwrap().unwrap();
    record.data = record.data.replace("pontos", "xxxxxx");
    db.put(&record).unwrap();
    drop(db);

    let restored_app = App::blank();
    let service = StateService::from_config(config, restored_app.registry.clone()).unwrap();
    let restored = service.start().await.unwrap();
    service.stop().await;

    assert_eq!(restored.source, Tier::Secondary);
    assert_eq!(restored_app.tab.get(), Some(json!("pontos")));
}

#[tokio::test]
async fn test_compression_timeout_stores_plain_and_leaks_nothing() {
    let config = EngineConfig {
        state_compress_timeout: Duration::from_millis(25),
        ..EngineConfig::default()
    };
    let primary = Arc::new(MemoryRecordStore::new());
    let tiers = TierManager::new(
        primary.clone(),
        Arc::new(SessionFlatStore::new()),
        Arc::new(SessionFlatStore::new()),
    );
    let delegate = Arc::new(CompressionDelegate::new(Arc::new(StallingCompressor(
        Duration::from_millis(250),
    ))));

    let app = App::new(None, None, Some(json!({"obs": "b".repeat(4000)})));
    let service = StateService::new(config, app.registry.clone(), tiers, delegate.clone()).unwrap();

    let report = saved(service.notify(SaveTrigger::Interval).await);
    assert!(report.compression_fallback);
    assert!(!report.compressed);
    assert_eq!(delegate.pending_jobs(), 0);

    let record = primary.get(APP_STATE_ID).unwrap().unwrap();
    assert!(!record.compressed);
    record.verify(&record.data).unwrap();
}

#[tokio::test]
async fn test_forced_save_runs_during_in_flight_save() {
    let delegate = Arc::new(CompressionDelegate::new(Arc::new(StallingCompressor(
        Duration::from_millis(150),
    ))));
    let app = App::new(None, None, Some(json!({"obs": "c".repeat(3000)})));
    let service = Arc::new(
        StateService::new(
            EngineConfig::default(),
            app.registry.clone(),
            TierManager::in_memory(),
            delegate,
        )
        .unwrap(),
    );

    let mut phases = service.persistence().watch_phase();
    let background = {
        let service = service.clone();
        tokio::spawn(async move { service.notify(SaveTrigger::Interval).await })
    };
    phases
        .wait_for(|p| *p == stateward_core::PersistencePhase::Compressing)
        .await
        .unwrap();

    let dropped = service.notify(SaveTrigger::Hidden).await.unwrap();
    assert_eq!(dropped.skip_reason(), Some(SkipReason::InProgress));
    assert!(service.notify(SaveTrigger::Unload).await.unwrap().is_saved());
    assert!(background.await.unwrap().unwrap().is_saved());
}
