//! Restore orchestrator
//!
//! Reads the freshest usable copy of the application state, walking the
//! tiers in order: primary, then the critical-field copy, then the session
//! copy. Anything wrong with a tier (unreadable, undecompressable, checksum
//! mismatch, unparseable) sends us on to the next one.

use crate::config::EngineConfig;
use crate::delegate::CompressionDelegate;
use crate::record::{StorageRecord, APP_STATE_ID};
use crate::registry::{apply, StateRegistry};
use crate::snapshot::Snapshot;
use crate::tiers::{Tier, TierManager};
use crate::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Snapshot recovered from one tier
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub source: Tier,
    /// Full when restored from primary, partial otherwise
    pub snapshot: Snapshot,
}

impl RestoredState {
    pub fn is_partial(&self) -> bool {
        self.source != Tier::Primary
    }
}

/// Broadcast once a restore attempt has finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreCompleted {
    /// Tier the state came from, `None` when nothing was found
    pub source: Option<Tier>,
    /// Values pushed back onto providers
    pub applied: usize,
}

pub struct RestoreOrchestrator {
    config: Arc<EngineConfig>,
    registry: Arc<StateRegistry>,
    tiers: TierManager,
    delegate: Arc<CompressionDelegate>,
    completed: broadcast::Sender<RestoreCompleted>,
}

impl RestoreOrchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        registry: Arc<StateRegistry>,
        tiers: TierManager,
        delegate: Arc<CompressionDelegate>,
    ) -> Self {
        let (completed, _) = broadcast::channel(16);
        Self {
            config,
            registry,
            tiers,
            delegate,
            completed,
        }
    }

    /// Receive a [`RestoreCompleted`] after each [`restore_and_apply`](Self::restore_and_apply)
    pub fn subscribe(&self) -> broadcast::Receiver<RestoreCompleted> {
        self.completed.subscribe()
    }

    /// Find the freshest usable snapshot without applying it
    pub async fn restore(&self) -> Option<RestoredState> {
        match self.from_primary().await {
            Ok(Some(snapshot)) => {
                return Some(RestoredState {
                    source: Tier::Primary,
                    snapshot,
                })
            }
            Ok(None) => debug!("No state in primary tier"),
            Err(e) => warn!(error = %e, "Primary tier unusable, falling back"),
        }

        for (tier, read) in [
            (Tier::Secondary, self.tiers.get_secondary()),
            (Tier::Tertiary, self.tiers.get_tertiary()),
        ] {
            match read.and_then(|fields| fields.map_or(Ok(None), partial_snapshot)) {
                Ok(Some(snapshot)) => {
                    return Some(RestoredState {
                        source: tier,
                        snapshot,
                    })
                }
                Ok(None) => debug!(%tier, "No state in tier"),
                Err(e) => warn!(%tier, error = %e, "Tier unusable, falling back"),
            }
        }

        None
    }

    async fn from_primary(&self) -> Result<Option<Snapshot>> {
        let tiers = self.tiers.clone();
        let record = tokio::task::spawn_blocking(move || tiers.get_primary(APP_STATE_ID))
            .await
            .map_err(|e| crate::StatewardError::storage(format!("primary reader failed: {e}")))??;

        match record {
            Some(record) => self.decode(record).await.map(Some),
            None => Ok(None),
        }
    }

    async fn decode(&self, record: StorageRecord) -> Result<Snapshot> {
        let text = if record.compressed {
            self.delegate
                .decompress(record.data.clone(), self.config.state_compress_timeout)
                .await?
        } else {
            record.data.clone()
        };
        record.verify(&text)?;
        Snapshot::from_json(&text)
    }

    /// Restore and push the result onto the registered providers
    ///
    /// Providers that are no longer registered are skipped. Always
    /// broadcasts completion, even when nothing was found.
    pub async fn restore_and_apply(&self) -> Option<RestoredState> {
        let restored = self.restore().await;

        let applied = match &restored {
            Some(state) => {
                let applied = apply(&self.registry, &state.snapshot);
                info!(source = %state.source, applied, "State restored");
                #[cfg(feature = "metrics")]
                crate::observability::with_metrics(|m| m.restores_total.inc());
                applied
            }
            None => {
                info!("No saved state to restore");
                0
            }
        };

        let _ = self.completed.send(RestoreCompleted {
            source: restored.as_ref().map(|s| s.source),
            applied,
        });
        restored
    }
}

fn partial_snapshot(fields: Map<String, Value>) -> Result<Option<Snapshot>> {
    if fields.is_empty() {
        return Ok(None);
    }
    Snapshot::from_fields(fields).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{compress_text, GzipCompressor};
    use crate::record::RecordKind;
    use crate::registry::testing::{bind, Cell};
    use crate::registry::Section;
    use crate::tiers::{FlatStore, MemoryRecordStore, MockRecordStore, RecordStore, SessionFlatStore};
    use crate::StatewardError;
    use serde_json::json;

    struct Fixture {
        orchestrator: RestoreOrchestrator,
        primary: Arc<MemoryRecordStore>,
        secondary: Arc<SessionFlatStore>,
        tertiary: Arc<SessionFlatStore>,
    }

    fn fixture(registry: StateRegistry) -> Fixture {
        let primary = Arc::new(MemoryRecordStore::new());
        let secondary = Arc::new(SessionFlatStore::new());
        let tertiary = Arc::new(SessionFlatStore::new());
        let orchestrator = RestoreOrchestrator::new(
            Arc::new(EngineConfig::default()),
            Arc::new(registry),
            TierManager::new(primary.clone(), secondary.clone(), tertiary.clone()),
            Arc::new(CompressionDelegate::with_gzip()),
        );
        Fixture {
            orchestrator,
            primary,
            secondary,
            tertiary,
        }
    }

    fn snapshot(tab: &str) -> Snapshot {
        let mut snapshot = Snapshot::new("2.0");
        snapshot.active_tab = Some(tab.into());
        snapshot.user_id = Some("u-1".into());
        snapshot
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_restores_plain_primary() {
        let f = fixture(StateRegistry::new());
        let original = snapshot("pontos");
        f.primary
            .put(&StorageRecord::plain(APP_STATE_ID, RecordKind::AppState, original.to_json().unwrap(), 1))
            .unwrap();
        f.secondary.put(&fields(json!({"active_tab": "old"}))).unwrap();

        let restored = f.orchestrator.restore().await.unwrap();
        assert_eq!(restored.source, Tier::Primary);
        assert!(!restored.is_partial());
        assert_eq!(restored.snapshot, original);
    }

    #[tokio::test]
    async fn test_restores_compressed_primary() {
        let f = fixture(StateRegistry::new());
        let original = snapshot("estoque");
        let plain = original.to_json().unwrap();
        let packed = compress_text(&GzipCompressor::new(), &plain, "appState").unwrap();
        f.primary
            .put(&StorageRecord::new(APP_STATE_ID, RecordKind::AppState, &plain, packed.encoded, true, 1))
            .unwrap();

        let restored = f.orchestrator.restore().await.unwrap();
        assert_eq!(restored.snapshot, original);
    }

    #[tokio::test]
    async fn test_falls_back_to_secondary_then_tertiary() {
        let f = fixture(StateRegistry::new());
        f.tertiary
            .put(&fields(json!({"active_tab": "tarefas", "captured_at": 5})))
            .unwrap();

        let restored = f.orchestrator.restore().await.unwrap();
        assert_eq!(restored.source, Tier::Tertiary);
        assert_eq!(restored.snapshot.active_tab.as_deref(), Some("tarefas"));

        f.secondary
            .put(&fields(json!({"user_id": "u-7", "forms": {"f": {"a": 1}}})))
            .unwrap();
        let restored = f.orchestrator.restore().await.unwrap();
        assert_eq!(restored.source, Tier::Secondary);
        assert!(restored.is_partial());
        assert_eq!(restored.snapshot.user_id.as_deref(), Some("u-7"));
        assert!(restored.snapshot.inputs.is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_falls_through() {
        let f = fixture(StateRegistry::new());
        let mut record =
            StorageRecord::plain(APP_STATE_ID, RecordKind::AppState, snapshot("a").to_json().unwrap(), 1);
        record.data = snapshot("tampered").to_json().unwrap();
        f.primary.put(&record).unwrap();
        f.secondary.put(&fields(json!({"active_tab": "b"}))).unwrap();

        let restored = f.orchestrator.restore().await.unwrap();
        assert_eq!(restored.source, Tier::Secondary);
        assert_eq!(restored.snapshot.active_tab.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_undecompressable_primary_falls_through() {
        let f = fixture(StateRegistry::new());
        f.primary
            .put(&StorageRecord::new(APP_STATE_ID, RecordKind::AppState, "{}", "zz-not-hex".into(), true, 1))
            .unwrap();
        f.secondary.put(&fields(json!({"active_tab": "b"}))).unwrap();

        let restored = f.orchestrator.restore().await.unwrap();
        assert_eq!(restored.source, Tier::Secondary);
    }

    #[tokio::test]
    async fn test_unavailable_primary_falls_through() {
        let mut primary = MockRecordStore::new();
        primary
            .expect_get()
            .returning(|_| Err(StatewardError::tier_unavailable("primary", "blocked")));
        let secondary = Arc::new(SessionFlatStore::new());
        secondary.put(&fields(json!({"user_id": "u-2"}))).unwrap();

        let orchestrator = RestoreOrchestrator::new(
            Arc::new(EngineConfig::default()),
            Arc::new(StateRegistry::new()),
            TierManager::new(Arc::new(primary), secondary, Arc::new(SessionFlatStore::new())),
            Arc::new(CompressionDelegate::with_gzip()),
        );

        let restored = orchestrator.restore().await.unwrap();
        assert_eq!(restored.source, Tier::Secondary);
    }

    #[tokio::test]
    async fn test_nothing_stored_broadcasts_empty_completion() {
        let f = fixture(StateRegistry::new());
        let mut events = f.orchestrator.subscribe();

        assert!(f.orchestrator.restore_and_apply().await.is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            RestoreCompleted {
                source: None,
                applied: 0
            }
        );
    }

    #[tokio::test]
    async fn test_apply_skips_unregistered_providers() {
        let registry = StateRegistry::new();
        let tab = Cell::default();
        bind(&registry, Section::ActiveTab, "tab", &tab);
        let f = fixture(registry);

        // user_id has no provider any more.
        f.primary
            .put(&StorageRecord::plain(
                APP_STATE_ID,
                RecordKind::AppState,
                snapshot("avaliacoes").to_json().unwrap(),
                1,
            ))
            .unwrap();
        let mut events = f.orchestrator.subscribe();

        let restored = f.orchestrator.restore_and_apply().await.unwrap();
        assert_eq!(restored.source, Tier::Primary);
        assert_eq!(tab.get(), Some(json!("avaliacoes")));
        assert_eq!(
            events.recv().await.unwrap(),
            RestoreCompleted {
                source: Some(Tier::Primary),
                applied: 1
            }
        );
    }
}
