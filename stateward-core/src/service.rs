//! Application-facing entry point
//!
//! [`StateService`] owns one registry, one set of tiers and one compression
//! delegate, and wires the persistence and restore orchestrators to them.
//! Build it once at startup and share it.

use crate::config::EngineConfig;
use crate::delegate::CompressionDelegate;
use crate::persistence::{PersistenceOrchestrator, SaveOutcome, SaveTrigger};
use crate::registry::StateRegistry;
use crate::restore::{RestoreCompleted, RestoreOrchestrator, RestoredState};
use crate::sync::{CollectionSyncManager, RemoteBackend};
use crate::tiers::{open_collection_store, Tier, TierManager};
use crate::{Result, StatewardError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct StateService {
    config: Arc<EngineConfig>,
    registry: Arc<StateRegistry>,
    tiers: TierManager,
    delegate: Arc<CompressionDelegate>,
    persistence: Arc<PersistenceOrchestrator>,
    restorer: RestoreOrchestrator,
}

impl StateService {
    /// Wire a service over explicit tiers and delegate
    pub fn new(
        config: EngineConfig,
        registry: Arc<StateRegistry>,
        tiers: TierManager,
        delegate: Arc<CompressionDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let persistence = Arc::new(PersistenceOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            tiers.clone(),
            Arc::clone(&delegate),
        ));
        let restorer = RestoreOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            tiers.clone(),
            Arc::clone(&delegate),
        );

        Ok(Self {
            config,
            registry,
            tiers,
            delegate,
            persistence,
            restorer,
        })
    }

    /// Tiers from `config.data_dir` and a gzip delegate
    ///
    /// A primary database that cannot be opened does not fail construction;
    /// saves and restores go through the remaining tiers.
    pub fn from_config(config: EngineConfig, registry: Arc<StateRegistry>) -> Result<Self> {
        let tiers = TierManager::from_config(&config)?;
        Self::new(config, registry, tiers, Arc::new(CompressionDelegate::with_gzip()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    pub fn tiers(&self) -> &TierManager {
        &self.tiers
    }

    pub fn persistence(&self) -> &Arc<PersistenceOrchestrator> {
        &self.persistence
    }

    pub fn restorer(&self) -> &RestoreOrchestrator {
        &self.restorer
    }

    pub fn subscribe_restore(&self) -> broadcast::Receiver<RestoreCompleted> {
        self.restorer.subscribe()
    }

    /// Restore saved state onto the registry, then start auto-saving
    ///
    /// A full snapshot from the primary tier becomes the diff baseline, so
    /// unchanged state is not written straight back. Partial restores leave
    /// the baseline empty and the first tick writes everything.
    pub async fn start(&self) -> Option<RestoredState> {
        let restored = self.restorer.restore_and_apply().await;
        if let Some(state) = restored.as_ref().filter(|s| !s.is_partial()) {
            self.persistence.set_baseline(Some(state.snapshot.clone()));
        }
        self.persistence.start();
        info!(
            restored_from = ?restored.as_ref().map(|s| s.source),
            "State service started"
        );
        restored
    }

    /// Forward a lifecycle event to the persistence orchestrator
    pub async fn notify(&self, trigger: SaveTrigger) -> Option<SaveOutcome> {
        self.persistence.notify(trigger).await
    }

    /// Final forced save, then stop the timer and the delegate
    pub async fn stop(&self) -> Option<SaveOutcome> {
        let outcome = self.persistence.notify(SaveTrigger::Unload).await;
        self.persistence.stop();
        self.delegate.shutdown();
        info!("State service stopped");
        outcome
    }

    /// Wipe every tier and forget the baseline
    ///
    /// Returns the tiers that could not be cleared.
    pub async fn clear_state(&self) -> Result<Vec<(Tier, StatewardError)>> {
        let tiers = self.tiers.clone();
        let failures = tokio::task::spawn_blocking(move || tiers.clear_all())
            .await
            .map_err(|e| StatewardError::storage(format!("tier clear failed: {e}")))?;

        self.persistence.set_baseline(None);
        if failures.is_empty() {
            info!("Saved state cleared");
        } else {
            warn!(failed = failures.len(), "Saved state partially cleared");
        }
        Ok(failures)
    }

    /// Collection sync manager sharing this service's delegate and data directory
    pub fn sync_manager(&self, backend: Arc<dyn RemoteBackend>) -> Result<CollectionSyncManager> {
        let store = open_collection_store(&self.config)?;
        Ok(CollectionSyncManager::new(
            Arc::clone(&self.config),
            backend,
            store,
            Arc::clone(&self.delegate),
        ))
    }
}
