//! Persistence orchestrator
//!
//! Decides when to save, runs capture → diff → (compress) → write across the
//! three tiers, and keeps the baseline snapshot the next diff is taken
//! against. A save-in-progress flag drops overlapping timer or event saves;
//! the unload save is forced and always runs.

use crate::config::EngineConfig;
use crate::delegate::{CompressionDelegate, APP_STATE_CONTEXT};
use crate::diff::diff;
use crate::record::{RecordKind, StorageRecord, APP_STATE_ID};
use crate::registry::{capture, StateRegistry};
use crate::snapshot::{Snapshot, SESSION_KEYS};
use crate::tiers::{Tier, TierManager};
use crate::{Result, StatewardError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What asked for a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// Periodic auto-save tick
    Interval,
    /// The application went to the background
    Hidden,
    /// The application lost focus
    Blur,
    /// The application is about to exit
    Unload,
}

impl SaveTrigger {
    /// Forced saves ignore both the in-progress guard and the diff
    pub fn is_forced(&self) -> bool {
        matches!(self, SaveTrigger::Unload)
    }
}

/// Where the orchestrator currently is in a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistencePhase {
    Idle,
    Capturing,
    Diffing,
    Skipped,
    Compressing,
    Writing,
}

/// Why a save did not write anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another save was still running
    InProgress,
    /// Nothing changed since the baseline
    NoChanges,
    /// Serialized state exceeded the configured maximum
    TooLarge { size: usize },
}

/// Result of a save that went through to the tiers
#[derive(Debug)]
pub struct SaveReport {
    pub trigger: SaveTrigger,
    /// Serialized (uncompressed) size of the snapshot
    pub size_bytes: usize,
    /// Whether the primary tier got the compressed form
    pub compressed: bool,
    /// Compression was attempted but failed or timed out
    pub compression_fallback: bool,
    /// Tiers whose write failed
    pub failures: Vec<(Tier, StatewardError)>,
}

impl SaveReport {
    /// Every tier write succeeded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, tier: Tier) -> bool {
        self.failures.iter().any(|(t, _)| *t == tier)
    }
}

#[derive(Debug)]
pub enum SaveOutcome {
    Skipped(SkipReason),
    Saved(SaveReport),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            SaveOutcome::Skipped(reason) => Some(*reason),
            SaveOutcome::Saved(_) => None,
        }
    }
}

/// One running save
///
/// Only the save holding the in-progress flag publishes phases. Forced saves
/// that overlap it run silently. Dropping the owner's run returns the phase
/// to idle and releases the flag, on every exit path.
struct SaveRun<'a> {
    owner: Option<&'a PersistenceOrchestrator>,
}

impl SaveRun<'_> {
    fn enter(&self, phase: PersistencePhase) {
        if let Some(orchestrator) = self.owner {
            orchestrator.phase.send_replace(phase);
        }
    }

    fn skip(&self, reason: SkipReason) -> SaveOutcome {
        self.enter(PersistencePhase::Skipped);
        #[cfg(feature = "metrics")]
        crate::observability::with_metrics(|m| m.saves_skipped_total.inc());
        SaveOutcome::Skipped(reason)
    }
}

impl Drop for SaveRun<'_> {
    fn drop(&mut self) {
        if let Some(orchestrator) = self.owner {
            orchestrator.phase.send_replace(PersistencePhase::Idle);
            orchestrator.saving.store(false, Ordering::SeqCst);
        }
    }
}

pub struct PersistenceOrchestrator {
    config: Arc<EngineConfig>,
    registry: Arc<StateRegistry>,
    tiers: TierManager,
    delegate: Arc<CompressionDelegate>,
    baseline: Mutex<Option<Snapshot>>,
    saving: AtomicBool,
    phase: watch::Sender<PersistencePhase>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceOrchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        registry: Arc<StateRegistry>,
        tiers: TierManager,
        delegate: Arc<CompressionDelegate>,
    ) -> Self {
        let (phase, _) = watch::channel(PersistencePhase::Idle);
        Self {
            config,
            registry,
            tiers,
            delegate,
            baseline: Mutex::new(None),
            saving: AtomicBool::new(false),
            phase,
            timer: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> PersistencePhase {
        *self.phase.borrow()
    }

    /// Whether a non-forced save currently holds the in-progress flag
    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    /// Observe phase transitions
    pub fn watch_phase(&self) -> watch::Receiver<PersistencePhase> {
        self.phase.subscribe()
    }

    /// Snapshot the next diff is taken against
    pub fn baseline(&self) -> Option<Snapshot> {
        self.baseline.lock().ok().and_then(|b| b.clone())
    }

    /// Replace the baseline (after a restore, or `None` after a clear)
    pub fn set_baseline(&self, snapshot: Option<Snapshot>) {
        match self.baseline.lock() {
            Ok(mut baseline) => *baseline = snapshot,
            Err(_) => warn!("Baseline lock poisoned, keeping previous baseline"),
        }
    }

    /// Run one save
    ///
    /// Tier failures never make this return an error; they are listed in
    /// the [`SaveReport`] and the baseline is left untouched so the next
    /// save tries again.
    pub async fn save(&self, trigger: SaveTrigger) -> Result<SaveOutcome> {
        let forced = trigger.is_forced();
        let owns_flag = self
            .saving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !owns_flag && !forced {
            debug!(?trigger, "Save already in progress, dropping trigger");
            return Ok(SaveOutcome::Skipped(SkipReason::InProgress));
        }
        let run = SaveRun {
            owner: owns_flag.then_some(self),
        };

        run.enter(PersistencePhase::Capturing);
        let current = capture(&self.registry, &self.config);

        run.enter(PersistencePhase::Diffing);
        if !forced {
            if let Some(previous) = self.baseline() {
                if diff(&previous, &current)?.is_none() {
                    debug!(?trigger, "No changes since last save");
                    return Ok(run.skip(SkipReason::NoChanges));
                }
            }
        }

        let serialized = current.to_json()?;
        let size = serialized.len();
        #[cfg(feature = "metrics")]
        crate::observability::with_metrics(|m| m.state_size_bytes.observe(size as f64));

        if size > self.config.max_state_size_bytes {
            warn!(
                size,
                max = self.config.max_state_size_bytes,
                "State too large, not saving"
            );
            return Ok(run.skip(SkipReason::TooLarge { size }));
        }

        let mut compression_fallback = false;
        let record = if size > self.config.compression_threshold_bytes {
            run.enter(PersistencePhase::Compressing);
            match self
                .delegate
                .compress(
                    serialized.clone(),
                    APP_STATE_CONTEXT,
                    self.config.state_compress_timeout,
                )
                .await
            {
                Ok(encoded) => {
                    StorageRecord::new(APP_STATE_ID, RecordKind::AppState, &serialized, encoded, true, 1)
                }
                Err(e) => {
                    warn!(error = %e, size, "Compression failed, storing state uncompressed");
                    compression_fallback = true;
                    #[cfg(feature = "metrics")]
                    crate::observability::with_metrics(|m| m.compression_fallbacks_total.inc());
                    StorageRecord::plain(APP_STATE_ID, RecordKind::AppState, serialized, 1)
                }
            }
        } else {
            StorageRecord::plain(APP_STATE_ID, RecordKind::AppState, serialized, 1)
        };
        let compressed = record.compressed;

        run.enter(PersistencePhase::Writing);
        let critical = current.subset(&self.config.critical_fields)?;
        let session = current.subset(SESSION_KEYS)?;
        let failures = self.write_tiers(record, critical, session).await;

        if failures.is_empty() {
            self.set_baseline(Some(current));
            #[cfg(feature = "metrics")]
            crate::observability::with_metrics(|m| m.saves_total.inc());
            info!(?trigger, size, compressed, "State saved");
        } else {
            warn!(
                ?trigger,
                failed = failures.len(),
                "State saved partially, baseline kept"
            );
        }

        Ok(SaveOutcome::Saved(SaveReport {
            trigger,
            size_bytes: size,
            compressed,
            compression_fallback,
            failures,
        }))
    }

    /// Write each tier independently; one failing does not stop the others
    async fn write_tiers(
        &self,
        record: StorageRecord,
        critical: serde_json::Map<String, serde_json::Value>,
        session: serde_json::Map<String, serde_json::Value>,
    ) -> Vec<(Tier, StatewardError)> {
        let tiers = self.tiers.clone();
        let writes = tokio::task::spawn_blocking(move || {
            vec![
                (Tier::Primary, tiers.put_primary(&record)),
                (Tier::Secondary, tiers.put_secondary(&critical)),
                (Tier::Tertiary, tiers.put_tertiary(&session)),
            ]
        })
        .await;

        let writes = match writes {
            Ok(writes) => writes,
            Err(e) => {
                return Tier::ALL
                    .into_iter()
                    .map(|tier| (tier, StatewardError::storage(format!("tier writer failed: {e}"))))
                    .collect();
            }
        };

        writes
            .into_iter()
            .filter_map(|(tier, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(%tier, error = %e, "Tier write failed");
                    Some((tier, e))
                }
            })
            .collect()
    }

    /// Handle an application lifecycle event
    pub async fn notify(&self, trigger: SaveTrigger) -> Option<SaveOutcome> {
        match self.save(trigger).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(?trigger, error = %e, "Save failed");
                None
            }
        }
    }

    /// Start the auto-save timer; a running timer is left alone
    pub fn start(self: &Arc<Self>) {
        let Ok(mut timer) = self.timer.lock() else {
            warn!("Timer lock poisoned, auto-save not started");
            return;
        };
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let period = self.config.auto_save_interval;
        let weak: Weak<Self> = Arc::downgrade(self);
        *timer = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.notify(SaveTrigger::Interval).await;
            }
        }));
        debug!(?period, "Auto-save started");
    }

    /// Stop the auto-save timer
    pub fn stop(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
                debug!("Auto-save stopped");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for PersistenceOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}
