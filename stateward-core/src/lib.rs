/*!
# Stateward Core Engine

Differential state persistence and offline collection sync.

This crate provides:

- Opt-in state capture through a registry of typed providers
- Shallow diffing so unchanged state is never rewritten
- Compression off the calling task, with hard timeouts and plain fallback
- Three persistence tiers (SQLite records, a critical-field JSON file and a
  session-only copy) with restore falling back through them in order
- A TTL cache of remote collections kept current by live subscriptions

## Architecture

Storage tiers, the compression codec and the remote backend sit behind
traits ([`RecordStore`], [`FlatStore`], [`CompressionAdapter`],
[`RemoteBackend`]); the orchestrators only talk to those.

## Usage

```rust,no_run
use std::sync::Arc;
use serde_json::json;
use stateward_core::{EngineConfig, SaveTrigger, Section, StateRegistry, StateService};

# async fn run() -> stateward_core::Result<()> {
let registry = Arc::new(StateRegistry::new());
registry.register_fn(Section::ActiveTab, "main", || Some(json!("tarefas")), |_| true);

let config = EngineConfig::default().with_data_dir("/var/lib/stateward");
let service = StateService::from_config(config, registry)?;

service.start().await;
service.notify(SaveTrigger::Hidden).await;
service.stop().await;
# Ok(())
# }
```
*/

pub mod compression;
pub mod config;
pub mod delegate;
pub mod diff;
pub mod error;
pub mod observability;
pub mod persistence;
pub mod record;
pub mod registry;
pub mod restore;
pub mod service;
pub mod snapshot;
pub mod sync;
pub mod tiers;

pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::EngineConfig;
pub use delegate::CompressionDelegate;
pub use diff::{diff, Diff};
pub use error::{Result, StatewardError};
pub use persistence::{
    PersistenceOrchestrator, PersistencePhase, SaveOutcome, SaveReport, SaveTrigger, SkipReason,
};
pub use record::{RecordKind, StorageRecord, APP_STATE_ID};
pub use registry::{apply, capture, FieldKind, FieldProvider, Section, StateProvider, StateRegistry};
pub use restore::{RestoreCompleted, RestoreOrchestrator, RestoredState};
pub use service::StateService;
pub use snapshot::Snapshot;
pub use sync::{
    CollectionSource, CollectionSyncManager, Document, InMemoryBackend, RemoteBackend,
    Subscription, SyncOutcome, SyncReport, SyncStatus,
};
pub use tiers::{
    FileFlatStore, FlatStore, MemoryRecordStore, RecordStore, SessionFlatStore,
    SqliteRecordStore, Tier, TierManager, UnavailableRecordStore,
};
