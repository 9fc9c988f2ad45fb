/*!
Remote backend boundary.

The backend is an opaque collection-oriented store reachable by a full
query and by a standing live subscription. [`InMemoryBackend`] implements
it over process memory for offline use and tests.
*/

use crate::{Result, StatewardError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Buffered notifications per subscription
pub const SUBSCRIPTION_BUFFER: usize = 16;

/// One remote document, including its `id`
pub type Document = Map<String, Value>;

/// Change notification: the full new contents, or a listener error
pub type Update = Result<Vec<Document>>;

/// Collection-oriented remote store
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Fetch every document of a collection
    async fn fetch(&self, collection: &str) -> Result<Vec<Document>>;

    /// Attach a live subscription to a collection
    async fn subscribe(&self, collection: &str) -> Result<Subscription>;
}

/// Live subscription to one collection
///
/// Dropping it detaches the listener.
pub struct Subscription {
    updates: mpsc::Receiver<Update>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(updates: mpsc::Receiver<Update>) -> Self {
        Self {
            updates,
            on_cancel: None,
        }
    }

    /// Run `cancel` when the subscription is dropped
    pub fn on_cancel<F: FnOnce() + Send + 'static>(mut self, cancel: F) -> Self {
        self.on_cancel = Some(Box::new(cancel));
        self
    }

    /// Next notification; `None` once the backend closed the stream
    pub async fn next(&mut self) -> Option<Update> {
        self.updates.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancellable", &self.on_cancel.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.on_cancel.take() {
            cancel();
        }
    }
}

#[derive(Default)]
struct BackendState {
    collections: HashMap<String, Vec<Document>>,
    failures: HashMap<String, StatewardError>,
    listeners: HashMap<String, Vec<mpsc::Sender<Update>>>,
    refuse_subscribe: Vec<String>,
}

/// Remote backend held in memory
///
/// Collections are seeded with [`set`](Self::set), failures injected with
/// [`fail`](Self::fail) and live changes pushed with [`push`](Self::push).
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
    fetches: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BackendState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StatewardError::storage("backend state lock poisoned"))?;
        Ok(f(&mut state))
    }

    /// Replace a collection's contents without notifying listeners
    pub fn set(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        self.with_state(|s| {
            s.failures.remove(collection);
            s.collections.insert(collection.to_string(), documents);
        })
    }

    /// Make fetches of `collection` fail with `error`
    pub fn fail(&self, collection: &str, error: StatewardError) -> Result<()> {
        self.with_state(|s| {
            s.failures.insert(collection.to_string(), error);
        })
    }

    /// Make subscriptions to `collection` fail to attach
    pub fn refuse_subscriptions(&self, collection: &str) -> Result<()> {
        self.with_state(|s| s.refuse_subscribe.push(collection.to_string()))
    }

    /// Replace a collection and notify its live listeners
    ///
    /// Returns how many listeners received the update. A listener whose
    /// buffer is full misses it; that is logged.
    pub fn push(&self, collection: &str, documents: Vec<Document>) -> Result<usize> {
        let listeners = self.with_state(|s| {
            s.collections.insert(collection.to_string(), documents.clone());
            s.listeners.get(collection).cloned().unwrap_or_default()
        })?;
        Ok(deliver(collection, &listeners, || Ok(documents.clone())))
    }

    /// Deliver a listener error to a collection's subscribers
    pub fn push_error(
        &self,
        collection: &str,
        error: impl Fn() -> StatewardError,
    ) -> Result<usize> {
        let listeners =
            self.with_state(|s| s.listeners.get(collection).cloned().unwrap_or_default())?;
        Ok(deliver(collection, &listeners, || Err(error())))
    }

    /// Number of fetch calls served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of subscriptions that have not been dropped
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

fn deliver(
    collection: &str,
    listeners: &[mpsc::Sender<Update>],
    update: impl Fn() -> Update,
) -> usize {
    let mut delivered = 0;
    for listener in listeners {
        match listener.try_send(update()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(collection = %collection, "Listener buffer full, update dropped")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(collection = %collection, "Skipping detached listener")
            }
        }
    }
    delivered
}

fn clone_error(collection: &str, error: &StatewardError) -> StatewardError {
    match error {
        StatewardError::Remote {
            message, transient, ..
        } => StatewardError::Remote {
            collection: collection.to_string(),
            message: message.clone(),
            transient: *transient,
        },
        other => StatewardError::remote_permanent(collection, other.to_string()),
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn fetch(&self, collection: &str) -> Result<Vec<Document>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| match s.failures.get(collection) {
            Some(error) => Err(clone_error(collection, error)),
            None => Ok(s.collections.get(collection).cloned().unwrap_or_default()),
        })?
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.with_state(|s| {
            if s.refuse_subscribe.iter().any(|c| c == collection) {
                return Err(StatewardError::remote_permanent(collection, "listener rejected"));
            }
            s.listeners
                .entry(collection.to_string())
                .or_default()
                .push(tx);
            Ok(())
        })??;

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        Ok(Subscription::new(rx).on_cancel(move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
