/*!
Compression delegate bridge.

Compression runs on a dedicated background thread. Callers never touch
that thread directly: every call becomes a [`CompressionJob`] with a fresh
identifier, is posted as a [`DelegateRequest`], and resolves when a
[`DelegateResponse`] echoing the same id comes back. Each call is bounded
by a timeout; when it fires the pending entry is dropped so a late answer
goes nowhere.
*/

use crate::compression::{compress_text, decompress_text, CompressionAdapter, GzipCompressor};
use crate::{Result, StatewardError};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Context label used for application state payloads
pub const APP_STATE_CONTEXT: &str = "appState";

/// Direction of a delegated job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "COMPRESS_DATA")]
    Compress,
    #[serde(rename = "DECOMPRESS_DATA")]
    Decompress,
}

/// Payload of a delegate request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_label: Option<String>,
}

/// Message posted to the background context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub payload: JobPayload,
}

/// Message posted back by the background context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One round trip through the delegate
#[derive(Debug, Clone)]
pub struct CompressionJob {
    pub id: String,
    pub kind: JobKind,
    pub payload: String,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CompressionJob {
    fn new(kind: JobKind, payload: String, context: Option<String>) -> Self {
        let prefix = match kind {
            JobKind::Compress => "compress",
            JobKind::Decompress => "decompress",
        };
        Self {
            id: format!("{prefix}_{}", Uuid::new_v4()),
            kind,
            payload,
            context,
            created_at: Utc::now(),
        }
    }

    fn into_request(self) -> DelegateRequest {
        let payload = match self.kind {
            JobKind::Compress => JobPayload {
                data: Some(self.payload),
                compressed_data: None,
                context_label: self.context,
            },
            JobKind::Decompress => JobPayload {
                data: None,
                compressed_data: Some(self.payload),
                context_label: self.context,
            },
        };
        DelegateRequest {
            id: self.id,
            kind: self.kind,
            payload,
        }
    }
}

enum WorkerMessage {
    Job(DelegateRequest),
    Shutdown,
}

type PendingMap = HashMap<String, oneshot::Sender<DelegateResponse>>;

/// Receiving end of the response channel: routes answers to their callers
#[derive(Clone, Default)]
struct ResponsePort {
    pending: Arc<Mutex<PendingMap>>,
}

impl ResponsePort {
    fn register(&self, id: &str) -> Result<oneshot::Receiver<DelegateResponse>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StatewardError::DelegateUnavailable("pending map poisoned".into()))?;
        pending.insert(id.to_string(), tx);
        Ok(rx)
    }

    fn detach(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }

    fn deliver(&self, response: DelegateResponse) {
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&response.id),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => {
                // The caller may have timed out between lookup and send.
                let _ = tx.send(response);
            }
            None => debug!(job_id = %response.id, "Dropping response for unknown or expired job"),
        }
    }

    fn fail_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

struct Worker {
    requests: mpsc::UnboundedSender<WorkerMessage>,
}

/// Bridge to the background compression context
///
/// # Example
/// ```rust,no_run
/// use stateward_core::delegate::CompressionDelegate;
/// use std::time::Duration;
///
/// # async fn run() -> stateward_core::Result<()> {
/// let delegate = CompressionDelegate::with_gzip();
/// let packed = delegate.compress("{\"a\":1}".into(), "appState", Duration::from_secs(5)).await?;
/// let text = delegate.decompress(packed, Duration::from_secs(5)).await?;
/// assert_eq!(text, "{\"a\":1}");
/// # Ok(())
/// # }
/// ```
pub struct CompressionDelegate {
    adapter: Arc<dyn CompressionAdapter>,
    worker: OnceCell<Worker>,
    port: ResponsePort,
    closed: AtomicBool,
}

impl CompressionDelegate {
    /// Create a delegate running the given adapter; nothing is spawned yet
    pub fn new(adapter: Arc<dyn CompressionAdapter>) -> Self {
        Self {
            adapter,
            worker: OnceCell::new(),
            port: ResponsePort::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Delegate backed by maximum-level gzip
    pub fn with_gzip() -> Self {
        Self::new(Arc::new(GzipCompressor::new()))
    }

    /// Compress `payload`, returning the encoded compressed text
    pub async fn compress(&self, payload: String, context: &str, timeout: Duration) -> Result<String> {
        let job = CompressionJob::new(JobKind::Compress, payload, Some(context.to_string()));
        self.run(job, timeout).await
    }

    /// Decompress text previously produced by [`CompressionDelegate::compress`]
    pub async fn decompress(&self, payload: String, timeout: Duration) -> Result<String> {
        let job = CompressionJob::new(JobKind::Decompress, payload, None);
        self.run(job, timeout).await
    }

    /// Number of jobs still waiting for an answer
    pub fn pending_jobs(&self) -> usize {
        self.port.len()
    }

    /// Whether the background context has been spawned
    pub fn is_started(&self) -> bool {
        self.worker.get().is_some()
    }

    /// Stop the background context; later calls fail with `DelegateUnavailable`
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.worker.get() {
            let _ = worker.requests.send(WorkerMessage::Shutdown);
        }
        self.port.fail_all();
        debug!("Compression delegate shut down");
    }

    async fn run(&self, job: CompressionJob, timeout: Duration) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StatewardError::DelegateUnavailable("delegate is shut down".into()));
        }

        let worker = self.worker()?;
        let job_id = job.id.clone();
        let rx = self.port.register(&job_id)?;

        if worker.requests.send(WorkerMessage::Job(job.into_request())).is_err() {
            self.port.detach(&job_id);
            return Err(StatewardError::DelegateUnavailable(
                "background context has exited".into(),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match (response.result, response.error) {
                (_, Some(error)) => Err(StatewardError::compression(error)),
                (Some(result), None) => Ok(result),
                (None, None) => Err(StatewardError::compression("empty delegate response")),
            },
            Ok(Err(_)) => Err(StatewardError::DelegateUnavailable(
                "job abandoned by background context".into(),
            )),
            Err(_) => {
                self.port.detach(&job_id);
                warn!(job_id = %job_id, ?timeout, "Compression job timed out");
                Err(StatewardError::Timeout { job_id, timeout })
            }
        }
    }

    fn worker(&self) -> Result<&Worker> {
        self.worker.get_or_try_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let adapter = Arc::clone(&self.adapter);
            let port = self.port.clone();

            std::thread::Builder::new()
                .name("stateward-delegate".to_string())
                .spawn(move || worker_loop(adapter, rx, port))
                .map_err(|e| {
                    StatewardError::DelegateUnavailable(format!("failed to spawn thread: {e}"))
                })?;

            debug!("Compression delegate started");
            Ok(Worker { requests: tx })
        })
    }
}

impl Drop for CompressionDelegate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    adapter: Arc<dyn CompressionAdapter>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    port: ResponsePort,
) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            WorkerMessage::Job(request) => port.deliver(handle_request(adapter.as_ref(), request)),
            WorkerMessage::Shutdown => break,
        }
    }
}

fn handle_request(adapter: &dyn CompressionAdapter, request: DelegateRequest) -> DelegateResponse {
    let outcome = match request.kind {
        JobKind::Compress => {
            let context = request
                .payload
                .context_label
                .unwrap_or_else(|| APP_STATE_CONTEXT.to_string());
            match request.payload.data {
                Some(data) => compress_text(adapter, &data, &context).map(|packed| {
                    debug!(
                        context = %packed.context,
                        original = packed.original_size,
                        compressed = packed.compressed_size,
                        ratio = packed.ratio,
                        "Compressed payload"
                    );
                    packed.encoded
                }),
                None => Err(StatewardError::validation("COMPRESS_DATA without data")),
            }
        }
        JobKind::Decompress => match request.payload.compressed_data {
            Some(data) => decompress_text(adapter, &data),
            None => Err(StatewardError::validation("DECOMPRESS_DATA without compressedData")),
        },
    };

    match outcome {
        Ok(result) => DelegateResponse {
            id: request.id,
            result: Some(result),
            error: None,
        },
        Err(e) => DelegateResponse {
            id: request.id,
            result: None,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Adapter that sleeps before delegating, to force timeouts
    pub struct SlowCompressor {
        pub delay: Duration,
        pub inner: GzipCompressor,
    }

    impl SlowCompressor {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                inner: GzipCompressor::new(),
            }
        }
    }

    impl CompressionAdapter for SlowCompressor {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
            std::thread::sleep(self.delay);
            self.inner.compress(data)
        }

        fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
            std::thread::sleep(self.delay);
            self.inner.decompress(compressed_data)
        }

        fn algorithm_name(&self) -> &str {
            "slow-gzip"
        }
    }

    /// Adapter that always fails
    pub struct FailingCompressor;

    impl CompressionAdapter for FailingCompressor {
        fn compress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Err(StatewardError::compression("compressor offline"))
        }

        fn decompress(&self, _compressed_data: &[u8]) -> Result<Vec<u8>> {
            Err(StatewardError::compression("compressor offline"))
        }

        fn algorithm_name(&self) -> &str {
            "failing"
        }
    }
}
