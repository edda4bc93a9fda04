//! Scripted stand-ins for the tool-server client, model daemon, document
//! indexer and persistent stores.
//!
//! Every double counts its calls so tests can assert that a collaborator was
//! (or was not) contacted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_ops::SourceError;
use conduit_resources::{
    ConnectEvent, CredentialModelEntry, CredentialStore, DocumentIndexer, IndexEvent, IndexParams,
    McpServerClient, McpServerRecord, McpServerStore, ModelPuller, PullEvent, RagDocument,
    StoreError,
};
use conduit_resources::collaborators::{ConnectStream, IndexStream, PullStream};
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a scripted stream behaves once its events are exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tail {
    /// End the stream.
    End,
    /// Stay open until cancelled, then emit the cancel event.
    Hold,
}

/// Replays `events` from a producer task, pausing `delay` between items.
/// Cancellation stops the script and emits `on_cancel` when given.
/// `on_finish` runs just before the last event of a script that ends.
fn scripted<T>(
    events: Vec<T>,
    delay: Duration,
    cancel: CancellationToken,
    on_cancel: Option<T>,
    tail: Tail,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
) -> BoxStream<'static, T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut on_finish = on_finish;
        let last = events.len().saturating_sub(1);
        for (idx, event) in events.into_iter().enumerate() {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                if let Some(event) = on_cancel {
                    let _ = tx.send(event).await;
                }
                return;
            }
            if idx == last && tail == Tail::End {
                if let Some(finish) = on_finish.take() {
                    finish();
                }
            }
            if tx.send(event).await.is_err() {
                return;
            }
        }
        if tail == Tail::Hold {
            cancel.cancelled().await;
            if let Some(event) = on_cancel {
                let _ = tx.send(event).await;
            }
        }
    });
    ReceiverStream::new(rx).boxed()
}

// -------- Tool servers --------

pub struct MockMcpClient {
    scripts: Mutex<HashMap<String, Vec<ConnectEvent>>>,
    hanging: Mutex<HashSet<String>>,
    fail_disconnect: AtomicBool,
    step_delay: Duration,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockMcpClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            hanging: Mutex::new(HashSet::new()),
            fail_disconnect: AtomicBool::new(false),
            step_delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Replaces the default `connecting, connected` script for one server.
    pub fn script(&self, server_id: &str, events: Vec<ConnectEvent>) {
        self.scripts.lock().insert(server_id.to_string(), events);
    }

    /// The server never answers; the attempt ends only when cancelled.
    pub fn hang(&self, server_id: &str) {
        self.hanging.lock().insert(server_id.to_string());
    }

    pub fn fail_disconnects(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl Default for MockMcpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl McpServerClient for MockMcpClient {
    async fn connect_server(
        &self,
        record: &McpServerRecord,
        cancel: CancellationToken,
    ) -> Result<ConnectStream, SourceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!(target: "conduit::mock", server = %record.id, "connect_server");
        let connecting = ConnectEvent::Connecting {
            message: format!("Connecting to {}", record.name),
        };
        if self.hanging.lock().contains(&record.id) {
            return Ok(scripted(
                vec![connecting],
                self.step_delay,
                cancel,
                Some(ConnectEvent::Cancelled),
                Tail::Hold,
                None,
            ));
        }
        let events = self.scripts.lock().get(&record.id).cloned().unwrap_or_else(|| {
            vec![
                connecting,
                ConnectEvent::Connected {
                    protocol_version: Some("2025-03-26".to_string()),
                    tool_count: 3,
                },
            ]
        });
        Ok(scripted(
            events,
            self.step_delay,
            cancel,
            Some(ConnectEvent::Cancelled),
            Tail::End,
            None,
        ))
    }

    async fn disconnect_server(&self, server_id: &str) -> Result<(), SourceError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        debug!(target: "conduit::mock", server = %server_id, "disconnect_server");
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable(format!(
                "{server_id} did not answer the disconnect"
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryServerStore {
    records: Mutex<HashMap<String, McpServerRecord>>,
    saves: AtomicUsize,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<McpServerRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    pub fn record(&self, server_id: &str) -> Option<McpServerRecord> {
        self.records.lock().get(server_id).cloned()
    }

    pub fn save_calls(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpServerStore for MemoryServerStore {
    async fn get(&self, server_id: &str) -> Result<Option<McpServerRecord>, StoreError> {
        Ok(self.record(server_id))
    }

    async fn list(&self) -> Result<Vec<McpServerRecord>, StoreError> {
        let mut records: Vec<McpServerRecord> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn save(&self, record: McpServerRecord) -> Result<McpServerRecord, StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, server_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().remove(server_id).is_some())
    }
}

// -------- Local models --------

pub struct MockModelPuller {
    scripts: Mutex<HashMap<String, Vec<PullEvent>>>,
    holding: Mutex<HashSet<String>>,
    installed: Arc<Mutex<HashSet<String>>>,
    step_delay: Duration,
    pulls: AtomicUsize,
    cancels: Mutex<Vec<String>>,
}

impl MockModelPuller {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            holding: Mutex::new(HashSet::new()),
            installed: Arc::new(Mutex::new(HashSet::new())),
            step_delay: Duration::ZERO,
            pulls: AtomicUsize::new(0),
            cancels: Mutex::new(Vec::new()),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_installed(self, models: &[&str]) -> Self {
        self.installed
            .lock()
            .extend(models.iter().map(|name| name.to_string()));
        self
    }

    /// Replaces the default `10, 55, 100, success` script for one model.
    pub fn script(&self, model_name: &str, events: Vec<PullEvent>) {
        self.scripts.lock().insert(model_name.to_string(), events);
    }

    /// The download stalls after its script until cancelled.
    pub fn hold(&self, model_name: &str) {
        self.holding.lock().insert(model_name.to_string());
    }

    pub fn default_script() -> Vec<PullEvent> {
        vec![
            PullEvent::progress(10.0, "pulling manifest").with_bytes(100, 1000),
            PullEvent::progress(55.0, "downloading").with_bytes(550, 1000),
            PullEvent::progress(100.0, "verifying digest").with_bytes(1000, 1000),
            PullEvent::success(),
        ]
    }

    pub fn pull_calls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Model names the daemon was asked to stop downloading.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }

    pub fn is_installed(&self, model_name: &str) -> bool {
        self.installed.lock().contains(model_name)
    }
}

impl Default for MockModelPuller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelPuller for MockModelPuller {
    async fn pull_model(
        &self,
        model_name: &str,
        cancel: CancellationToken,
    ) -> Result<PullStream, SourceError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        debug!(target: "conduit::mock", model = %model_name, "pull_model");
        let events = self
            .scripts
            .lock()
            .get(model_name)
            .cloned()
            .unwrap_or_else(Self::default_script);
        let tail = if self.holding.lock().contains(model_name) {
            Tail::Hold
        } else {
            Tail::End
        };
        let succeeds = events
            .iter()
            .any(|event| event.status == PullEvent::SUCCESS && event.error.is_none());
        let on_finish: Option<Box<dyn FnOnce() + Send>> = if succeeds {
            let installed = Arc::clone(&self.installed);
            let name = model_name.to_string();
            Some(Box::new(move || {
                installed.lock().insert(name);
            }))
        } else {
            None
        };
        Ok(scripted(
            events,
            self.step_delay,
            cancel,
            Some(PullEvent::progress(0.0, PullEvent::CANCELLED)),
            tail,
            on_finish,
        ))
    }

    async fn cancel_pull(&self, model_name: &str) -> Result<(), SourceError> {
        debug!(target: "conduit::mock", model = %model_name, "cancel_pull");
        self.cancels.lock().push(model_name.to_string());
        Ok(())
    }

    async fn installed_models(&self) -> Result<Vec<String>, SourceError> {
        let mut models: Vec<String> = self.installed.lock().iter().cloned().collect();
        models.sort();
        Ok(models)
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    models: Mutex<Vec<CredentialModelEntry>>,
    fail_adds: AtomicBool,
    adds: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: Vec<CredentialModelEntry>) -> Self {
        let store = Self::new();
        *store.models.lock() = models;
        store
    }

    pub fn fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    pub fn add_calls(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn contains(&self, provider: &str, name: &str) -> bool {
        self.models
            .lock()
            .iter()
            .any(|entry| entry.provider == provider && entry.name == name)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn models(&self) -> Result<Vec<CredentialModelEntry>, StoreError> {
        Ok(self.models.lock().clone())
    }

    async fn add_model(
        &self,
        entry: CredentialModelEntry,
    ) -> Result<CredentialModelEntry, StoreError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("credential service offline".into()));
        }
        let mut models = self.models.lock();
        if models.iter().any(|existing| existing.name == entry.name) {
            return Err(StoreError::Conflict(format!("model {} exists", entry.name)));
        }
        models.push(entry.clone());
        Ok(entry)
    }
}

// -------- Document indexing --------

pub struct MockIndexer {
    chunks: u32,
    fail_on: Mutex<HashSet<String>>,
    hold_at: Mutex<HashMap<String, u32>>,
    step_delay: Duration,
    calls: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    documents: Arc<Mutex<Vec<RagDocument>>>,
}

impl MockIndexer {
    pub fn new(chunks: u32) -> Self {
        Self {
            chunks: chunks.max(1),
            fail_on: Mutex::new(HashSet::new()),
            hold_at: Mutex::new(HashMap::new()),
            step_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            documents: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Jobs for `file_name` fail halfway through.
    pub fn fail_on(&self, file_name: &str) {
        self.fail_on.lock().insert(file_name.to_string());
    }

    /// Jobs for `file_name` stall after `chunk` chunks until cancelled.
    pub fn hold_at(&self, file_name: &str, chunk: u32) {
        self.hold_at.lock().insert(file_name.to_string(), chunk);
    }

    /// File names in the order the indexer was asked to process them.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Highest number of jobs that were running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn documents(&self) -> Vec<RagDocument> {
        self.documents.lock().clone()
    }

    fn progress(&self, chunk: u32) -> IndexEvent {
        IndexEvent::Progress {
            progress: f64::from(chunk) * 100.0 / f64::from(self.chunks),
            message: format!("embedded chunk {chunk}/{}", self.chunks),
            current_chunk: chunk,
            total_chunks: self.chunks,
        }
    }
}

impl Default for MockIndexer {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Decrements the running-job count when the producer is done with a job.
struct ActiveJob(Arc<AtomicUsize>);

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentIndexer for MockIndexer {
    async fn index_document(
        &self,
        params: IndexParams,
        cancel: CancellationToken,
    ) -> Result<IndexStream, SourceError> {
        let file_name = params.file_name.clone();
        debug!(target: "conduit::mock", file = %file_name, "index_document");
        self.calls.lock().push(file_name.clone());

        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);
        let guard = ActiveJob(Arc::clone(&self.active));

        let document_id = params
            .document_id
            .clone()
            .unwrap_or_else(|| format!("doc-{file_name}"));
        let hold = self.hold_at.lock().get(&file_name).copied();
        let fails = self.fail_on.lock().contains(&file_name);

        let (events, tail, on_finish): (Vec<IndexEvent>, Tail, Option<Box<dyn FnOnce() + Send>>) =
            if let Some(chunk) = hold {
                let events = (1..=chunk.min(self.chunks)).map(|c| self.progress(c)).collect();
                (events, Tail::Hold, None)
            } else if fails {
                let half = (self.chunks / 2).max(1);
                let mut events: Vec<IndexEvent> = (1..=half).map(|c| self.progress(c)).collect();
                events.push(IndexEvent::Failed {
                    message: format!("embedding service rejected {file_name}"),
                });
                (events, Tail::End, None)
            } else {
                let mut events: Vec<IndexEvent> =
                    (1..=self.chunks).map(|c| self.progress(c)).collect();
                events.push(IndexEvent::Completed {
                    document_id: document_id.clone(),
                    total_chunks: self.chunks,
                    message: String::new(),
                });
                let documents = Arc::clone(&self.documents);
                let document = RagDocument {
                    document_id,
                    file_name: file_name.clone(),
                    total_chunks: self.chunks,
                };
                let finish: Box<dyn FnOnce() + Send> = Box::new(move || {
                    documents.lock().push(document);
                });
                (events, Tail::End, Some(finish))
            };

        let stream = scripted(
            events,
            self.step_delay,
            cancel,
            Some(IndexEvent::Cancelled {
                message: format!("indexing of {file_name} cancelled"),
            }),
            tail,
            on_finish,
        );
        // Job counts as running until its stream is dropped.
        Ok(stream
            .map(Some)
            .chain(futures_util::stream::once(async move {
                drop(guard);
                None
            }))
            .filter_map(futures_util::future::ready)
            .boxed())
    }
}
