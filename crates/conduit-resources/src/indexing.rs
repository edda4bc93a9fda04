use std::sync::Arc;

use async_trait::async_trait;
use conduit_ops::{
    translate, EventStream, OperationHandle, OperationRegistry, OperationSource, ReconcileError,
    Reconciler, SourceError, StartOptions,
};
use conduit_protocol::{EventPayload, OperationKey, OperationOutcome, OutcomeStatus, ProgressEvent};
use conduit_topics as topics;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ResourceCache, ResourceList};
use crate::collaborators::{DocumentIndexer, IndexEvent, IndexParams, RagDocument};
use crate::error::ControllerError;
use crate::record::{ValidationError, ValidationIssue};
use crate::settings::ControllerSettings;

pub fn index_event_to_progress(event: IndexEvent) -> Option<ProgressEvent> {
    Some(match event {
        IndexEvent::Progress {
            progress,
            message,
            current_chunk,
            total_chunks,
        } => ProgressEvent::progress(progress, message).with_payload(EventPayload::Index {
            current_chunk,
            total_chunks,
            document_id: None,
        }),
        IndexEvent::Completed {
            document_id,
            total_chunks,
            message,
        } => {
            let message = if message.is_empty() {
                format!("indexed {total_chunks} chunks")
            } else {
                message
            };
            ProgressEvent::completed(message).with_payload(EventPayload::Index {
                current_chunk: total_chunks,
                total_chunks,
                document_id: Some(document_id),
            })
        }
        IndexEvent::Failed { message } => ProgressEvent::failed(message),
        IndexEvent::Cancelled { message } => {
            if message.is_empty() {
                ProgressEvent::cancelled("indexing cancelled")
            } else {
                ProgressEvent::cancelled(message)
            }
        }
        IndexEvent::Paused { message } => ProgressEvent::paused(message),
    })
}

fn validate(params: &IndexParams) -> Result<(), ValidationError> {
    let mut issues = Vec::new();
    if params.file_name.trim().is_empty() {
        issues.push(ValidationIssue::new("file_name", "file name is required"));
    }
    if params.content.is_empty() {
        issues.push(ValidationIssue::new("content", "content is empty"));
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(
            format!("document {}", params.file_name),
            issues,
        ))
    }
}

struct IndexSource {
    params: IndexParams,
    indexer: Arc<dyn DocumentIndexer>,
}

#[async_trait]
impl OperationSource for IndexSource {
    async fn open(&self, cancel: CancellationToken) -> Result<EventStream, SourceError> {
        let raw = self
            .indexer
            .index_document(self.params.clone(), cancel)
            .await?;
        let started = ProgressEvent::started(format!("Indexing {}", self.params.file_name));
        Ok(futures_util::stream::once(futures_util::future::ready(started))
            .chain(translate(raw, index_event_to_progress))
            .boxed())
    }
}

/// Refreshes the document list once something was actually persisted.
struct DocumentListReconciler {
    cache: Arc<dyn ResourceCache>,
}

#[async_trait]
impl Reconciler for DocumentListReconciler {
    async fn reconcile(&self, outcome: &OperationOutcome) -> Result<(), ReconcileError> {
        if outcome.is_completed() {
            self.cache.invalidate(ResourceList::Documents);
        } else {
            debug!(
                target: "conduit::index",
                key = %outcome.key,
                status = outcome.status.as_str(),
                "nothing persisted; document list left alone"
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchFailure {
    pub file_name: String,
    pub status: OutcomeStatus,
    pub message: String,
}

/// What happened to each file of a sequential batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: Vec<RagDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<BatchFailure>,
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none() && self.skipped.is_empty()
    }
}

/// The panel's job. A reserved job holds the slot while its start is still
/// waiting for the first event.
struct PanelJob {
    key: OperationKey,
    registered: bool,
    cancel_requested: bool,
}

/// Releases a reservation whose start never produced a handle.
struct Reservation<'a> {
    slot: &'a Mutex<Option<PanelJob>>,
    key: OperationKey,
    committed: bool,
}

impl Reservation<'_> {
    /// Marks the job as registered and reports whether a cancel arrived
    /// while it was reserved.
    fn commit(mut self) -> bool {
        self.committed = true;
        let mut slot = self.slot.lock();
        match slot.as_mut().filter(|job| job.key == self.key) {
            Some(job) => {
                job.registered = true;
                job.cancel_requested
            }
            None => false,
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|job| job.key == self.key) {
            *slot = None;
        }
    }
}

/// A running batch: the key of its first file and its stop token.
type BatchJob = (OperationKey, CancellationToken);

/// Clears the batch slot however the batch ends.
struct BatchSlot<'a>(&'a Mutex<Option<BatchJob>>);

impl Drop for BatchSlot<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Streaming document indexing for one progress panel.
///
/// The machine remembers the panel's current job so `cancel_indexing` and
/// `is_indexing` need no key; the flag clears only after the job's terminal
/// event was observed and reconciled. The slot is taken before the job
/// starts, so concurrent starts and batches cannot both run.
pub struct IndexingMachine {
    registry: Arc<OperationRegistry>,
    indexer: Arc<dyn DocumentIndexer>,
    cache: Arc<dyn ResourceCache>,
    settings: ControllerSettings,
    current: Mutex<Option<PanelJob>>,
    batch: Mutex<Option<BatchJob>>,
}

impl IndexingMachine {
    pub fn new(
        registry: Arc<OperationRegistry>,
        indexer: Arc<dyn DocumentIndexer>,
        cache: Arc<dyn ResourceCache>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry,
            indexer,
            cache,
            settings,
            current: Mutex::new(None),
            batch: Mutex::new(None),
        }
    }

    pub fn key(params: &IndexParams) -> OperationKey {
        let id = params
            .document_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(&params.file_name);
        OperationKey::index_doc(id)
    }

    fn occupant(&self, job: Option<&PanelJob>) -> Option<OperationKey> {
        job.filter(|job| !job.registered || self.registry.is_active(&job.key))
            .map(|job| job.key.clone())
    }

    fn active_key(&self) -> Option<OperationKey> {
        self.occupant(self.current.lock().as_ref())
    }

    fn reserve(&self, key: &OperationKey) -> Result<Reservation<'_>, ControllerError> {
        let mut slot = self.current.lock();
        if let Some(active) = self.occupant(slot.as_ref()) {
            return Err(ControllerError::Duplicate(active));
        }
        *slot = Some(PanelJob {
            key: key.clone(),
            registered: false,
            cancel_requested: false,
        });
        Ok(Reservation {
            slot: &self.current,
            key: key.clone(),
            committed: false,
        })
    }

    pub fn is_indexing(&self) -> bool {
        self.active_key().is_some()
    }

    /// Starts one document. Rejected while another job or a batch holds the
    /// panel.
    pub async fn start_indexing(
        &self,
        params: IndexParams,
    ) -> Result<OperationHandle, ControllerError> {
        validate(&params)?;
        if let Some((key, _)) = self.batch.lock().as_ref() {
            return Err(ControllerError::Duplicate(key.clone()));
        }
        self.start_job(params).await
    }

    async fn start_job(&self, params: IndexParams) -> Result<OperationHandle, ControllerError> {
        let key = Self::key(&params);
        let reservation = self.reserve(&key)?;
        info!(
            target: "conduit::index",
            key = %key,
            file = %params.file_name,
            file_type = %params.file_type,
            source = params.source_type.as_str(),
            "indexing started"
        );
        let options = StartOptions::default()
            .with_deadline(self.settings.index_timeout)
            .with_reconciler(Arc::new(DocumentListReconciler {
                cache: Arc::clone(&self.cache),
            }));
        let source = Arc::new(IndexSource {
            params,
            indexer: Arc::clone(&self.indexer),
        });
        let handle = self.registry.start(key.clone(), source, options).await?;
        if reservation.commit() {
            self.registry.cancel(&key);
        }
        Ok(handle)
    }

    /// Cancels the current job and any queued batch files. The job stays
    /// active until the indexer acknowledges.
    pub fn cancel_indexing(&self) -> bool {
        let batch = self.batch.lock().as_ref().map(|(_, token)| token.clone());
        if let Some(token) = &batch {
            token.cancel();
        }
        let pending = {
            let mut slot = self.current.lock();
            match slot.as_mut() {
                Some(job) if !job.registered => {
                    job.cancel_requested = true;
                    Some((job.key.clone(), true))
                }
                Some(job) => Some((job.key.clone(), false)),
                None => None,
            }
        };
        let cancelled_job = match pending {
            // the start cancels it once registered if the registry has no
            // entry yet
            Some((key, reserved)) => self.registry.cancel(&key) || reserved,
            None => false,
        };
        cancelled_job || batch.is_some()
    }

    /// Indexes `files` one after another. The first file that does not
    /// complete stops the batch; later files are skipped and earlier ones
    /// stay persisted.
    pub async fn index_batch(&self, files: Vec<IndexParams>) -> Result<BatchReport, ControllerError> {
        for params in &files {
            validate(params)?;
        }
        let Some(first) = files.first().map(Self::key) else {
            return Ok(BatchReport::default());
        };
        let token = CancellationToken::new();
        let slot = {
            let mut batch = self.batch.lock();
            let busy = self
                .active_key()
                .or_else(|| batch.as_ref().map(|(key, _)| key.clone()));
            if let Some(key) = busy {
                info!(target: "conduit::index", key = %key, "batch rejected: panel busy");
                return Err(ControllerError::Duplicate(key));
            }
            *batch = Some((first, token.clone()));
            BatchSlot(&self.batch)
        };
        let total = files.len();
        let mut report = BatchReport::default();
        let mut queue = files.into_iter();

        while let Some(params) = queue.next() {
            if token.is_cancelled() {
                report.skipped.push(params.file_name);
                break;
            }
            let file_name = params.file_name.clone();
            let handle = match self.start_job(params).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(
                        target: "conduit::index",
                        file = %file_name,
                        error = %err,
                        "batch file could not start"
                    );
                    report.failed = Some(BatchFailure {
                        file_name,
                        status: OutcomeStatus::Failed,
                        message: err.to_string(),
                    });
                    break;
                }
            };
            let outcome = handle.wait().await;
            if outcome.is_completed() {
                let (document_id, total_chunks) = match &outcome.payload {
                    Some(EventPayload::Index {
                        document_id,
                        total_chunks,
                        ..
                    }) => (
                        document_id
                            .clone()
                            .unwrap_or_else(|| outcome.key.resource_id.clone()),
                        *total_chunks,
                    ),
                    _ => (outcome.key.resource_id.clone(), 0),
                };
                report.completed.push(RagDocument {
                    document_id,
                    file_name,
                    total_chunks,
                });
            } else {
                report.failed = Some(BatchFailure {
                    file_name,
                    status: outcome.status,
                    message: outcome.message,
                });
                break;
            }
        }
        report.skipped.extend(queue.map(|params| params.file_name));
        drop(slot);

        info!(
            target: "conduit::index",
            total,
            completed = report.completed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.is_some(),
            "batch finished"
        );
        self.registry
            .bus()
            .publish(topics::TOPIC_INDEX_BATCH_FINISHED, &report);
        Ok(report)
    }
}
