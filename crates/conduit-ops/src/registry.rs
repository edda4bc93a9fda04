use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit_events::Bus;
use conduit_protocol::{
    FailureKind, OperationKey, OperationOutcome, OperationSnapshot, OperationUpdate,
    ProgressEvent,
};
use conduit_topics as topics;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handle::OperationHandle;
use crate::listeners::{ListenerGuard, ListenerSet};
use crate::machine::{Operation, TransitionError};
use crate::reconcile::Reconciler;
use crate::source::{OperationSource, SourceError};

const TIMEOUT_MESSAGE: &str = "timeout";
const CONNECTION_LOST_MESSAGE: &str = "connection lost";

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Events retained per operation for views that attach late.
    pub history_limit: usize,
    /// Buffered updates per subscriber before it starts lagging.
    pub channel_capacity: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            history_limit: 256,
            channel_capacity: 64,
        }
    }
}

#[derive(Clone, Default)]
pub struct StartOptions {
    pub deadline: Option<Duration>,
    pub reconciler: Option<Arc<dyn Reconciler>>,
}

impl StartOptions {
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("{0} is already in progress")]
    Duplicate(OperationKey),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

struct Entry {
    key: OperationKey,
    operation: Mutex<Operation>,
    source: Arc<dyn OperationSource>,
    cancel: CancellationToken,
    cancel_requested: AtomicBool,
    abort_sent: AtomicBool,
    seq: AtomicU64,
    updates: broadcast::Sender<OperationUpdate>,
    done: watch::Receiver<Option<OperationOutcome>>,
    listeners: Arc<ListenerSet>,
}

/// Process-wide map of in-flight operations, at most one per key.
///
/// Each started operation gets its own driver task which is the only writer
/// of that operation's state. The key map is touched by `start`, `cancel`
/// and the driver's release step, each under the map lock.
pub struct OperationRegistry {
    entries: Mutex<HashMap<OperationKey, Arc<Entry>>>,
    bus: Bus,
    options: RegistryOptions,
}

impl OperationRegistry {
    pub fn new(bus: Bus) -> Arc<Self> {
        Self::with_options(bus, RegistryOptions::default())
    }

    pub fn with_options(bus: Bus, options: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            bus,
            options,
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn is_active(&self, key: &OperationKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &OperationKey) -> Option<Arc<Entry>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn snapshot(&self, key: &OperationKey) -> Option<OperationSnapshot> {
        let entry = self.entry(key)?;
        let snapshot = entry.operation.lock().snapshot();
        Some(snapshot)
    }

    /// Retained events for `key`, oldest first.
    pub fn history(&self, key: &OperationKey) -> Option<Vec<ProgressEvent>> {
        let entry = self.entry(key)?;
        let history = entry.operation.lock().history();
        Some(history)
    }

    /// Snapshots of every in-flight operation, oldest start first.
    pub fn active(&self) -> Vec<OperationSnapshot> {
        let entries: Vec<Arc<Entry>> = self.entries.lock().values().cloned().collect();
        let mut snapshots: Vec<OperationSnapshot> = entries
            .iter()
            .map(|entry| entry.operation.lock().snapshot())
            .collect();
        snapshots.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        snapshots
    }

    /// Starts an operation for `key` unless one is already in flight.
    ///
    /// Returns once the source produced its first event (or the operation
    /// ended without one). The handle's update stream starts before that
    /// first event, so it observes every transition.
    pub async fn start(
        self: &Arc<Self>,
        key: OperationKey,
        source: Arc<dyn OperationSource>,
        options: StartOptions,
    ) -> Result<OperationHandle, StartError> {
        let mut operation = Operation::new(key.clone(), self.options.history_limit);
        operation.begin()?;
        let (updates, _) = broadcast::channel(self.options.channel_capacity.max(1));
        let (done_tx, done_rx) = watch::channel(None);
        let entry = Arc::new(Entry {
            key: key.clone(),
            operation: Mutex::new(operation),
            source,
            cancel: CancellationToken::new(),
            cancel_requested: AtomicBool::new(false),
            abort_sent: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            updates,
            done: done_rx.clone(),
            listeners: Arc::new(ListenerSet::default()),
        });

        let updates_rx = {
            let mut entries = self.entries.lock();
            if entries.contains_key(&key) {
                drop(entries);
                info!(
                    target: "conduit::ops",
                    key = %key,
                    "start rejected: operation already in progress"
                );
                self.bus.publish(
                    topics::TOPIC_OPERATIONS_REJECTED,
                    &json!({"key": key, "reason": "duplicate"}),
                );
                return Err(StartError::Duplicate(key));
            }
            entries.insert(key.clone(), Arc::clone(&entry));
            entry.updates.subscribe()
        };

        info!(
            target: "conduit::ops",
            key = %key,
            deadline_ms = options.deadline.map(|d| d.as_millis() as u64),
            "operation started"
        );
        let initial = entry.operation.lock().snapshot();
        self.bus.publish(topics::TOPIC_OPERATIONS_STARTED, &initial);

        let (first_tx, first_rx) = oneshot::channel();
        let registry = Arc::clone(self);
        let driver_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            registry
                .drive(driver_entry, options, done_tx, first_tx)
                .await;
        });

        let snapshot = match first_rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => entry.operation.lock().snapshot(),
        };
        let history = entry.operation.lock().history();
        Ok(OperationHandle::new(snapshot, history, updates_rx, done_rx))
    }

    /// Attaches to an in-flight operation; updates start after the returned
    /// snapshot.
    pub fn subscribe(&self, key: &OperationKey) -> Option<OperationHandle> {
        let entry = self.entry(key)?;
        let op = entry.operation.lock();
        let updates = entry.updates.subscribe();
        Some(OperationHandle::new(
            op.snapshot(),
            op.history(),
            updates,
            entry.done.clone(),
        ))
    }

    /// Registers a callback invoked synchronously for each transition.
    pub fn listen<F>(&self, key: &OperationKey, listener: F) -> Option<ListenerGuard>
    where
        F: Fn(&OperationUpdate) + Send + Sync + 'static,
    {
        let entry = self.entry(key)?;
        let id = entry.listeners.add(Arc::new(listener));
        Some(ListenerGuard::new(id, &entry.listeners))
    }

    /// Requests cancellation. The operation stays registered until its source
    /// acknowledges, so repeated calls are no-ops. Returns `false` when no
    /// operation is in flight for `key`.
    pub fn cancel(&self, key: &OperationKey) -> bool {
        let Some(entry) = self.entry(key) else {
            debug!(target: "conduit::ops", key = %key, "cancel ignored: not active");
            return false;
        };
        if entry.cancel_requested.swap(true, Ordering::SeqCst) {
            debug!(target: "conduit::ops", key = %key, "cancel already requested");
            return true;
        }
        entry.operation.lock().mark_cancel_requested();
        info!(target: "conduit::ops", key = %key, "cancellation requested");
        self.bus.publish(
            topics::TOPIC_OPERATIONS_CANCEL_REQUESTED,
            &json!({"key": key}),
        );
        self.request_abort(&entry);
        true
    }

    /// Requests cancellation of everything in flight; returns how many
    /// operations were asked to stop.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<OperationKey> = self.entries.lock().keys().cloned().collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    fn request_abort(&self, entry: &Arc<Entry>) {
        entry.cancel.cancel();
        if entry.abort_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let source = Arc::clone(&entry.source);
        let key = entry.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(err) = source.abort().await {
                        warn!(
                            target: "conduit::ops",
                            key = %key,
                            error = %err,
                            "best-effort abort failed"
                        );
                    }
                });
            }
            Err(_) => warn!(
                target: "conduit::ops",
                key = %key,
                "no async runtime; remote abort skipped"
            ),
        }
    }

    async fn drive(
        self: Arc<Self>,
        entry: Arc<Entry>,
        options: StartOptions,
        done_tx: watch::Sender<Option<OperationOutcome>>,
        first_tx: oneshot::Sender<OperationSnapshot>,
    ) {
        let mut first_tx = Some(first_tx);
        let deadline = options.deadline.map(|d| Instant::now() + d);
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        let opened = tokio::select! {
            biased;
            _ = &mut timer => None,
            opened = entry.source.open(entry.cancel.clone()) => Some(opened),
        };

        let mut stream = match opened {
            Some(Ok(stream)) => Some(stream),
            Some(Err(SourceError::Cancelled)) => {
                self.deliver(
                    &entry,
                    ProgressEvent::cancelled("cancelled before start"),
                    None,
                    &mut first_tx,
                );
                None
            }
            Some(Err(err)) => {
                self.deliver(
                    &entry,
                    ProgressEvent::failed(err.to_string()),
                    Some(FailureKind::Transport),
                    &mut first_tx,
                );
                None
            }
            None => {
                self.time_out(&entry, &mut first_tx);
                None
            }
        };

        if let Some(events) = stream.as_mut() {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut timer => {
                        self.time_out(&entry, &mut first_tx);
                        break;
                    }
                    next = events.next() => match next {
                        Some(event) => {
                            if self.deliver(&entry, event, None, &mut first_tx) {
                                break;
                            }
                        }
                        None => {
                            // Stream ended without a terminal event.
                            if entry.cancel_requested.load(Ordering::SeqCst) {
                                self.deliver(
                                    &entry,
                                    ProgressEvent::cancelled("cancelled"),
                                    None,
                                    &mut first_tx,
                                );
                            } else {
                                self.deliver(
                                    &entry,
                                    ProgressEvent::failed(CONNECTION_LOST_MESSAGE),
                                    Some(FailureKind::ConnectionLost),
                                    &mut first_tx,
                                );
                            }
                            break;
                        }
                    }
                }
            }
        }
        drop(stream);

        let outcome = entry.operation.lock().outcome();
        let Some(mut outcome) = outcome else {
            warn!(
                target: "conduit::ops",
                key = %entry.key,
                "driver finished without a terminal state"
            );
            self.release(&entry);
            return;
        };

        if let Some(reconciler) = options.reconciler.as_ref() {
            let result = AssertUnwindSafe(reconciler.reconcile(&outcome))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => debug!(
                    target: "conduit::ops",
                    key = %entry.key,
                    status = outcome.status.as_str(),
                    "reconciled"
                ),
                Ok(Err(err)) => {
                    warn!(
                        target: "conduit::ops",
                        key = %entry.key,
                        error = %err,
                        "reconcile failed"
                    );
                    outcome.reconcile_error = Some(err.to_string());
                }
                Err(_) => {
                    warn!(
                        target: "conduit::ops",
                        key = %entry.key,
                        "reconciler panicked"
                    );
                    outcome.reconcile_error = Some("reconciler panicked".to_string());
                }
            }
        }

        self.release(&entry);
        info!(
            target: "conduit::ops",
            key = %entry.key,
            status = outcome.status.as_str(),
            elapsed_ms = outcome.elapsed_ms,
            "operation finished"
        );
        self.bus
            .publish(topics::terminal_topic(outcome.status.as_str()), &outcome);
        done_tx.send_replace(Some(outcome));
    }

    fn time_out(&self, entry: &Arc<Entry>, first_tx: &mut Option<oneshot::Sender<OperationSnapshot>>) {
        warn!(target: "conduit::ops", key = %entry.key, "operation deadline elapsed");
        self.deliver(
            entry,
            ProgressEvent::failed(TIMEOUT_MESSAGE),
            Some(FailureKind::Timeout),
            first_tx,
        );
        self.request_abort(entry);
    }

    /// Applies one event and fans it out. Returns `true` once terminal.
    fn deliver(
        &self,
        entry: &Entry,
        event: ProgressEvent,
        failure: Option<FailureKind>,
        first_tx: &mut Option<oneshot::Sender<OperationSnapshot>>,
    ) -> bool {
        let update = {
            let mut op = entry.operation.lock();
            let applied = match failure {
                Some(kind) => op
                    .fail(kind, event.message().to_string())
                    .map(|_| op.state()),
                None => op.apply(&event),
            };
            if let Err(err) = applied {
                warn!(
                    target: "conduit::ops",
                    key = %entry.key,
                    event = event.name(),
                    error = %err,
                    "event dropped"
                );
                return false;
            }
            let update = OperationUpdate {
                seq: entry.seq.fetch_add(1, Ordering::SeqCst) + 1,
                event,
                snapshot: op.snapshot(),
            };
            // Sent under the lock so `subscribe` never misses or repeats it.
            let _ = entry.updates.send(update.clone());
            update
        };

        debug!(
            target: "conduit::ops",
            key = %entry.key,
            seq = update.seq,
            state = update.snapshot.state.as_str(),
            percent = update.snapshot.percent,
            "transition"
        );
        entry.listeners.notify(&entry.key, &update);
        self.bus.publish(topics::TOPIC_OPERATIONS_PROGRESS, &update);
        if let Some(tx) = first_tx.take() {
            let _ = tx.send(update.snapshot.clone());
        }
        update.snapshot.state.is_terminal()
    }

    fn release(&self, entry: &Arc<Entry>) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&entry.key) {
            if Arc::ptr_eq(existing, entry) {
                entries.remove(&entry.key);
            }
        }
    }
}
