use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_events::Bus;
use conduit_ops::{
    EventStream, FailureKind, OperationKey, OperationOutcome, OperationRegistry, OperationSource,
    OperationState, OutcomeStatus, ProgressEvent, ReconcileError, Reconciler, RegistryOptions,
    SourceError, StartError, StartOptions,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Source fed by a test-held channel. With `honor_cancel` it answers the
/// cancellation token with a `cancelled` event, like a well-behaved client.
struct ChannelSource {
    rx: Mutex<Option<mpsc::Receiver<ProgressEvent>>>,
    honor_cancel: bool,
    open_error: Option<SourceError>,
    aborts: AtomicUsize,
}

impl ChannelSource {
    fn new(honor_cancel: bool) -> (mpsc::Sender<ProgressEvent>, Arc<Self>) {
        let (tx, rx) = mpsc::channel(32);
        let source = Arc::new(Self {
            rx: Mutex::new(Some(rx)),
            honor_cancel,
            open_error: None,
            aborts: AtomicUsize::new(0),
        });
        (tx, source)
    }

    fn failing(err: SourceError) -> Arc<Self> {
        Arc::new(Self {
            rx: Mutex::new(None),
            honor_cancel: false,
            open_error: Some(err),
            aborts: AtomicUsize::new(0),
        })
    }

    fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationSource for ChannelSource {
    async fn open(&self, cancel: CancellationToken) -> Result<EventStream, SourceError> {
        if let Some(err) = self.open_error.clone() {
            return Err(err);
        }
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| SourceError::Unavailable("already opened".into()))?;
        let honor = self.honor_cancel;
        let stream = futures_util::stream::unfold(Some((rx, cancel)), move |state| async move {
            let (mut rx, cancel) = state?;
            let next = if honor {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = rx.recv() => Some(next),
                }
            } else {
                Some(rx.recv().await)
            };
            match next {
                None => Some((ProgressEvent::cancelled("stopped"), None)),
                Some(Some(event)) => Some((event, Some((rx, cancel)))),
                Some(None) => None,
            }
        });
        Ok(stream.boxed())
    }

    async fn abort(&self) -> Result<(), SourceError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingReconciler {
    registry: Arc<OperationRegistry>,
    saw_active: AtomicBool,
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn reconcile(&self, outcome: &OperationOutcome) -> Result<(), ReconcileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.saw_active
            .store(self.registry.is_active(&outcome.key), Ordering::SeqCst);
        if self.fail {
            return Err(ReconcileError::new("store offline"));
        }
        Ok(())
    }
}

fn registry() -> Arc<OperationRegistry> {
    OperationRegistry::new(Bus::new_with_replay(64, 64))
}

async fn settle<F: Fn() -> bool>(check: F) {
    for _ in 0..50 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn duplicate_start_is_rejected_while_active() {
    let registry = registry();
    let key = OperationKey::model_pull("llama3");
    let (tx, source) = ChannelSource::new(true);
    tx.send(ProgressEvent::started("pulling")).await.unwrap();

    let handle = registry
        .start(key.clone(), source, StartOptions::default())
        .await
        .expect("first start");
    assert_eq!(handle.snapshot().state, OperationState::Starting);

    let (_tx2, second) = ChannelSource::new(true);
    let err = registry
        .start(key.clone(), second, StartOptions::default())
        .await
        .err()
        .expect("second start must be rejected");
    assert!(matches!(err, StartError::Duplicate(ref rejected) if rejected == &key));
    assert_eq!(registry.len(), 1);
    assert!(!registry
        .bus()
        .replay(Some(conduit_topics::TOPIC_OPERATIONS_REJECTED))
        .is_empty());

    registry.cancel(&key);
    let outcome = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancel settles");
    assert_eq!(outcome.status, OutcomeStatus::Cancelled);
}

#[tokio::test]
async fn updates_arrive_in_order_and_completion_releases_key() {
    let registry = registry();
    let key = OperationKey::index_doc("doc-1");
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("indexing")).await.unwrap();

    let mut handle = registry
        .start(key.clone(), source, StartOptions::default())
        .await
        .expect("start");
    for percent in [10.0, 45.0, 30.0] {
        tx.send(ProgressEvent::progress(percent, "chunk"))
            .await
            .unwrap();
    }
    tx.send(ProgressEvent::completed("indexed")).await.unwrap();

    let mut seen = Vec::new();
    while let Some(update) = handle.next_update().await {
        seen.push((update.seq, update.snapshot.state, update.snapshot.percent));
        if update.snapshot.state.is_terminal() {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            (1, OperationState::Starting, 0.0),
            (2, OperationState::Running, 10.0),
            (3, OperationState::Running, 45.0),
            // progress never moves backwards
            (4, OperationState::Running, 45.0),
            (5, OperationState::Completed, 100.0),
        ]
    );

    let outcome = handle.wait().await;
    assert!(outcome.is_completed());
    assert!(!registry.is_active(&key));

    let (tx, again) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("again")).await.unwrap();
    registry
        .start(key, again, StartOptions::default())
        .await
        .expect("key is free after completion");
}

#[tokio::test]
async fn cancel_is_idempotent_and_aborts_once() {
    let registry = registry();
    let key = OperationKey::model_pull("mistral");
    let (tx, source) = ChannelSource::new(true);
    tx.send(ProgressEvent::started("pulling")).await.unwrap();

    let handle = registry
        .start(key.clone(), source.clone(), StartOptions::default())
        .await
        .expect("start");

    assert!(registry.cancel(&key));
    assert!(registry.cancel(&key));
    let outcome = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancel settles");
    assert_eq!(outcome.status, OutcomeStatus::Cancelled);

    settle(|| source.aborts() > 0).await;
    assert_eq!(source.aborts(), 1);
    assert!(!registry.cancel(&key), "nothing left to cancel");
}

#[tokio::test(start_paused = true)]
async fn deadline_synthesizes_timeout_failure() {
    let registry = registry();
    let key = OperationKey::mcp_connect("srv-1");
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("connecting")).await.unwrap();

    let handle = registry
        .start(
            key.clone(),
            source.clone(),
            StartOptions::default().with_deadline(Some(Duration::from_secs(30))),
        )
        .await
        .expect("start");

    let outcome = handle.wait().await;
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.failure, Some(FailureKind::Timeout));
    assert_eq!(outcome.message, "timeout");
    assert!(!registry.is_active(&key));

    settle(|| source.aborts() > 0).await;
    assert_eq!(source.aborts(), 1);
    drop(tx);
}

#[tokio::test]
async fn stream_end_without_terminal_is_connection_lost() {
    let registry = registry();
    let key = OperationKey::mcp_connect("srv-2");
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("connecting")).await.unwrap();

    let handle = registry
        .start(key, source, StartOptions::default())
        .await
        .expect("start");
    drop(tx);

    let outcome = handle.wait().await;
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.failure, Some(FailureKind::ConnectionLost));
    assert_eq!(outcome.message, "connection lost");
}

#[tokio::test]
async fn stream_end_after_cancel_request_counts_as_cancelled() {
    let registry = registry();
    let key = OperationKey::model_pull("phi");
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("pulling")).await.unwrap();

    let handle = registry
        .start(key.clone(), source, StartOptions::default())
        .await
        .expect("start");
    assert!(registry.cancel(&key));
    assert!(registry.snapshot(&key).expect("active").cancel_requested);
    drop(tx);

    let outcome = handle.wait().await;
    assert_eq!(outcome.status, OutcomeStatus::Cancelled);
}

#[tokio::test]
async fn completion_after_cancel_request_still_completes() {
    let registry = registry();
    let key = OperationKey::index_doc("doc-race");
    let recorder = Arc::new(RecordingReconciler {
        registry: registry.clone(),
        saw_active: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
        fail: false,
    });
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("indexing")).await.unwrap();

    let handle = registry
        .start(
            key.clone(),
            source,
            StartOptions::default().with_reconciler(recorder.clone()),
        )
        .await
        .expect("start");
    assert!(registry.cancel(&key));
    let snapshot = registry.snapshot(&key).expect("still active");
    assert_eq!(snapshot.state, OperationState::Starting);
    assert!(snapshot.cancel_requested);

    // the source finished before it saw the cancellation
    tx.send(ProgressEvent::completed("indexed")).await.unwrap();

    let outcome = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("settles");
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    assert!(!registry.is_active(&key));
}

#[tokio::test]
async fn slow_reader_counts_lagged_updates_and_still_sees_the_end() {
    let registry = OperationRegistry::with_options(
        Bus::new_with_replay(64, 64),
        RegistryOptions {
            channel_capacity: 1,
            ..RegistryOptions::default()
        },
    );
    let key = OperationKey::model_pull("tinyllama");
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("pulling")).await.unwrap();

    let mut handle = registry
        .start(key, source, StartOptions::default())
        .await
        .expect("start");
    for percent in [20.0, 40.0, 60.0] {
        tx.send(ProgressEvent::progress(percent, "layer"))
            .await
            .unwrap();
    }
    tx.send(ProgressEvent::completed("pulled")).await.unwrap();
    let outcome = timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("settles");
    assert!(outcome.is_completed());
    assert_eq!(handle.lagged(), 0);

    let update = handle.next_update().await.expect("newest update kept");
    assert_eq!(update.snapshot.state, OperationState::Completed);
    assert!(handle.lagged() >= 1);
    assert_eq!(handle.snapshot().state, OperationState::Completed);
}

#[tokio::test]
async fn open_failure_becomes_failed_outcome() {
    let registry = registry();
    let key = OperationKey::model_pull("ghost");
    let source = ChannelSource::failing(SourceError::Unavailable("daemon down".into()));

    let handle = registry
        .start(key.clone(), source, StartOptions::default())
        .await
        .expect("start resolves with a handle");
    assert_eq!(handle.snapshot().state, OperationState::Failed);

    let outcome = handle.wait().await;
    assert_eq!(outcome.failure, Some(FailureKind::Transport));
    assert!(outcome.message.contains("daemon down"));
    assert!(!registry.is_active(&key));
}

#[tokio::test]
async fn reconciler_runs_before_key_is_released() {
    let registry = registry();
    let key = OperationKey::index_doc("doc-2");
    let recorder = Arc::new(RecordingReconciler {
        registry: registry.clone(),
        saw_active: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
        fail: false,
    });
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("indexing")).await.unwrap();
    tx.send(ProgressEvent::completed("done")).await.unwrap();

    let handle = registry
        .start(
            key.clone(),
            source,
            StartOptions::default().with_reconciler(recorder.clone()),
        )
        .await
        .expect("start");
    let outcome = handle.wait().await;

    assert!(outcome.is_completed());
    assert_eq!(outcome.reconcile_error, None);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    assert!(recorder.saw_active.load(Ordering::SeqCst));
    assert!(!registry.is_active(&key));
}

#[tokio::test]
async fn reconcile_failure_is_reported_on_outcome() {
    let registry = registry();
    let recorder = Arc::new(RecordingReconciler {
        registry: registry.clone(),
        saw_active: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
        fail: true,
    });
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::completed("done")).await.unwrap();

    let handle = registry
        .start(
            OperationKey::model_pull("qwen"),
            source,
            StartOptions::default().with_reconciler(recorder),
        )
        .await
        .expect("start");
    let outcome = handle.wait().await;
    assert!(outcome.is_completed());
    assert!(outcome
        .reconcile_error
        .as_deref()
        .is_some_and(|err| err.contains("store offline")));
}

#[tokio::test]
async fn panicking_listener_does_not_stall_operation() {
    let registry = registry();
    let key = OperationKey::index_doc("doc-3");
    let (tx, source) = ChannelSource::new(false);
    tx.send(ProgressEvent::started("indexing")).await.unwrap();

    let handle = registry
        .start(key.clone(), source, StartOptions::default())
        .await
        .expect("start");

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();
    let _bad = registry
        .listen(&key, |_| panic!("view crashed"))
        .expect("active");
    let _good = registry
        .listen(&key, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        })
        .expect("active");

    tx.send(ProgressEvent::progress(50.0, "half")).await.unwrap();
    tx.send(ProgressEvent::completed("done")).await.unwrap();

    let outcome = handle.wait().await;
    assert!(outcome.is_completed());
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn late_subscriber_sees_snapshot_and_history() {
    let registry = registry();
    let key = OperationKey::model_pull("gemma");
    let (tx, source) = ChannelSource::new(true);
    tx.send(ProgressEvent::started("pulling")).await.unwrap();

    let _handle = registry
        .start(key.clone(), source, StartOptions::default())
        .await
        .expect("start");
    tx.send(ProgressEvent::progress(20.0, "layers")).await.unwrap();
    settle(|| {
        registry
            .snapshot(&key)
            .is_some_and(|snapshot| snapshot.percent >= 20.0)
    })
    .await;

    let mut late = registry.subscribe(&key).expect("active");
    assert_eq!(late.snapshot().percent, 20.0);
    assert_eq!(late.history().len(), 2);

    tx.send(ProgressEvent::progress(60.0, "layers")).await.unwrap();
    let update = late.next_update().await.expect("next update");
    assert_eq!(update.snapshot.percent, 60.0);

    assert_eq!(registry.cancel_all(), 1);
    let outcome = late.wait().await;
    assert!(outcome.is_cancelled());
    assert!(registry.active().is_empty());
}

#[tokio::test]
async fn active_lists_operations_oldest_first() {
    let registry = registry();
    let mut senders = Vec::new();
    for name in ["a", "b", "c"] {
        let (tx, source) = ChannelSource::new(true);
        tx.send(ProgressEvent::started(name)).await.unwrap();
        registry
            .start(OperationKey::model_pull(name), source, StartOptions::default())
            .await
            .expect("start");
        senders.push(tx);
    }
    let ids: Vec<String> = registry
        .active()
        .into_iter()
        .map(|snapshot| snapshot.key.resource_id)
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(registry.cancel_all(), 3);
}
