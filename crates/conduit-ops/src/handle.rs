use conduit_protocol::{
    FailureKind, OperationKey, OperationOutcome, OperationSnapshot, OperationUpdate,
    OutcomeStatus, ProgressEvent,
};
use tokio::sync::{broadcast, watch};
use tracing::warn;

/// A view onto one in-flight operation.
///
/// `snapshot` is the state when the handle was created. `next_update`
/// yields every later transition in emission order, and `wait` resolves
/// after the terminal side effect has run and the key was released.
///
/// A reader slower than the registry's channel capacity lags: the oldest
/// buffered transitions are overwritten, `lagged` counts them, and reading
/// resumes at the oldest update still buffered. Every update carries a full
/// snapshot, so the view stays current, and the terminal outcome is always
/// available from `wait`. A view that needs every event should read
/// `OperationRegistry::history` while the key is still active.
pub struct OperationHandle {
    key: OperationKey,
    snapshot: OperationSnapshot,
    history: Vec<ProgressEvent>,
    updates: broadcast::Receiver<OperationUpdate>,
    lagged: u64,
    done: watch::Receiver<Option<OperationOutcome>>,
}

impl OperationHandle {
    pub(crate) fn new(
        snapshot: OperationSnapshot,
        history: Vec<ProgressEvent>,
        updates: broadcast::Receiver<OperationUpdate>,
        done: watch::Receiver<Option<OperationOutcome>>,
    ) -> Self {
        Self {
            key: snapshot.key.clone(),
            snapshot,
            history,
            updates,
            lagged: 0,
            done,
        }
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn snapshot(&self) -> &OperationSnapshot {
        &self.snapshot
    }

    /// Events already applied when the handle was created, oldest first.
    pub fn history(&self) -> &[ProgressEvent] {
        &self.history
    }

    /// Transitions this handle missed because it read too slowly.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Next transition, or `None` once the operation is gone.
    pub async fn next_update(&mut self) -> Option<OperationUpdate> {
        loop {
            match self.updates.recv().await {
                Ok(update) => {
                    self.snapshot = update.snapshot.clone();
                    return Some(update);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.lagged += skipped;
                    warn!(
                        target: "conduit::ops",
                        key = %self.key,
                        skipped,
                        "update receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Terminal outcome if already known, without waiting.
    pub fn outcome(&self) -> Option<OperationOutcome> {
        self.done.borrow().clone()
    }

    pub async fn wait(&self) -> OperationOutcome {
        let mut done = self.done.clone();
        loop {
            let current = done.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if done.changed().await.is_err() {
                return done.borrow().clone().unwrap_or_else(|| OperationOutcome {
                    key: self.key.clone(),
                    status: OutcomeStatus::Failed,
                    message: "operation driver stopped unexpectedly".into(),
                    payload: None,
                    failure: Some(FailureKind::ConnectionLost),
                    reconcile_error: None,
                    elapsed_ms: 0,
                });
            }
        }
    }
}
