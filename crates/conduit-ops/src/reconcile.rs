use async_trait::async_trait;
use conduit_protocol::OperationOutcome;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("reconcile failed: {0}")]
pub struct ReconcileError(pub String);

impl ReconcileError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Side effect applied once an operation reaches a terminal state.
///
/// Runs on the operation's own driver after the terminal event has been
/// delivered and before the key is released, so `is_active` still reports
/// the key as active while it runs.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, outcome: &OperationOutcome) -> Result<(), ReconcileError>;
}
