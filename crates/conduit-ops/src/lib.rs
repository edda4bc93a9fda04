//! Lifecycle control for long-running operations.
//!
//! An [`OperationRegistry`] keeps at most one in-flight operation per
//! [`OperationKey`], drives each one from its [`OperationSource`] through the
//! [`Operation`] state machine, and runs a [`Reconciler`] once it ends.

mod handle;
mod listeners;
mod machine;
mod reconcile;
mod registry;
mod source;

pub use handle::OperationHandle;
pub use listeners::{Listener, ListenerGuard};
pub use machine::{Operation, TransitionError};
pub use reconcile::{ReconcileError, Reconciler};
pub use registry::{OperationRegistry, RegistryOptions, StartError, StartOptions};
pub use source::{channel_stream, stream_of, translate, EventStream, OperationSource, SourceError};

pub use conduit_protocol::{
    EventPayload, FailureKind, OperationKey, OperationKind, OperationOutcome, OperationSnapshot,
    OperationState, OperationUpdate, OutcomeStatus, ProgressEvent,
};
