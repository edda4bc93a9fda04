use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use conduit_protocol::{
    EventPayload, FailureKind, OperationKey, OperationOutcome, OperationSnapshot, OperationState,
    OutcomeStatus, ProgressEvent,
};

const DEFAULT_FAILURE_MESSAGE: &str = "operation failed";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("operation {key} already reached terminal state `{state}`")]
    Terminal { key: OperationKey, state: OperationState },
    #[error("operation {key} has not been started")]
    NotStarted { key: OperationKey },
    #[error("`{event}` is not supported for {kind} operations")]
    Unsupported { kind: String, event: &'static str },
}

/// One operation's lifecycle state machine.
///
/// `Idle -> Starting -> Running <-> Paused -> {Completed | Failed | Cancelled}`.
/// Terminal states are final; a restart needs a fresh `Operation`.
#[derive(Debug)]
pub struct Operation {
    key: OperationKey,
    state: OperationState,
    percent: f64,
    message: String,
    payload: Option<EventPayload>,
    failure: Option<FailureKind>,
    cancel_requested: bool,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    clock: Instant,
    history: VecDeque<ProgressEvent>,
    history_limit: usize,
}

impl Operation {
    pub fn new(key: OperationKey, history_limit: usize) -> Self {
        let now = Utc::now();
        Self {
            key,
            state: OperationState::Idle,
            percent: 0.0,
            message: String::new(),
            payload: None,
            failure: None,
            cancel_requested: false,
            started_at: now,
            updated_at: now,
            clock: Instant::now(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `Idle -> Starting`.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        match self.state {
            OperationState::Idle => {
                let now = Utc::now();
                self.state = OperationState::Starting;
                self.started_at = now;
                self.updated_at = now;
                self.clock = Instant::now();
                Ok(())
            }
            state if state.is_terminal() => Err(TransitionError::Terminal {
                key: self.key.clone(),
                state,
            }),
            // Already started; nothing to do.
            _ => Ok(()),
        }
    }

    pub fn mark_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Folds one source event into the machine and returns the new state.
    pub fn apply(&mut self, event: &ProgressEvent) -> Result<OperationState, TransitionError> {
        self.apply_inner(event, None)
    }

    /// Applies a controller-synthesized failure (timeout, lost stream).
    pub fn fail(
        &mut self,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Result<ProgressEvent, TransitionError> {
        let event = ProgressEvent::failed(message);
        self.apply_inner(&event, Some(kind))?;
        Ok(event)
    }

    fn apply_inner(
        &mut self,
        event: &ProgressEvent,
        failure: Option<FailureKind>,
    ) -> Result<OperationState, TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal {
                key: self.key.clone(),
                state: self.state,
            });
        }
        if self.state == OperationState::Idle {
            return Err(TransitionError::NotStarted {
                key: self.key.clone(),
            });
        }

        let next = match event {
            ProgressEvent::Started { message } => {
                // A source may announce several phases; each one restarts the bar.
                if self.state != OperationState::Starting {
                    self.percent = 0.0;
                }
                self.set_message(message);
                if self.state == OperationState::Starting {
                    OperationState::Starting
                } else {
                    OperationState::Running
                }
            }
            ProgressEvent::Progress {
                percent,
                message,
                payload,
            } => {
                self.advance_percent(*percent);
                self.set_message(message);
                if payload.is_some() {
                    self.payload = payload.clone();
                }
                OperationState::Running
            }
            ProgressEvent::Paused { message } => {
                if !self.key.kind.supports_pause() {
                    return Err(TransitionError::Unsupported {
                        kind: self.key.kind.to_string(),
                        event: event.name(),
                    });
                }
                self.set_message(message);
                OperationState::Paused
            }
            ProgressEvent::Completed { message, payload } => {
                self.percent = 100.0;
                self.set_message(message);
                if payload.is_some() {
                    self.payload = payload.clone();
                }
                OperationState::Completed
            }
            ProgressEvent::Failed { message } => {
                self.message = if message.trim().is_empty() {
                    DEFAULT_FAILURE_MESSAGE.to_string()
                } else {
                    message.clone()
                };
                self.failure = Some(failure.unwrap_or(FailureKind::Transport));
                OperationState::Failed
            }
            ProgressEvent::Cancelled { message } => {
                self.set_message(message);
                OperationState::Cancelled
            }
        };

        self.state = next;
        self.updated_at = Utc::now();
        self.record(event.clone());
        Ok(next)
    }

    fn advance_percent(&mut self, percent: f64) {
        if !percent.is_finite() {
            return;
        }
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > self.percent {
            self.percent = clamped;
        }
    }

    fn set_message(&mut self, message: &str) {
        if !message.is_empty() {
            self.message = message.to_string();
        }
    }

    fn record(&mut self, event: ProgressEvent) {
        if self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    pub fn history(&self) -> Vec<ProgressEvent> {
        self.history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            key: self.key.clone(),
            state: self.state,
            percent: self.percent,
            message: self.message.clone(),
            payload: self.payload.clone(),
            failure: self.failure,
            cancel_requested: self.cancel_requested,
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }

    /// The terminal outcome, once one has been reached.
    pub fn outcome(&self) -> Option<OperationOutcome> {
        let status = OutcomeStatus::from_state(self.state)?;
        Some(OperationOutcome {
            key: self.key.clone(),
            status,
            message: self.message.clone(),
            payload: self.payload.clone(),
            failure: self.failure,
            reconcile_error: None,
            elapsed_ms: self.clock.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_protocol::OperationKind;
    use proptest::prelude::*;

    fn started(kind: OperationKind) -> Operation {
        let mut op = Operation::new(OperationKey::new(kind, "res"), 16);
        op.begin().expect("begin");
        op
    }

    #[test]
    fn happy_path_walks_every_state() {
        let mut op = started(OperationKind::IndexDoc);
        assert_eq!(op.state(), OperationState::Starting);

        assert_eq!(
            op.apply(&ProgressEvent::started("queued")).unwrap(),
            OperationState::Starting
        );
        assert_eq!(
            op.apply(&ProgressEvent::progress(40.0, "chunk 4/10")).unwrap(),
            OperationState::Running
        );
        assert_eq!(
            op.apply(&ProgressEvent::paused("waiting")).unwrap(),
            OperationState::Paused
        );
        assert_eq!(
            op.apply(&ProgressEvent::progress(50.0, "chunk 5/10")).unwrap(),
            OperationState::Running
        );
        assert_eq!(
            op.apply(&ProgressEvent::completed("done")).unwrap(),
            OperationState::Completed
        );
        assert_eq!(op.percent(), 100.0);
        let outcome = op.outcome().expect("terminal outcome");
        assert!(outcome.is_completed());
        assert_eq!(outcome.message, "done");
        assert_eq!(op.history().len(), 5);
    }

    #[test]
    fn apply_before_begin_is_rejected() {
        let mut op = Operation::new(OperationKey::model_pull("m"), 4);
        let err = op.apply(&ProgressEvent::progress(1.0, "")).unwrap_err();
        assert!(matches!(err, TransitionError::NotStarted { .. }));
    }

    #[test]
    fn pause_is_rejected_for_kinds_without_pause() {
        let mut op = started(OperationKind::ModelPull);
        let err = op.apply(&ProgressEvent::paused("hold")).unwrap_err();
        assert!(matches!(err, TransitionError::Unsupported { .. }));
        assert_eq!(op.state(), OperationState::Starting);
    }

    #[test]
    fn failure_without_message_gets_default_text() {
        let mut op = started(OperationKind::McpConnect);
        op.apply(&ProgressEvent::failed("  ")).unwrap();
        let outcome = op.outcome().unwrap();
        assert_eq!(outcome.message, DEFAULT_FAILURE_MESSAGE);
        assert_eq!(outcome.failure, Some(FailureKind::Transport));
    }

    #[test]
    fn synthesized_failure_keeps_its_kind() {
        let mut op = started(OperationKind::IndexDoc);
        op.fail(FailureKind::Timeout, "timeout").unwrap();
        assert_eq!(op.snapshot().failure, Some(FailureKind::Timeout));
    }

    #[test]
    fn percent_is_clamped_and_monotonic() {
        let mut op = started(OperationKind::ModelPull);
        op.apply(&ProgressEvent::progress(55.0, "")).unwrap();
        op.apply(&ProgressEvent::progress(10.0, "")).unwrap();
        assert_eq!(op.percent(), 55.0);
        op.apply(&ProgressEvent::progress(250.0, "")).unwrap();
        assert_eq!(op.percent(), 100.0);
        op.apply(&ProgressEvent::progress(f64::NAN, "")).unwrap();
        assert_eq!(op.percent(), 100.0);
    }

    #[test]
    fn new_phase_resets_progress() {
        let mut op = started(OperationKind::ModelPull);
        op.apply(&ProgressEvent::progress(80.0, "layer 1")).unwrap();
        op.apply(&ProgressEvent::started("layer 2")).unwrap();
        assert_eq!(op.percent(), 0.0);
        assert_eq!(op.state(), OperationState::Running);
    }

    #[test]
    fn history_is_bounded() {
        let mut op = Operation::new(OperationKey::index_doc("d"), 2);
        op.begin().unwrap();
        for pct in [10.0, 20.0, 30.0] {
            op.apply(&ProgressEvent::progress(pct, format!("{pct}"))).unwrap();
        }
        let history = op.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].percent(), Some(20.0));
    }

    fn arb_event() -> impl Strategy<Value = ProgressEvent> {
        prop_oneof![
            Just(ProgressEvent::started("s")),
            (0.0f64..120.0).prop_map(|p| ProgressEvent::progress(p, "p")),
            Just(ProgressEvent::paused("z")),
            Just(ProgressEvent::completed("c")),
            Just(ProgressEvent::failed("f")),
            Just(ProgressEvent::cancelled("x")),
        ]
    }

    proptest! {
        #[test]
        fn nothing_leaves_a_terminal_state(events in proptest::collection::vec(arb_event(), 1..40)) {
            let mut op = started(OperationKind::IndexDoc);
            let mut terminal: Option<OperationState> = None;
            for event in &events {
                let result = op.apply(event);
                if let Some(state) = terminal {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(op.state(), state);
                } else if let Ok(state) = result {
                    if state.is_terminal() {
                        terminal = Some(state);
                    }
                }
                prop_assert!(op.percent() >= 0.0 && op.percent() <= 100.0);
            }
        }
    }
}
