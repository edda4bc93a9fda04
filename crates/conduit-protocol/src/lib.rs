use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, PartialEq, Eq)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub code: Option<String>,
}

impl ProblemDetails {
    pub fn new(code: &str, title: impl Into<String>, status: u16) -> Self {
        Self {
            r#type: format!("about:blank#{code}"),
            title: title.into(),
            status,
            detail: None,
            instance: None,
            code: Some(code.to_string()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

// -------- Operation identity --------

#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    McpConnect,
    ModelPull,
    IndexDoc,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::McpConnect => "mcp-connect",
            OperationKind::ModelPull => "model-pull",
            OperationKind::IndexDoc => "index-doc",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            OperationKind::McpConnect => "Tool server connection",
            OperationKind::ModelPull => "Model pull",
            OperationKind::IndexDoc => "Document indexing",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "mcp-connect" | "mcp" => Some(OperationKind::McpConnect),
            "model-pull" | "pull" => Some(OperationKind::ModelPull),
            "index-doc" | "index" => Some(OperationKind::IndexDoc),
            _ => None,
        }
    }

    /// Only streaming indexers report `paused`.
    pub fn supports_pause(&self) -> bool {
        matches!(self, OperationKind::IndexDoc)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an operation: one kind acting on one resource.
#[derive(
    Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct OperationKey {
    pub kind: OperationKind,
    pub resource_id: String,
}

impl OperationKey {
    pub fn new(kind: OperationKind, resource_id: impl Into<String>) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
        }
    }

    pub fn mcp_connect(server_id: impl Into<String>) -> Self {
        Self::new(OperationKind::McpConnect, server_id)
    }

    pub fn model_pull(model_name: impl Into<String>) -> Self {
        Self::new(OperationKind::ModelPull, model_name)
    }

    pub fn index_doc(document_id: impl Into<String>) -> Self {
        Self::new(OperationKind::IndexDoc, document_id)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.resource_id)
    }
}

// -------- Lifecycle state --------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Idle => "idle",
            OperationState::Starting => "starting",
            OperationState::Running => "running",
            OperationState::Paused => "paused",
            OperationState::Completed => "completed",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            OperationState::Idle => "Idle",
            OperationState::Starting => "Starting",
            OperationState::Running => "Running",
            OperationState::Paused => "Paused",
            OperationState::Completed => "Completed",
            OperationState::Failed => "Failed",
            OperationState::Cancelled => "Cancelled",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "starting" | "start" | "connecting" => OperationState::Starting,
            "running" | "processing" | "progress" => OperationState::Running,
            "paused" => OperationState::Paused,
            "completed" | "complete" | "success" => OperationState::Completed,
            "failed" | "error" => OperationState::Failed,
            "cancelled" | "canceled" => OperationState::Cancelled,
            _ => OperationState::Idle,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }

    /// States backed by a live underlying task.
    pub fn has_task(&self) -> bool {
        matches!(
            self,
            OperationState::Starting | OperationState::Running | OperationState::Paused
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------- Progress protocol --------

/// Kind-specific detail carried alongside progress and completion events.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Connect {
        #[serde(default)]
        protocol_version: Option<String>,
        #[serde(default)]
        tool_count: Option<u32>,
    },
    Pull {
        status: String,
        #[serde(default)]
        completed_bytes: Option<u64>,
        #[serde(default)]
        total_bytes: Option<u64>,
    },
    Index {
        current_chunk: u32,
        total_chunks: u32,
        #[serde(default)]
        document_id: Option<String>,
    },
}

/// Discrete event emitted by an underlying async source.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        #[serde(default)]
        message: String,
    },
    Progress {
        percent: f64,
        #[serde(default)]
        message: String,
        #[serde(default)]
        payload: Option<EventPayload>,
    },
    Paused {
        #[serde(default)]
        message: String,
    },
    Completed {
        #[serde(default)]
        message: String,
        #[serde(default)]
        payload: Option<EventPayload>,
    },
    Failed {
        message: String,
    },
    Cancelled {
        #[serde(default)]
        message: String,
    },
}

impl ProgressEvent {
    pub fn started(message: impl Into<String>) -> Self {
        ProgressEvent::Started {
            message: message.into(),
        }
    }

    pub fn progress(percent: f64, message: impl Into<String>) -> Self {
        ProgressEvent::Progress {
            percent,
            message: message.into(),
            payload: None,
        }
    }

    pub fn paused(message: impl Into<String>) -> Self {
        ProgressEvent::Paused {
            message: message.into(),
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        ProgressEvent::Completed {
            message: message.into(),
            payload: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ProgressEvent::Failed {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        ProgressEvent::Cancelled {
            message: message.into(),
        }
    }

    /// Attaches a payload to `progress` and `completed` events; other
    /// variants are returned unchanged.
    pub fn with_payload(self, payload: EventPayload) -> Self {
        match self {
            ProgressEvent::Progress {
                percent, message, ..
            } => ProgressEvent::Progress {
                percent,
                message,
                payload: Some(payload),
            },
            ProgressEvent::Completed { message, .. } => ProgressEvent::Completed {
                message,
                payload: Some(payload),
            },
            other => other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Started { .. } => "started",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Paused { .. } => "paused",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Failed { .. } => "failed",
            ProgressEvent::Cancelled { .. } => "cancelled",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProgressEvent::Started { message }
            | ProgressEvent::Progress { message, .. }
            | ProgressEvent::Paused { message }
            | ProgressEvent::Completed { message, .. }
            | ProgressEvent::Failed { message }
            | ProgressEvent::Cancelled { message } => message,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self {
            ProgressEvent::Progress { percent, .. } => Some(*percent),
            ProgressEvent::Completed { .. } => Some(100.0),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&EventPayload> {
        match self {
            ProgressEvent::Progress { payload, .. } | ProgressEvent::Completed { payload, .. } => {
                payload.as_ref()
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. }
                | ProgressEvent::Failed { .. }
                | ProgressEvent::Cancelled { .. }
        )
    }
}

// -------- Snapshots and outcomes --------

/// Why a failed operation failed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The source reported `failed`.
    Transport,
    /// No terminal event before the deadline.
    Timeout,
    /// The source ended without a terminal event.
    ConnectionLost,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionLost => "connection_lost",
        }
    }
}

/// Render-ready view of one operation.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OperationSnapshot {
    pub key: OperationKey,
    pub state: OperationState,
    pub percent: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationSnapshot {
    pub fn new(key: OperationKey) -> Self {
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
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One delivered transition, in emission order for its key.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OperationUpdate {
    pub seq: u64,
    pub event: ProgressEvent,
    pub snapshot: OperationSnapshot,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_state(state: OperationState) -> Option<Self> {
        match state {
            OperationState::Completed => Some(OutcomeStatus::Completed),
            OperationState::Failed => Some(OutcomeStatus::Failed),
            OperationState::Cancelled => Some(OutcomeStatus::Cancelled),
            _ => None,
        }
    }
}

/// Terminal result handed to the reconciler and to waiters.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OperationOutcome {
    pub key: OperationKey,
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Set when the terminal side effect could not be applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_error: Option<String>,
    pub elapsed_ms: u64,
}

impl OperationOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == OutcomeStatus::Cancelled
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }
}
