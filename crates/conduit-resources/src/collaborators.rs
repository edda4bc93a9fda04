//! Contracts for the external services the controller drives.
//!
//! None of these define a wire format; adapters for real services and the
//! scripted doubles in `conduit-mock-adapter` implement them alike.

use async_trait::async_trait;
use conduit_ops::SourceError;
use futures_util::stream::BoxStream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::record::McpServerRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

// -------- Tool servers --------

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectEvent {
    Connecting {
        #[serde(default)]
        message: String,
    },
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<String>,
        #[serde(default)]
        tool_count: u32,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

pub type ConnectStream = BoxStream<'static, ConnectEvent>;

#[async_trait]
pub trait McpServerClient: Send + Sync {
    /// Opens a session for `record`. The stream ends after a terminal event.
    async fn connect_server(
        &self,
        record: &McpServerRecord,
        cancel: CancellationToken,
    ) -> Result<ConnectStream, SourceError>;

    async fn disconnect_server(&self, server_id: &str) -> Result<(), SourceError>;
}

#[async_trait]
pub trait McpServerStore: Send + Sync {
    async fn get(&self, server_id: &str) -> Result<Option<McpServerRecord>, StoreError>;
    async fn list(&self) -> Result<Vec<McpServerRecord>, StoreError>;
    /// Inserts or replaces by id and returns the stored record.
    async fn save(&self, record: McpServerRecord) -> Result<McpServerRecord, StoreError>;
    async fn delete(&self, server_id: &str) -> Result<bool, StoreError>;
}

// -------- Local models --------

/// One status line from the local model daemon.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PullEvent {
    /// Byte-level percent, `0..=100`.
    pub progress: f64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl PullEvent {
    pub const SUCCESS: &'static str = "success";
    pub const CANCELLED: &'static str = "cancelled";

    pub fn progress(progress: f64, status: impl Into<String>) -> Self {
        Self {
            progress,
            status: status.into(),
            error: None,
            completed_bytes: None,
            total_bytes: None,
        }
    }

    pub fn success() -> Self {
        Self::progress(100.0, Self::SUCCESS)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::progress(0.0, "error")
        }
    }

    pub fn with_bytes(mut self, completed: u64, total: u64) -> Self {
        self.completed_bytes = Some(completed);
        self.total_bytes = Some(total);
        self
    }
}

pub type PullStream = BoxStream<'static, PullEvent>;

#[async_trait]
pub trait ModelPuller: Send + Sync {
    async fn pull_model(
        &self,
        model_name: &str,
        cancel: CancellationToken,
    ) -> Result<PullStream, SourceError>;

    /// Stops the daemon-side download, which may outlive the local stream.
    async fn cancel_pull(&self, model_name: &str) -> Result<(), SourceError>;

    async fn installed_models(&self) -> Result<Vec<String>, SourceError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CredentialModelEntry {
    pub provider: String,
    pub name: String,
    pub base_url: String,
}

impl CredentialModelEntry {
    pub const OLLAMA: &'static str = "ollama";

    pub fn ollama(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider: Self::OLLAMA.to_string(),
            name: name.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn models(&self) -> Result<Vec<CredentialModelEntry>, StoreError>;
    /// Persists `entry` and returns the server-confirmed record.
    async fn add_model(
        &self,
        entry: CredentialModelEntry,
    ) -> Result<CredentialModelEntry, StoreError>;
}

// -------- Document indexing --------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Text,
    File,
    Files,
    Url,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Text => "text",
            SourceType::File => "file",
            SourceType::Files => "files",
            SourceType::Url => "url",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct IndexParams {
    pub content: String,
    pub file_name: String,
    pub file_type: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

impl IndexParams {
    pub fn new(
        content: impl Into<String>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            content: content.into(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            source_type,
            document_id: None,
        }
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexEvent {
    Progress {
        progress: f64,
        #[serde(default)]
        message: String,
        current_chunk: u32,
        total_chunks: u32,
    },
    Completed {
        document_id: String,
        total_chunks: u32,
        #[serde(default)]
        message: String,
    },
    Failed {
        message: String,
    },
    Cancelled {
        #[serde(default)]
        message: String,
    },
    Paused {
        #[serde(default)]
        message: String,
    },
}

pub type IndexStream = BoxStream<'static, IndexEvent>;

#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    /// Streams one indexing job. Cancelling `cancel` aborts the transport;
    /// the indexer rolls back partial artifacts itself.
    async fn index_document(
        &self,
        params: IndexParams,
        cancel: CancellationToken,
    ) -> Result<IndexStream, SourceError>;
}

/// Persisted result of a completed indexing job.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RagDocument {
    pub document_id: String,
    pub file_name: String,
    pub total_chunks: u32,
}
