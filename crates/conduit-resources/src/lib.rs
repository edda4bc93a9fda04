//! The three resource lifecycles built on `conduit-ops`: tool-server
//! connections, local model pulls and streaming document indexing.

pub mod cache;
pub mod collaborators;
mod controller;
mod error;
pub mod indexing;
pub mod mcp;
pub mod models;
pub mod record;
mod settings;

pub use cache::{CacheSnapshot, MemoryCache, OptimisticCommit, ResourceCache, ResourceList};
pub use collaborators::{
    ConnectEvent, CredentialModelEntry, CredentialStore, DocumentIndexer, IndexEvent, IndexParams,
    McpServerClient, McpServerStore, ModelPuller, PullEvent, RagDocument, SourceType, StoreError,
};
pub use controller::{Collaborators, ResourceController};
pub use error::ControllerError;
pub use indexing::{BatchFailure, BatchReport, IndexingMachine};
pub use mcp::{McpConnectionMachine, ServerUpdate};
pub use models::ModelPullMachine;
pub use record::{
    truncate_for_display, ConnectionType, McpServerPatch, McpServerRecord, ServerStatus,
    TransportType, ValidationError, ValidationIssue,
};
pub use settings::ControllerSettings;
