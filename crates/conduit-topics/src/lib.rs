//! Canonical event topic constants shared across the conduit crates.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Operation lifecycle
pub const TOPIC_OPERATIONS_CANCEL_REQUESTED: &str = "operations.cancel.requested";
pub const TOPIC_OPERATIONS_CANCELLED: &str = "operations.cancelled";
pub const TOPIC_OPERATIONS_COMPLETED: &str = "operations.completed";
pub const TOPIC_OPERATIONS_FAILED: &str = "operations.failed";
pub const TOPIC_OPERATIONS_PROGRESS: &str = "operations.progress";
pub const TOPIC_OPERATIONS_REJECTED: &str = "operations.rejected";
pub const TOPIC_OPERATIONS_STARTED: &str = "operations.started";

// Resource lists (cache invalidation)
pub const TOPIC_RESOURCES_INVALIDATED: &str = "resources.invalidated";
pub const TOPIC_RESOURCES_ROLLED_BACK: &str = "resources.rolled_back";

// Tool servers
pub const TOPIC_MCP_SERVER_DELETED: &str = "mcp.server.deleted";
pub const TOPIC_MCP_SERVER_STATUS: &str = "mcp.server.status";
pub const TOPIC_MCP_SERVER_UPDATED: &str = "mcp.server.updated";

// Models
pub const TOPIC_MODELS_CREDENTIAL_ADDED: &str = "models.credential.added";

// Indexing
pub const TOPIC_INDEX_BATCH_FINISHED: &str = "index.batch.finished";

/// Terminal topic for an outcome status slug (`completed`, `failed`, `cancelled`).
pub fn terminal_topic(status: &str) -> &'static str {
    match status {
        "completed" => TOPIC_OPERATIONS_COMPLETED,
        "cancelled" => TOPIC_OPERATIONS_CANCELLED,
        _ => TOPIC_OPERATIONS_FAILED,
    }
}
