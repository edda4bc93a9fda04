use std::sync::Arc;

use conduit_ops::{ListenerGuard, OperationHandle, OperationRegistry};
use conduit_protocol::{OperationKey, OperationSnapshot, OperationUpdate};
use tracing::info;

use crate::cache::ResourceCache;
use crate::collaborators::{
    CredentialStore, DocumentIndexer, McpServerClient, McpServerStore, ModelPuller,
};
use crate::indexing::IndexingMachine;
use crate::mcp::McpConnectionMachine;
use crate::models::ModelPullMachine;
use crate::settings::ControllerSettings;

/// External services the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub mcp_client: Arc<dyn McpServerClient>,
    pub mcp_store: Arc<dyn McpServerStore>,
    pub puller: Arc<dyn ModelPuller>,
    pub credentials: Arc<dyn CredentialStore>,
    pub indexer: Arc<dyn DocumentIndexer>,
    pub cache: Arc<dyn ResourceCache>,
}

/// One registry shared by the three resource machines.
pub struct ResourceController {
    registry: Arc<OperationRegistry>,
    mcp: McpConnectionMachine,
    models: ModelPullMachine,
    indexing: IndexingMachine,
}

impl ResourceController {
    pub fn new(
        registry: Arc<OperationRegistry>,
        collaborators: Collaborators,
        settings: ControllerSettings,
    ) -> Self {
        let mcp = McpConnectionMachine::new(
            Arc::clone(&registry),
            collaborators.mcp_client,
            collaborators.mcp_store,
            Arc::clone(&collaborators.cache),
            settings.clone(),
        );
        let models = ModelPullMachine::new(
            Arc::clone(&registry),
            collaborators.puller,
            collaborators.credentials,
            Arc::clone(&collaborators.cache),
            settings.clone(),
        );
        let indexing = IndexingMachine::new(
            Arc::clone(&registry),
            collaborators.indexer,
            collaborators.cache,
            settings,
        );
        Self {
            registry,
            mcp,
            models,
            indexing,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn mcp(&self) -> &McpConnectionMachine {
        &self.mcp
    }

    pub fn models(&self) -> &ModelPullMachine {
        &self.models
    }

    pub fn indexing(&self) -> &IndexingMachine {
        &self.indexing
    }

    pub fn is_active(&self, key: &OperationKey) -> bool {
        self.registry.is_active(key)
    }

    pub fn subscribe(&self, key: &OperationKey) -> Option<OperationHandle> {
        self.registry.subscribe(key)
    }

    pub fn listen<F>(&self, key: &OperationKey, listener: F) -> Option<ListenerGuard>
    where
        F: Fn(&OperationUpdate) + Send + Sync + 'static,
    {
        self.registry.listen(key, listener)
    }

    pub fn active(&self) -> Vec<OperationSnapshot> {
        self.registry.active()
    }

    /// Asks every in-flight operation to stop.
    pub fn shutdown(&self) -> usize {
        self.indexing.cancel_indexing();
        let cancelled = self.registry.cancel_all();
        info!(target: "conduit::ops", cancelled, "shutdown requested");
        cancelled
    }
}
