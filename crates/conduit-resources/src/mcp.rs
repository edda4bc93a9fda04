use std::sync::Arc;

use async_trait::async_trait;
use conduit_events::Bus;
use conduit_ops::{
    stream_of, translate, EventStream, OperationHandle, OperationRegistry, OperationSource,
    ReconcileError, Reconciler, SourceError, StartOptions,
};
use conduit_protocol::{EventPayload, OperationKey, OperationOutcome, OutcomeStatus, ProgressEvent};
use conduit_topics as topics;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ResourceCache, ResourceList};
use crate::collaborators::{ConnectEvent, McpServerClient, McpServerStore, StoreError};
use crate::error::ControllerError;
use crate::record::{McpServerPatch, McpServerRecord, ServerStatus};
use crate::settings::ControllerSettings;

/// Folds one client event into the shared progress protocol.
pub fn connect_event_to_progress(event: ConnectEvent) -> Option<ProgressEvent> {
    Some(match event {
        ConnectEvent::Connecting { message } => {
            if message.is_empty() {
                ProgressEvent::started("Connecting…")
            } else {
                ProgressEvent::started(message)
            }
        }
        ConnectEvent::Connected {
            protocol_version,
            tool_count,
        } => ProgressEvent::completed(format!("connected, {tool_count} tools")).with_payload(
            EventPayload::Connect {
                protocol_version,
                tool_count: Some(tool_count),
            },
        ),
        ConnectEvent::Failed { message } => ProgressEvent::failed(message),
        ConnectEvent::Cancelled => ProgressEvent::cancelled("connection cancelled"),
    })
}

fn store_unavailable(err: StoreError) -> SourceError {
    SourceError::Io(err.to_string())
}

struct ConnectSource {
    record: McpServerRecord,
    client: Arc<dyn McpServerClient>,
    store: Arc<dyn McpServerStore>,
    cache: Arc<dyn ResourceCache>,
}

#[async_trait]
impl OperationSource for ConnectSource {
    async fn open(&self, cancel: CancellationToken) -> Result<EventStream, SourceError> {
        let mut connecting = self.record.clone();
        connecting.status = ServerStatus::Connecting;
        connecting.last_error = None;
        self.store
            .save(connecting)
            .await
            .map_err(store_unavailable)?;
        self.cache.invalidate(ResourceList::McpServers);

        let raw = self.client.connect_server(&self.record, cancel).await?;
        Ok(translate(raw, connect_event_to_progress))
    }
}

struct DisconnectSource {
    server_id: String,
    client: Arc<dyn McpServerClient>,
}

#[async_trait]
impl OperationSource for DisconnectSource {
    async fn open(&self, _cancel: CancellationToken) -> Result<EventStream, SourceError> {
        self.client.disconnect_server(&self.server_id).await?;
        Ok(stream_of(vec![
            ProgressEvent::started("Disconnecting…"),
            ProgressEvent::completed("disconnected"),
        ]))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusMode {
    Connect,
    Disconnect,
}

/// Writes the terminal connection state back onto the persisted record.
struct ServerStatusReconciler {
    server_id: String,
    mode: StatusMode,
    store: Arc<dyn McpServerStore>,
    cache: Arc<dyn ResourceCache>,
    bus: Bus,
}

#[async_trait]
impl Reconciler for ServerStatusReconciler {
    async fn reconcile(&self, outcome: &OperationOutcome) -> Result<(), ReconcileError> {
        let Some(mut record) = self
            .store
            .get(&self.server_id)
            .await
            .map_err(|err| ReconcileError::new(err.to_string()))?
        else {
            return Err(ReconcileError::new(format!(
                "server {} no longer exists",
                self.server_id
            )));
        };

        match (self.mode, outcome.status) {
            (_, OutcomeStatus::Failed) => {
                record.status = ServerStatus::Error;
                record.last_error = Some(outcome.message.clone());
            }
            (StatusMode::Connect, OutcomeStatus::Completed) => {
                record.status = ServerStatus::Connected;
                record.last_error = None;
                if let Some(EventPayload::Connect {
                    protocol_version,
                    tool_count,
                }) = &outcome.payload
                {
                    record.protocol_version = protocol_version.clone();
                    record.tool_count = *tool_count;
                }
            }
            (StatusMode::Connect, OutcomeStatus::Cancelled) => {
                record.status = ServerStatus::Disconnected;
            }
            (StatusMode::Disconnect, OutcomeStatus::Completed) => {
                record.status = ServerStatus::Disconnected;
                record.last_error = None;
                record.tool_count = None;
            }
            // The session was left as it was.
            (StatusMode::Disconnect, OutcomeStatus::Cancelled) => return Ok(()),
        }

        let saved = self
            .store
            .save(record)
            .await
            .map_err(|err| ReconcileError::new(err.to_string()))?;
        info!(
            target: "conduit::mcp",
            server = %saved.id,
            status = saved.status.as_str(),
            "server status reconciled"
        );
        self.cache.invalidate(ResourceList::McpServers);
        self.bus.publish(
            topics::TOPIC_MCP_SERVER_STATUS,
            &json!({
                "id": saved.id,
                "status": saved.status,
                "last_error": saved.last_error,
                "tool_count": saved.tool_count,
            }),
        );
        Ok(())
    }
}

/// Result of editing a server's configuration.
pub struct ServerUpdate {
    pub record: McpServerRecord,
    /// Fresh connection when the server was connected before the edit.
    pub reconnect: Option<OperationHandle>,
}

/// Connect/disconnect lifecycle for tool servers.
///
/// Connect and disconnect share the server's `mcp-connect` key, so at most
/// one of them runs per server at any time.
pub struct McpConnectionMachine {
    registry: Arc<OperationRegistry>,
    client: Arc<dyn McpServerClient>,
    store: Arc<dyn McpServerStore>,
    cache: Arc<dyn ResourceCache>,
    settings: ControllerSettings,
}

impl McpConnectionMachine {
    pub fn new(
        registry: Arc<OperationRegistry>,
        client: Arc<dyn McpServerClient>,
        store: Arc<dyn McpServerStore>,
        cache: Arc<dyn ResourceCache>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            cache,
            settings,
        }
    }

    pub fn key(server_id: &str) -> OperationKey {
        OperationKey::mcp_connect(server_id)
    }

    /// Whether a connect or disconnect is in flight for the server.
    pub fn is_busy(&self, server_id: &str) -> bool {
        self.registry.is_active(&Self::key(server_id))
    }

    pub async fn list(&self) -> Result<Vec<McpServerRecord>, ControllerError> {
        Ok(self.store.list().await?)
    }

    async fn load(&self, server_id: &str) -> Result<McpServerRecord, ControllerError> {
        self.store
            .get(server_id)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("server {server_id}")))
    }

    fn ensure_idle(&self, server_id: &str) -> Result<(), ControllerError> {
        let key = Self::key(server_id);
        if self.registry.is_active(&key) {
            return Err(ControllerError::Duplicate(key));
        }
        Ok(())
    }

    fn status_reconciler(&self, server_id: &str, mode: StatusMode) -> Arc<dyn Reconciler> {
        Arc::new(ServerStatusReconciler {
            server_id: server_id.to_string(),
            mode,
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            bus: self.registry.bus().clone(),
        })
    }

    /// Connects a stored server. Invalid configurations are rejected before
    /// the client is contacted.
    pub async fn connect(&self, server_id: &str) -> Result<OperationHandle, ControllerError> {
        let record = self.load(server_id).await?;
        record.validate()?;
        if record.status == ServerStatus::Connected {
            info!(target: "conduit::mcp", server = %record.id, "already connected");
            return Err(ControllerError::AlreadyExists(format!(
                "connection to server {server_id}"
            )));
        }
        self.start_connect(record).await
    }

    async fn start_connect(
        &self,
        record: McpServerRecord,
    ) -> Result<OperationHandle, ControllerError> {
        let key = Self::key(&record.id);
        info!(
            target: "conduit::mcp",
            server = %record.id,
            transport = record.transport_type.as_str(),
            connection = record.connection_type.as_str(),
            "connecting"
        );
        let options = StartOptions::default()
            .with_deadline(self.settings.connect_timeout)
            .with_reconciler(self.status_reconciler(&record.id, StatusMode::Connect));
        let source = Arc::new(ConnectSource {
            record,
            client: Arc::clone(&self.client),
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
        });
        Ok(self.registry.start(key, source, options).await?)
    }

    pub async fn disconnect(&self, server_id: &str) -> Result<OperationHandle, ControllerError> {
        let record = self.load(server_id).await?;
        info!(target: "conduit::mcp", server = %record.id, "disconnecting");
        let options = StartOptions::default()
            .with_deadline(self.settings.disconnect_timeout)
            .with_reconciler(self.status_reconciler(&record.id, StatusMode::Disconnect));
        let source = Arc::new(DisconnectSource {
            server_id: record.id.clone(),
            client: Arc::clone(&self.client),
        });
        Ok(self
            .registry
            .start(Self::key(&record.id), source, options)
            .await?)
    }

    async fn disconnect_and_wait(&self, server_id: &str) -> Result<(), ControllerError> {
        let outcome = self.disconnect(server_id).await?.wait().await;
        if outcome.is_completed() {
            Ok(())
        } else {
            Err(ControllerError::Source(SourceError::Rejected(format!(
                "disconnect of {server_id} ended {}: {}",
                outcome.status.as_str(),
                outcome.message
            ))))
        }
    }

    /// Disconnects first when connected, then connects again.
    pub async fn reconnect(&self, server_id: &str) -> Result<OperationHandle, ControllerError> {
        let record = self.load(server_id).await?;
        record.validate()?;
        self.ensure_idle(server_id)?;
        if record.status == ServerStatus::Connected {
            self.disconnect_and_wait(server_id).await?;
        }
        let record = self.load(server_id).await?;
        self.start_connect(record).await
    }

    pub async fn create_and_connect(
        &self,
        record: McpServerRecord,
    ) -> Result<OperationHandle, ControllerError> {
        record.validate()?;
        if self.store.get(&record.id).await?.is_some() {
            return Err(ControllerError::AlreadyExists(format!("server {}", record.id)));
        }
        let mut record = record;
        record.status = ServerStatus::Disconnected;
        record.last_error = None;
        record.protocol_version = None;
        record.tool_count = None;
        let saved = self.store.save(record).await?;
        self.cache.invalidate(ResourceList::McpServers);
        self.registry
            .bus()
            .publish(topics::TOPIC_MCP_SERVER_UPDATED, &saved);
        self.start_connect(saved).await
    }

    /// Applies `patch`. A connected server is disconnected before the new
    /// configuration is persisted and connected again afterwards.
    pub async fn update(
        &self,
        server_id: &str,
        patch: &McpServerPatch,
    ) -> Result<ServerUpdate, ControllerError> {
        let current = self.load(server_id).await?;
        let mut proposed = current.clone();
        patch.apply_to(&mut proposed);
        proposed.validate()?;
        self.ensure_idle(server_id)?;

        let was_connected = current.status == ServerStatus::Connected;
        if was_connected {
            self.disconnect_and_wait(server_id).await?;
        }

        // Reload so the status written by the disconnect is kept.
        let mut stored = self.load(server_id).await?;
        patch.apply_to(&mut stored);
        let saved = self.store.save(stored).await?;
        info!(
            target: "conduit::mcp",
            server = %saved.id,
            reconnect = was_connected,
            "server configuration updated"
        );
        self.cache.invalidate(ResourceList::McpServers);
        self.registry
            .bus()
            .publish(topics::TOPIC_MCP_SERVER_UPDATED, &saved);

        let reconnect = if was_connected {
            Some(self.start_connect(saved.clone()).await?)
        } else {
            None
        };
        Ok(ServerUpdate {
            record: saved,
            reconnect,
        })
    }

    /// Removes a server, disconnecting it first when connected.
    pub async fn delete(&self, server_id: &str) -> Result<McpServerRecord, ControllerError> {
        let record = self.load(server_id).await?;
        self.ensure_idle(server_id)?;
        if record.status == ServerStatus::Connected {
            if let Err(err) = self.disconnect_and_wait(server_id).await {
                warn!(
                    target: "conduit::mcp",
                    server = %server_id,
                    error = %err,
                    "disconnect before delete failed; deleting anyway"
                );
            }
        }
        if !self.store.delete(server_id).await? {
            return Err(ControllerError::NotFound(format!("server {server_id}")));
        }
        info!(target: "conduit::mcp", server = %server_id, "server deleted");
        self.cache.invalidate(ResourceList::McpServers);
        self.registry
            .bus()
            .publish(topics::TOPIC_MCP_SERVER_DELETED, &json!({"id": server_id}));
        Ok(record)
    }

    /// `last_error` cut to the configured display width.
    pub fn display_error(&self, record: &McpServerRecord) -> Option<String> {
        record.display_error(self.settings.error_max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_event_completes_with_tool_count() {
        let event = connect_event_to_progress(ConnectEvent::Connected {
            protocol_version: Some("2025-03-26".into()),
            tool_count: 7,
        })
        .unwrap();
        assert!(event.is_terminal());
        assert_eq!(
            event.payload(),
            Some(&EventPayload::Connect {
                protocol_version: Some("2025-03-26".into()),
                tool_count: Some(7),
            })
        );
    }

    #[test]
    fn connecting_without_message_gets_default_label() {
        let event = connect_event_to_progress(ConnectEvent::Connecting {
            message: String::new(),
        })
        .unwrap();
        assert_eq!(event.message(), "Connecting…");
    }
}
