use std::sync::Arc;

use async_trait::async_trait;
use conduit_events::Bus;
use conduit_ops::{
    stream_of, translate, EventStream, OperationHandle, OperationRegistry, OperationSource,
    ReconcileError, Reconciler, SourceError, StartOptions,
};
use conduit_protocol::{EventPayload, OperationKey, OperationOutcome, ProgressEvent};
use conduit_topics as topics;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{OptimisticCommit, ResourceCache, ResourceList};
use crate::collaborators::{CredentialModelEntry, CredentialStore, ModelPuller, PullEvent};
use crate::error::ControllerError;
use crate::record::ValidationError;
use crate::settings::ControllerSettings;

/// Relays daemon status lines; byte progress is passed through untouched.
pub fn pull_event_to_progress(event: PullEvent) -> Option<ProgressEvent> {
    if let Some(error) = event.error {
        return Some(ProgressEvent::failed(error));
    }
    let payload = EventPayload::Pull {
        status: event.status.clone(),
        completed_bytes: event.completed_bytes,
        total_bytes: event.total_bytes,
    };
    Some(match event.status.as_str() {
        PullEvent::SUCCESS => ProgressEvent::completed("pulled").with_payload(payload),
        PullEvent::CANCELLED => ProgressEvent::cancelled("pull cancelled"),
        _ => ProgressEvent::progress(event.progress, event.status).with_payload(payload),
    })
}

fn entry_value(entry: &CredentialModelEntry) -> Value {
    json!({
        "provider": entry.provider,
        "name": entry.name,
        "base_url": entry.base_url,
    })
}

struct PullSource {
    model_name: String,
    puller: Arc<dyn ModelPuller>,
}

#[async_trait]
impl OperationSource for PullSource {
    async fn open(&self, cancel: CancellationToken) -> Result<EventStream, SourceError> {
        let raw = self.puller.pull_model(&self.model_name, cancel).await?;
        let started = ProgressEvent::started(format!("Pulling {}", self.model_name));
        Ok(futures_util::stream::once(futures_util::future::ready(started))
            .chain(translate(raw, pull_event_to_progress))
            .boxed())
    }

    async fn abort(&self) -> Result<(), SourceError> {
        self.puller.cancel_pull(&self.model_name).await
    }
}

/// Model already on disk; only the credential entry is missing.
struct LinkSource;

#[async_trait]
impl OperationSource for LinkSource {
    async fn open(&self, _cancel: CancellationToken) -> Result<EventStream, SourceError> {
        Ok(stream_of(vec![
            ProgressEvent::started("Linking installed model"),
            ProgressEvent::completed("linked"),
        ]))
    }
}

/// Adds the pulled model to the credential's model set on completion.
struct CredentialReconciler {
    entry: CredentialModelEntry,
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<dyn ResourceCache>,
    bus: Bus,
}

#[async_trait]
impl Reconciler for CredentialReconciler {
    async fn reconcile(&self, outcome: &OperationOutcome) -> Result<(), ReconcileError> {
        if !outcome.is_completed() {
            info!(
                target: "conduit::models",
                model = %self.entry.name,
                status = outcome.status.as_str(),
                "pull ended; credential left unchanged"
            );
            return Ok(());
        }

        let present = self
            .credentials
            .models()
            .await
            .map_err(|err| ReconcileError::new(err.to_string()))?
            .iter()
            .any(|model| model.name == self.entry.name);
        if present {
            debug!(
                target: "conduit::models",
                model = %self.entry.name,
                "model already in credential"
            );
            return Ok(());
        }

        let mut optimistic = entry_value(&self.entry);
        optimistic["pending"] = Value::Bool(true);
        let commit = OptimisticCommit::begin(
            Arc::clone(&self.cache),
            ResourceList::CredentialModels,
            self.entry.name.clone(),
            optimistic,
        )
        .with_bus(self.bus.clone());

        match self.credentials.add_model(self.entry.clone()).await {
            Ok(saved) => {
                commit.confirm(entry_value(&saved));
                info!(
                    target: "conduit::models",
                    model = %saved.name,
                    provider = %saved.provider,
                    "model added to credential"
                );
                self.bus
                    .publish(topics::TOPIC_MODELS_CREDENTIAL_ADDED, &saved);
                Ok(())
            }
            Err(err) => {
                warn!(
                    target: "conduit::models",
                    model = %self.entry.name,
                    error = %err,
                    "credential add failed"
                );
                commit.rollback();
                Err(ReconcileError::new(err.to_string()))
            }
        }
    }
}

/// Local model downloads keyed by model name.
pub struct ModelPullMachine {
    registry: Arc<OperationRegistry>,
    puller: Arc<dyn ModelPuller>,
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<dyn ResourceCache>,
    settings: ControllerSettings,
}

impl ModelPullMachine {
    pub fn new(
        registry: Arc<OperationRegistry>,
        puller: Arc<dyn ModelPuller>,
        credentials: Arc<dyn CredentialStore>,
        cache: Arc<dyn ResourceCache>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry,
            puller,
            credentials,
            cache,
            settings,
        }
    }

    pub fn key(model_name: &str) -> OperationKey {
        OperationKey::model_pull(model_name.trim())
    }

    pub fn is_pulling(&self, model_name: &str) -> bool {
        self.registry.is_active(&Self::key(model_name))
    }

    /// Starts a download, or links a model that is installed but missing
    /// from the credential. Completion adds the credential entry.
    pub async fn pull(&self, model_name: &str) -> Result<OperationHandle, ControllerError> {
        let name = model_name.trim();
        if name.is_empty() {
            return Err(ValidationError::single("model", "name", "model name is required").into());
        }
        let key = Self::key(name);
        if self.registry.is_active(&key) {
            return Err(ControllerError::Duplicate(key));
        }

        let in_credential = self
            .credentials
            .models()
            .await?
            .iter()
            .any(|model| model.name == name);
        let installed = self
            .puller
            .installed_models()
            .await?
            .iter()
            .any(|model| model == name);
        if installed && in_credential {
            return Err(ControllerError::AlreadyExists(format!("model {name}")));
        }

        let reconciler = Arc::new(CredentialReconciler {
            entry: CredentialModelEntry::ollama(name, self.settings.ollama_base_url.clone()),
            credentials: Arc::clone(&self.credentials),
            cache: Arc::clone(&self.cache),
            bus: self.registry.bus().clone(),
        });
        let (source, deadline) = if installed {
            info!(target: "conduit::models", model = %name, "linking installed model");
            (Arc::new(LinkSource) as Arc<dyn OperationSource>, None)
        } else {
            info!(target: "conduit::models", model = %name, "pulling model");
            let source: Arc<dyn OperationSource> = Arc::new(PullSource {
                model_name: name.to_string(),
                puller: Arc::clone(&self.puller),
            });
            (source, self.settings.pull_timeout)
        };

        let options = StartOptions::default()
            .with_deadline(deadline)
            .with_reconciler(reconciler);
        Ok(self.registry.start(key, source, options).await?)
    }

    /// Cancels the pull and asks the daemon to stop the download.
    pub fn cancel_pull(&self, model_name: &str) -> bool {
        self.registry.cancel(&Self::key(model_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_completes() {
        let event = pull_event_to_progress(PullEvent::success()).unwrap();
        assert!(matches!(event, ProgressEvent::Completed { .. }));
    }

    #[test]
    fn error_wins_over_status() {
        let event = pull_event_to_progress(PullEvent::error("disk full")).unwrap();
        assert_eq!(event, ProgressEvent::failed("disk full"));
    }

    #[test]
    fn byte_progress_is_relayed() {
        let event =
            pull_event_to_progress(PullEvent::progress(42.5, "downloading").with_bytes(425, 1000))
                .unwrap();
        assert_eq!(event.percent(), Some(42.5));
        assert_eq!(
            event.payload(),
            Some(&EventPayload::Pull {
                status: "downloading".into(),
                completed_bytes: Some(425),
                total_bytes: Some(1000),
            })
        );
    }
}
