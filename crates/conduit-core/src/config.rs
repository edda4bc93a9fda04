use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use conduit_events::Bus;
use conduit_ops::{OperationRegistry, RegistryOptions};
use conduit_resources::{Collaborators, ControllerSettings, ResourceController};
use jsonschema::validator_for;
use once_cell::sync::Lazy;
use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const ENV_CONNECT_TIMEOUT_MS: &str = "CONDUIT_CONNECT_TIMEOUT_MS";
pub const ENV_DISCONNECT_TIMEOUT_MS: &str = "CONDUIT_DISCONNECT_TIMEOUT_MS";
pub const ENV_PULL_TIMEOUT_MS: &str = "CONDUIT_PULL_TIMEOUT_MS";
pub const ENV_INDEX_TIMEOUT_MS: &str = "CONDUIT_INDEX_TIMEOUT_MS";
pub const ENV_HISTORY_LIMIT: &str = "CONDUIT_HISTORY_LIMIT";
pub const ENV_CHANNEL_CAPACITY: &str = "CONDUIT_CHANNEL_CAPACITY";
pub const ENV_OLLAMA_BASE_URL: &str = "CONDUIT_OLLAMA_BASE_URL";
pub const ENV_ERROR_MAX_CHARS: &str = "CONDUIT_ERROR_MAX_CHARS";
pub const ENV_BUS_CAPACITY: &str = "CONDUIT_BUS_CAPACITY";
pub const ENV_BUS_REPLAY: &str = "CONDUIT_BUS_REPLAY";

/// Every variable `apply_env_overrides` reads.
pub const ENV_KEYS: &[&str] = &[
    ENV_CONNECT_TIMEOUT_MS,
    ENV_DISCONNECT_TIMEOUT_MS,
    ENV_PULL_TIMEOUT_MS,
    ENV_INDEX_TIMEOUT_MS,
    ENV_HISTORY_LIMIT,
    ENV_CHANNEL_CAPACITY,
    ENV_OLLAMA_BASE_URL,
    ENV_ERROR_MAX_CHARS,
    ENV_BUS_CAPACITY,
    ENV_BUS_REPLAY,
];

/// Deadlines and buffering for the operation registry.
///
/// A timeout of `0` (or an absent one) means the operation may run
/// indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct OperationsConfig {
    pub connect_timeout_ms: Option<u64>,
    pub disconnect_timeout_ms: Option<u64>,
    pub pull_timeout_ms: Option<u64>,
    pub index_timeout_ms: Option<u64>,
    /// Events retained per operation for views that attach late.
    #[schemars(range(min = 1))]
    pub history_limit: usize,
    /// Buffered updates per subscriber before it lags.
    #[schemars(range(min = 1))]
    pub channel_capacity: usize,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Some(30_000),
            disconnect_timeout_ms: Some(10_000),
            pull_timeout_ms: None,
            index_timeout_ms: None,
            history_limit: 256,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct OllamaConfig {
    /// Base URL recorded on credential entries for pulled models.
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    /// Truncation limit for a server's last error.
    #[schemars(range(min = 1))]
    pub error_max_chars: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            error_max_chars: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    #[schemars(range(min = 1))]
    pub capacity: usize,
    /// Envelopes kept for late subscribers; `0` disables replay.
    pub replay: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            replay: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub operations: OperationsConfig,
    pub ollama: OllamaConfig,
    pub display: DisplayConfig,
    pub bus: BusConfig,
}

static CONFIG_SCHEMA: Lazy<RootSchema> = Lazy::new(|| schemars::schema_for!(Config));

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> Result<serde_json::Value> {
    serde_json::to_value(&*CONFIG_SCHEMA).context("serializing config schema")
}

pub fn write_schema_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let schema = config_schema_json()?;
    std::fs::write(path, serde_json::to_string_pretty(&schema)?)
        .with_context(|| format!("writing schema to {}", path.display()))
}

/// Parses a TOML document, checking it against the schema first so every
/// problem is reported at once.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content).context("parsing config toml")?;
    let instance = serde_json::to_value(&raw)?;
    let validator = validator_for(&config_schema_json()?)
        .map_err(|err| anyhow!("config schema is invalid: {err}"))?;
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|err| {
            let path = err.instance_path.to_string();
            if path.is_empty() {
                err.to_string()
            } else {
                format!("{path}: {err}")
            }
        })
        .collect();
    if !errors.is_empty() {
        return Err(anyhow!(errors.join(", ")));
    }
    Ok(toml::from_str(content)?)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

/// File (when given) or defaults, then environment overrides.
pub fn resolve_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

fn env_value<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                target: "conduit::config",
                key,
                value = trimmed,
                error = %err,
                "ignoring unparsable override"
            );
            None
        }
    }
}

fn env_timeout(key: &str, slot: &mut Option<u64>) {
    if let Some(ms) = env_value::<u64>(key) {
        *slot = (ms > 0).then_some(ms);
        debug!(target: "conduit::config", key, ms, "timeout override");
    }
}

fn env_count(key: &str, slot: &mut usize, min: usize) {
    if let Some(value) = env_value::<usize>(key) {
        if value < min {
            warn!(target: "conduit::config", key, value, min, "override below minimum ignored");
        } else {
            *slot = value;
        }
    }
}

fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

impl Config {
    /// Defaults with `CONDUIT_*` variables applied.
    pub fn from_env_overrides() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        let ops = &mut self.operations;
        env_timeout(ENV_CONNECT_TIMEOUT_MS, &mut ops.connect_timeout_ms);
        env_timeout(ENV_DISCONNECT_TIMEOUT_MS, &mut ops.disconnect_timeout_ms);
        env_timeout(ENV_PULL_TIMEOUT_MS, &mut ops.pull_timeout_ms);
        env_timeout(ENV_INDEX_TIMEOUT_MS, &mut ops.index_timeout_ms);
        env_count(ENV_HISTORY_LIMIT, &mut ops.history_limit, 1);
        env_count(ENV_CHANNEL_CAPACITY, &mut ops.channel_capacity, 1);
        env_count(ENV_ERROR_MAX_CHARS, &mut self.display.error_max_chars, 1);
        env_count(ENV_BUS_CAPACITY, &mut self.bus.capacity, 1);
        env_count(ENV_BUS_REPLAY, &mut self.bus.replay, 0);
        if let Some(url) = env_value::<String>(ENV_OLLAMA_BASE_URL) {
            self.ollama.base_url = url;
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            connect_timeout: millis(self.operations.connect_timeout_ms),
            disconnect_timeout: millis(self.operations.disconnect_timeout_ms),
            pull_timeout: millis(self.operations.pull_timeout_ms),
            index_timeout: millis(self.operations.index_timeout_ms),
            ollama_base_url: self.ollama.base_url.clone(),
            error_max_chars: self.display.error_max_chars,
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            history_limit: self.operations.history_limit,
            channel_capacity: self.operations.channel_capacity,
        }
    }

    pub fn build_bus(&self) -> Bus {
        Bus::new_with_replay(self.bus.capacity, self.bus.replay)
    }

    /// Wires a controller over `collaborators`. `bus` should be the one the
    /// cache publishes invalidations on.
    pub fn build_controller(&self, bus: Bus, collaborators: Collaborators) -> ResourceController {
        let registry: Arc<OperationRegistry> =
            OperationRegistry::with_options(bus, self.registry_options());
        ResourceController::new(registry, collaborators, self.controller_settings())
    }
}
