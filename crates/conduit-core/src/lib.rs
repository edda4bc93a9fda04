//! Configuration for the conduit operation controller: a TOML file checked
//! against its generated JSON schema, with `CONDUIT_*` overrides on top.

pub mod config;
mod test_support;

pub use config::{
    config_schema_json, load_config, parse_config, resolve_config, write_schema_file, BusConfig,
    Config, DisplayConfig, OllamaConfig, OperationsConfig, ENV_KEYS,
};
