use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Stdio => "stdio",
            TransportType::Sse => "sse",
            TransportType::StreamableHttp => "streamable-http",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" => Some(TransportType::Stdio),
            "sse" => Some(TransportType::Sse),
            "streamable-http" | "streamable_http" | "http" => Some(TransportType::StreamableHttp),
            _ => None,
        }
    }

    /// Remote transports reach the server over a URL.
    pub fn is_remote(&self) -> bool {
        !matches!(self, TransportType::Stdio)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Direct,
    Proxy,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Direct => "direct",
            ConnectionType::Proxy => "proxy",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Error => "error",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            ServerStatus::Disconnected => "Disconnected",
            ServerStatus::Connecting => "Connecting…",
            ServerStatus::Connected => "Connected",
            ServerStatus::Error => "Error",
        }
    }
}

/// Persisted tool-server configuration plus its last known connection state.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct McpServerRecord {
    pub id: String,
    pub name: String,
    pub transport_type: TransportType,
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<u32>,
}

impl McpServerRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        transport_type: TransportType,
        connection_type: ConnectionType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport_type,
            connection_type,
            command: None,
            args: Vec::new(),
            url: None,
            proxy_url: None,
            status: ServerStatus::Disconnected,
            last_error: None,
            protocol_version: None,
            tool_count: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(command.into());
        self.args = args;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    /// Checks the transport/connection invariants. Every issue is reported,
    /// not just the first.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        if self.id.trim().is_empty() {
            issues.push(ValidationIssue::new("id", "identifier is required"));
        }
        if self.name.trim().is_empty() {
            issues.push(ValidationIssue::new("name", "name is required"));
        }

        match self.transport_type {
            TransportType::Stdio => {
                if self.connection_type == ConnectionType::Direct {
                    issues.push(ValidationIssue::new(
                        "connection_type",
                        "stdio servers cannot run direct; use the proxy",
                    ));
                }
                if blank(&self.command) {
                    issues.push(ValidationIssue::new(
                        "command",
                        "command is required for stdio transport",
                    ));
                }
            }
            TransportType::Sse | TransportType::StreamableHttp => match self.url.as_deref() {
                Some(url) if !url.trim().is_empty() => {
                    if let Err(message) = check_http_url(url) {
                        issues.push(ValidationIssue::new("url".to_string(), message));
                    }
                }
                _ => issues.push(ValidationIssue::new(
                    "url".to_string(),
                    format!("url is required for {} transport", self.transport_type),
                )),
            },
        }

        if self.connection_type == ConnectionType::Proxy {
            match self.proxy_url.as_deref() {
                Some(url) if !url.trim().is_empty() => {
                    if let Err(message) = check_http_url(url) {
                        issues.push(ValidationIssue::new("proxy_url".to_string(), message));
                    }
                }
                _ => issues.push(ValidationIssue::new(
                    "proxy_url",
                    "proxy url is required for proxy connections",
                )),
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(format!("server {}", self.id), issues))
        }
    }

    /// `last_error` shortened for inline display.
    pub fn display_error(&self, max_chars: usize) -> Option<String> {
        self.last_error
            .as_deref()
            .map(|err| truncate_for_display(err, max_chars))
    }
}

/// Partial update from the edit dialog. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct McpServerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_type: Option<TransportType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl McpServerPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, record: &mut McpServerRecord) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(transport) = self.transport_type {
            record.transport_type = transport;
        }
        if let Some(connection) = self.connection_type {
            record.connection_type = connection;
        }
        if let Some(command) = &self.command {
            record.command = Some(command.clone());
        }
        if let Some(args) = &self.args {
            record.args = args.clone();
        }
        if let Some(url) = &self.url {
            record.url = Some(url.clone());
        }
        if let Some(proxy_url) = &self.proxy_url {
            record.proxy_url = Some(proxy_url.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new<S: Into<String>>(field: S, message: S) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Rejected input, raised before any operation is registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {subject}: {}", join_issues(.issues))]
pub struct ValidationError {
    pub subject: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(subject: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self {
            subject: subject.into(),
            issues,
        }
    }

    pub fn single(subject: impl Into<String>, field: &str, message: &str) -> Self {
        Self::new(subject, vec![ValidationIssue::new(field, message)])
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.issues.iter().any(|issue| issue.field == field)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect::<Vec<_>>()
        .join(", ")
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

fn check_http_url(raw: &str) -> Result<(), String> {
    let parsed = url::Url::parse(raw.trim()).map_err(|err| format!("invalid url: {err}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported url scheme '{other}'")),
    }
}

/// Cuts `message` to at most `max_chars` characters, marking the cut with an
/// ellipsis.
pub fn truncate_for_display(message: &str, max_chars: usize) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut out: String = trimmed.chars().take(keep).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stdio() -> McpServerRecord {
        McpServerRecord::new("fs", "Filesystem", TransportType::Stdio, ConnectionType::Proxy)
            .with_command("npx", vec!["server-fs".into()])
            .with_proxy_url("http://localhost:6274")
    }

    #[test]
    fn stdio_through_proxy_is_valid() {
        assert_eq!(stdio().validate(), Ok(()));
    }

    #[test]
    fn stdio_direct_is_rejected() {
        let mut record = stdio();
        record.connection_type = ConnectionType::Direct;
        let err = record.validate().unwrap_err();
        assert!(err.has_field("connection_type"));
    }

    #[test]
    fn stdio_requires_command() {
        let mut record = stdio();
        record.command = Some("  ".into());
        assert!(record.validate().unwrap_err().has_field("command"));
    }

    #[test]
    fn remote_transports_require_http_url() {
        let missing = McpServerRecord::new("web", "Web", TransportType::Sse, ConnectionType::Direct);
        assert!(missing.validate().unwrap_err().has_field("url"));

        let bad_scheme = missing.clone().with_url("ftp://example.com/sse");
        assert!(bad_scheme.validate().unwrap_err().has_field("url"));

        let ok = missing.with_url("https://example.com/sse");
        assert_eq!(ok.validate(), Ok(()));
    }

    #[test]
    fn proxy_requires_proxy_url() {
        let record = McpServerRecord::new(
            "web",
            "Web",
            TransportType::StreamableHttp,
            ConnectionType::Proxy,
        )
        .with_url("https://example.com/mcp");
        let err = record.validate().unwrap_err();
        assert!(err.has_field("proxy_url"));
        assert!(err.to_string().contains("proxy url is required"));
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut record = stdio();
        let patch = McpServerPatch {
            name: Some("Files".into()),
            ..Default::default()
        };
        patch.apply_to(&mut record);
        assert_eq!(record.name, "Files");
        assert_eq!(record.command.as_deref(), Some("npx"));
        assert!(McpServerPatch::default().is_empty());
    }

    #[test]
    fn display_error_truncates_long_messages() {
        let mut record = stdio();
        record.last_error = Some("x".repeat(200));
        let shown = record.display_error(20).unwrap();
        assert_eq!(shown.chars().count(), 20);
        assert!(shown.ends_with('…'));
        record.last_error = Some("short".into());
        assert_eq!(record.display_error(20).as_deref(), Some("short"));
    }

    proptest! {
        #[test]
        fn truncation_never_exceeds_limit(message in ".{0,300}", max in 1usize..200) {
            prop_assert!(truncate_for_display(&message, max).chars().count() <= max);
        }
    }
}
