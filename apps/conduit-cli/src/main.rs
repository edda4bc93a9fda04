use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use conduit_core::{config_schema_json, resolve_config, write_schema_file, Config};
use conduit_events::{Bus, Envelope};
use conduit_mock_adapter::{
    MemoryCredentialStore, MemoryServerStore, MockIndexer, MockMcpClient, MockModelPuller,
};
use conduit_protocol::{OperationKey, OperationOutcome, OperationUpdate};
use conduit_resources::{
    BatchReport, Collaborators, ConnectionType, IndexParams, McpServerRecord, MemoryCache,
    ModelPullMachine, PullEvent, ResourceController, ServerStatus, SourceType, TransportType,
};
use conduit_topics as topics;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Parser)]
#[command(
    name = "conduit",
    version,
    about = "Run long-lived resource operations against scripted collaborators"
)]
struct Cli {
    /// TOML configuration file; CONDUIT_* variables apply on top
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Delay between scripted events in milliseconds
    #[arg(long, global = true, default_value_t = 150)]
    step_ms: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull a local model and add it to the credential
    Pull(PullArgs),
    /// Index documents one after another
    Index(IndexArgs),
    /// Register a tool server and connect to it
    Connect(ServerArgs),
    /// Disconnect a connected tool server
    Disconnect(ServerArgs),
    /// Disconnect a connected tool server and connect again
    Reconnect(ServerArgs),
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Args)]
struct PullArgs {
    model: String,
    /// Make the daemon report an error once progress reaches this percent
    #[arg(long)]
    fail_at: Option<f64>,
    /// Cancel the pull once progress reaches this percent
    #[arg(long)]
    cancel_at: Option<f64>,
}

#[derive(Args)]
struct IndexArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// File name the indexer rejects halfway through
    #[arg(long)]
    fail_on: Option<String>,
    /// Chunks per document
    #[arg(long, default_value_t = 8)]
    chunks: u32,
}

#[derive(Args)]
struct ServerArgs {
    name: String,
    #[arg(long, value_enum, default_value_t = TransportArg::Stdio)]
    transport: TransportArg,
    /// Connect without the proxy (remote transports only)
    #[arg(long)]
    direct: bool,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    proxy_url: Option<String>,
    /// Command that starts a stdio server
    #[arg(long)]
    command: Option<String>,
    /// Arguments passed to --command
    #[arg(long = "arg")]
    args: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Stdio,
    Sse,
    StreamableHttp,
}

impl From<TransportArg> for TransportType {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Stdio => TransportType::Stdio,
            TransportArg::Sse => TransportType::Sse,
            TransportArg::StreamableHttp => TransportType::StreamableHttp,
        }
    }
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the configuration JSON schema
    Schema {
        /// Write the schema to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the effective configuration
    Show {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

/// What to run once the controller is wired.
enum Plan {
    Pull(String),
    Index(Vec<IndexParams>),
    Connect(McpServerRecord),
    Disconnect(String),
    Reconnect(String),
}

struct Scenario {
    collaborators: Collaborators,
    plan: Plan,
    /// Cancel this operation once it reaches the given percent.
    cancel_at: Option<(OperationKey, f64)>,
}

enum Finished {
    Outcome(OperationOutcome),
    Batch(BatchReport),
}

impl Finished {
    fn succeeded(&self) -> bool {
        match self {
            Self::Outcome(outcome) => outcome.is_completed(),
            Self::Batch(report) => report.is_success(),
        }
    }

    fn to_json(&self) -> Result<String> {
        Ok(match self {
            Self::Outcome(outcome) => serde_json::to_string_pretty(outcome)?,
            Self::Batch(report) => serde_json::to_string_pretty(report)?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    conduit_otel::init();
    let cli = Cli::parse();
    let step = Duration::from_millis(cli.step_ms);

    if let Commands::Config { cmd } = &cli.command {
        config_command(cmd, cli.config.as_deref())?;
        return Ok(ExitCode::SUCCESS);
    }
    let config = resolve_config(cli.config.as_deref())?;
    debug!(target: "conduit::cli", ?config, "configuration resolved");

    let bus = config.build_bus();
    let mut events = bus.subscribe();
    let mut scenario = build_scenario(cli.command, step, &bus)?;
    let controller = config.build_controller(bus, scenario.collaborators);

    let run = execute(&controller, scenario.plan);
    tokio::pin!(run);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let finished = loop {
        tokio::select! {
            biased;
            received = events.recv() => match received {
                Ok(envelope) => on_envelope(&controller, &envelope, &mut scenario.cancel_at),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "conduit::cli", skipped, "progress output lagged");
                }
                Err(RecvError::Closed) => {}
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                let cancelled = controller.shutdown();
                eprintln!("interrupted; cancelling {cancelled} operation(s)");
            }
            result = &mut run => break result?,
        }
    };
    while let Ok(envelope) = events.try_recv() {
        on_envelope(&controller, &envelope, &mut scenario.cancel_at);
    }

    println!("{}", finished.to_json()?);
    Ok(if finished.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn config_command(cmd: &ConfigCmd, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigCmd::Schema { out: Some(out) } => {
            write_schema_file(out)?;
            eprintln!("schema written to {}", out.display());
        }
        ConfigCmd::Schema { out: None } => {
            println!("{}", serde_json::to_string_pretty(&config_schema_json()?)?);
        }
        ConfigCmd::Show { path } => {
            let config: Config = resolve_config(path.as_deref().or(config_path))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn build_scenario(command: Commands, step: Duration, bus: &Bus) -> Result<Scenario> {
    let mcp_client = Arc::new(MockMcpClient::new().with_step_delay(step));
    let puller = Arc::new(MockModelPuller::new().with_step_delay(step));
    let mut indexer = MockIndexer::default().with_step_delay(step);
    let mut servers = MemoryServerStore::new();
    let mut cancel_at = None;

    let plan = match command {
        Commands::Pull(args) => {
            puller.script(&args.model, pull_script(args.fail_at));
            cancel_at = args
                .cancel_at
                .map(|at| (ModelPullMachine::key(&args.model), at));
            Plan::Pull(args.model)
        }
        Commands::Index(args) => {
            indexer = MockIndexer::new(args.chunks).with_step_delay(step);
            if let Some(name) = &args.fail_on {
                indexer.fail_on(name);
            }
            let files = args
                .files
                .iter()
                .map(|path| read_document(path))
                .collect::<Result<Vec<_>>>()?;
            Plan::Index(files)
        }
        Commands::Connect(args) => Plan::Connect(server_record(&args)),
        Commands::Disconnect(args) => {
            let record = connected(server_record(&args));
            let id = record.id.clone();
            servers = MemoryServerStore::with_records(vec![record]);
            Plan::Disconnect(id)
        }
        Commands::Reconnect(args) => {
            let record = connected(server_record(&args));
            let id = record.id.clone();
            servers = MemoryServerStore::with_records(vec![record]);
            Plan::Reconnect(id)
        }
        Commands::Config { .. } => anyhow::bail!("config commands do not run operations"),
    };

    Ok(Scenario {
        collaborators: Collaborators {
            mcp_client,
            mcp_store: Arc::new(servers),
            puller,
            credentials: Arc::new(MemoryCredentialStore::new()),
            indexer: Arc::new(indexer),
            cache: Arc::new(MemoryCache::with_bus(bus.clone())),
        },
        plan,
        cancel_at,
    })
}

async fn execute(controller: &ResourceController, plan: Plan) -> Result<Finished> {
    let handle = match plan {
        Plan::Pull(model) => controller.models().pull(&model).await?,
        Plan::Index(files) => {
            let report = controller.indexing().index_batch(files).await?;
            return Ok(Finished::Batch(report));
        }
        Plan::Connect(record) => controller.mcp().create_and_connect(record).await?,
        Plan::Disconnect(id) => controller.mcp().disconnect(&id).await?,
        Plan::Reconnect(id) => controller.mcp().reconnect(&id).await?,
    };
    Ok(Finished::Outcome(handle.wait().await))
}

fn on_envelope(
    controller: &ResourceController,
    envelope: &Envelope,
    cancel_at: &mut Option<(OperationKey, f64)>,
) {
    if envelope.kind != topics::TOPIC_OPERATIONS_PROGRESS {
        debug!(target: "conduit::cli", kind = %envelope.kind, "bus event");
        return;
    }
    let update: OperationUpdate = match serde_json::from_value(envelope.payload.clone()) {
        Ok(update) => update,
        Err(err) => {
            warn!(target: "conduit::cli", error = %err, "unreadable progress event");
            return;
        }
    };
    println!("{}", format_update(&update));

    let reached = matches!(
        cancel_at,
        Some((key, at)) if *key == update.snapshot.key && update.snapshot.percent >= *at
    );
    if reached && !update.snapshot.is_terminal() {
        if let Some((key, _)) = cancel_at.take() {
            controller.registry().cancel(&key);
        }
    }
}

fn format_update(update: &OperationUpdate) -> String {
    let snapshot = &update.snapshot;
    format!(
        "[{}] {} {:.0}% {}",
        snapshot.key,
        snapshot.state.as_str(),
        snapshot.percent,
        snapshot.message
    )
}

/// Ten download steps, or an error at the first step that reaches
/// `fail_at`.
fn pull_script(fail_at: Option<f64>) -> Vec<PullEvent> {
    let mut events = vec![PullEvent::progress(0.0, "pulling manifest")];
    for step in 1..=10u64 {
        let percent = (step * 10) as f64;
        if let Some(at) = fail_at.filter(|at| percent >= *at) {
            events.push(PullEvent::error(format!("simulated failure at {at}%")));
            return events;
        }
        events.push(PullEvent::progress(percent, "downloading").with_bytes(step * 100, 1000));
    }
    events.push(PullEvent::success());
    events
}

fn read_document(path: &Path) -> Result<IndexParams> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(IndexParams::new(
        content,
        file_name,
        file_type(path),
        SourceType::File,
    ))
}

fn file_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" | "text" => "text/plain",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn server_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            id.push(ch.to_ascii_lowercase());
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    id.trim_matches('-').to_string()
}

fn server_record(args: &ServerArgs) -> McpServerRecord {
    let connection = if args.direct {
        ConnectionType::Direct
    } else {
        ConnectionType::Proxy
    };
    let mut record = McpServerRecord::new(
        server_id(&args.name),
        args.name.trim(),
        args.transport.into(),
        connection,
    );
    if let Some(command) = &args.command {
        record = record.with_command(command, args.args.clone());
    }
    if let Some(url) = &args.url {
        record = record.with_url(url);
    }
    if let Some(proxy_url) = &args.proxy_url {
        record = record.with_proxy_url(proxy_url);
    }
    record
}

fn connected(mut record: McpServerRecord) -> McpServerRecord {
    record.status = ServerStatus::Connected;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn server_ids_are_slugs() {
        assert_eq!(server_id("  Local Files (dev) "), "local-files-dev");
        assert_eq!(server_id("github"), "github");
    }

    #[test]
    fn pull_script_fails_at_threshold() {
        let events = pull_script(Some(35.0));
        let last = events.last().unwrap();
        assert_eq!(last.error.as_deref(), Some("simulated failure at 35%"));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn pull_script_ends_in_success() {
        let events = pull_script(None);
        assert_eq!(
            events.last().map(|event| event.status.as_str()),
            Some(PullEvent::SUCCESS)
        );
    }

    #[test]
    fn transport_flags_parse() {
        let cli = Cli::try_parse_from([
            "conduit",
            "connect",
            "search",
            "--transport",
            "streamable-http",
            "--direct",
            "--url",
            "https://tools.example.com/mcp",
        ])
        .unwrap();
        let Commands::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        let record = server_record(&args);
        assert_eq!(record.transport_type, TransportType::StreamableHttp);
        assert_eq!(record.connection_type, ConnectionType::Direct);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn stdio_without_command_is_invalid() {
        let cli = Cli::try_parse_from(["conduit", "connect", "files"]).unwrap();
        let Commands::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        assert!(server_record(&args).validate().is_err());
    }

    #[test]
    fn update_line_shows_state_and_percent() {
        let mut snapshot =
            conduit_protocol::OperationSnapshot::new(ModelPullMachine::key("llama3"));
        snapshot.state = conduit_protocol::OperationState::Running;
        snapshot.percent = 42.4;
        snapshot.message = "downloading".into();
        let update = OperationUpdate {
            seq: 3,
            event: conduit_protocol::ProgressEvent::progress(42.4, "downloading"),
            snapshot,
        };
        assert_eq!(
            format_update(&update),
            "[model-pull:llama3] running 42% downloading"
        );
    }
}
