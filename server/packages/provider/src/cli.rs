use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use codex_provider_error::{ErrorDetails, ProviderError};
use codex_provider_protocol::{DeltaKind, TurnStatus};
use futures::StreamExt;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ProviderConfig;
use crate::launch::{LaunchSpec, ProcessTransportFactory};
use crate::mock::MockAppServer;
use crate::provider::{AppServerProvider, TurnRequest};
use crate::stream::StreamChunk;
use crate::transport::TransportFactory;

#[derive(Debug, Parser)]
#[command(name = "codex-provider", bin_name = "codex-provider")]
#[command(about = "Stream turns from a pooled Codex app-server", version)]
pub struct Cli {
    /// JSON provider config (pool, clientInfo, requestTimeoutMs).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent binary to launch instead of `codex`.
    #[arg(long, global = true)]
    program: Option<PathBuf>,

    /// Argument for the agent binary. Repeat for more than one.
    #[arg(long = "arg", global = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Talk to the built-in scripted app-server instead of a subprocess.
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the model catalog as JSON.
    Models,
    /// Run one turn and stream the agent's reply to stdout.
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    prompt: String,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    effort: Option<String>,

    #[arg(long)]
    cwd: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl CliError {
    pub fn details(&self) -> Option<ErrorDetails> {
        match self {
            Self::Provider(err) => Some(err.to_error_details()),
            _ => None,
        }
    }
}

pub fn run_codex_provider() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_command(cli))
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Logging(err.to_string()))
}

/// Prints the structured error record to stderr, falling back to plain text.
pub fn report_error(err: &CliError) {
    tracing::error!(error = %err, "codex-provider failed");
    let rendered = err
        .details()
        .and_then(|details| serde_json::to_string_pretty(&details).ok())
        .unwrap_or_else(|| err.to_string());
    eprintln!("{rendered}");
}

fn launch_spec(cli: &Cli) -> LaunchSpec {
    match &cli.program {
        Some(program) => LaunchSpec::new(program.clone(), cli.args.clone()),
        None if cli.args.is_empty() => LaunchSpec::default(),
        None => LaunchSpec::new(crate::launch::DEFAULT_PROGRAM, cli.args.clone()),
    }
}

async fn run_command(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => ProviderConfig::from_file(path)?,
        None => ProviderConfig::default(),
    }
    .apply_env_overrides();

    let factory: Arc<dyn TransportFactory> = if cli.mock {
        Arc::new(MockAppServer::default())
    } else {
        Arc::new(ProcessTransportFactory::new(launch_spec(&cli)))
    };

    let provider = AppServerProvider::new(config, factory)?;
    let result = match &cli.command {
        Command::Models => print_models(&provider).await,
        Command::Run(args) => run_turn(&provider, args).await,
    };
    provider.shutdown();
    result
}

async fn print_models(provider: &AppServerProvider) -> Result<(), CliError> {
    let models = provider.list_models().await?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", serde_json::to_string_pretty(&models)?)?;
    Ok(())
}

async fn run_turn(provider: &AppServerProvider, args: &RunArgs) -> Result<(), CliError> {
    let mut request = TurnRequest::text(args.prompt.clone()).on_session_created(|session| {
        tracing::debug!(
            thread_id = %session.thread_id(),
            turn_id = %session.turn_id(),
            "session created"
        );
    });
    if let Some(model) = &args.model {
        request = request.model(model.clone());
    }
    if let Some(effort) = &args.effort {
        request = request.effort(effort.clone());
    }
    if let Some(cwd) = &args.cwd {
        request = request.cwd(cwd.clone());
    }

    let mut stream = provider.stream(request).await?;
    let session = stream.session().clone();
    let mut stdout = std::io::stdout();
    let mut interrupted = false;

    loop {
        tokio::select! {
            chunk = stream.next() => {
                let Some(chunk) = chunk else {
                    break;
                };
                match chunk? {
                    StreamChunk::Delta { kind: DeltaKind::AgentMessage, delta, .. } => {
                        write!(stdout, "{delta}")?;
                        stdout.flush()?;
                    }
                    StreamChunk::ServerRequest { id, method, .. } => {
                        tracing::warn!(method = %method, "declining agent request");
                        session.respond(id, Ok(json!({ "decision": "decline" }))).await?;
                    }
                    StreamChunk::Finished { status } => {
                        writeln!(stdout)?;
                        if status == TurnStatus::Interrupted {
                            tracing::info!("turn interrupted");
                        }
                    }
                    _ => {}
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                tracing::info!(turn_id = %session.turn_id(), "interrupting turn");
                // The acknowledgement is read behind the turn's own events, so
                // keep pulling the stream while it is in flight.
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(err) = session.interrupt().await {
                        tracing::warn!(error = %err, "failed to interrupt turn");
                    }
                });
            }
        }
    }
    Ok(())
}
