//! pagekeeper-mcp - MCP server for persistent browser pages
//!
//! Speaks MCP over stdio. Page ids handed out by `navigate` stay valid across
//! calls and server restarts; logs go to stderr (or `--log-file`) because
//! stdout carries the protocol.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use pagekeeper_mcp::browser::{BrowserBackend, ChromiumBackend, MemoryBackend};
use pagekeeper_mcp::config::{default_storage_dir, BrowserConfig, SessionConfig};
use pagekeeper_mcp::data::DataStore;
use pagekeeper_mcp::server::{SERVER_NAME, SERVER_VERSION};
use pagekeeper_mcp::session::SessionManager;
use pagekeeper_mcp::tools::{ToolContext, ToolRegistry};
use pagekeeper_mcp::McpServer;

/// Which automation backend serves pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Real Chromium over the DevTools protocol.
    Chromium,
    /// Simulated in-process pages, no browser required.
    Memory,
}

/// MCP server for persistent browser page automation.
#[derive(Parser, Debug)]
#[command(name = "pagekeeper-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for page state, data sessions and captured entries
    /// (default: ~/.claude_web_interaction).
    #[arg(long, env = "MCP_BROWSER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Run the browser without a window.
    #[arg(long, env = "MCP_BROWSER_HEADLESS", default_value_t = true, action = ArgAction::Set)]
    headless: bool,

    /// Chrome/Chromium executable (default: auto-detect).
    #[arg(long, env = "MCP_BROWSER_CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Budget for a single navigation, including page restoration.
    #[arg(long, default_value_t = 30_000)]
    navigation_timeout_ms: u64,

    /// How long to wait for the state file lock before proceeding without it.
    #[arg(long, default_value_t = 1_000)]
    lock_timeout_ms: u64,

    /// Record each page's outgoing requests for `get_network_requests`.
    #[arg(long, env = "MCP_CAPTURE_NETWORK")]
    capture_network: bool,

    /// Automation backend.
    #[arg(long, value_enum, default_value_t = BackendKind::Chromium)]
    backend: BackendKind,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    info!(name = SERVER_NAME, version = SERVER_VERSION, backend = ?args.backend, "starting");

    let server = match build_server(&args).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            return ExitCode::FAILURE;
        }
    };

    match server.run_stdio().await {
        Ok(()) => {
            info!("server exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Never stdout: that is the protocol channel.
    let writer = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if args.log_json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(args.log_file.is_none())
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .context("installing tracing subscriber")
}

async fn build_server(args: &Args) -> anyhow::Result<McpServer> {
    let storage_dir = args.storage_dir.clone().unwrap_or_else(default_storage_dir);
    tokio::fs::create_dir_all(&storage_dir)
        .await
        .with_context(|| format!("creating storage directory {}", storage_dir.display()))?;
    info!(storage_dir = %storage_dir.display(), "using storage directory");

    let mut session_config = SessionConfig::new(storage_dir.clone());
    session_config.navigation_timeout = Duration::from_millis(args.navigation_timeout_ms);
    session_config.lock_timeout = Duration::from_millis(args.lock_timeout_ms);
    session_config.capture_network = args.capture_network;

    let backend: Arc<dyn BrowserBackend> = match args.backend {
        BackendKind::Chromium => Arc::new(ChromiumBackend::new(BrowserConfig {
            headless: args.headless,
            chrome_path: args.chrome_path.clone(),
            ..BrowserConfig::default()
        })),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };

    let sessions = Arc::new(SessionManager::open(&session_config, backend).await);
    let data = Arc::new(
        DataStore::open(&storage_dir)
            .await
            .context("opening data store")?,
    );

    let context = ToolContext::new(sessions, data)
        .with_navigation_timeout(session_config.navigation_timeout);
    Ok(McpServer::new(ToolRegistry::new(context)))
}
