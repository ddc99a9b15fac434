//! HTTP binary for edgequake-md-service.
//!
//! A thin shim over the library crate that maps flags and environment
//! variables to `ServiceConfig`, starts the task manager and serves the
//! HTTP surface until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_md_service::{server, ServiceConfig, TaskManager};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  Start with defaults (./data, port 8080):
    md-service

  Submit a PDF and ask for image descriptions:
    curl -F file=@report.pdf -F webhook_url=https://example.com/hook \
         'http://localhost:8080/tasks?describe_images=true'

  Poll, then fetch the Markdown:
    curl http://localhost:8080/tasks/<id>
    curl http://localhost:8080/tasks/<id>/files/<id>.md

IMAGE DESCRIPTIONS:
  The provider is taken from EDGEQUAKE_LLM_PROVIDER + EDGEQUAKE_MODEL, or
  detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY. With no
  provider, images are extracted and referenced but not described.

PDF ENGINE:
  Point PDFIUM_LIB_PATH at the directory holding libpdfium, or install it
  system-wide.
"#;

/// Asynchronous document-to-Markdown task service.
#[derive(Parser, Debug)]
#[command(
    name = "md-service",
    version,
    about = "Asynchronous document-to-Markdown task service",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Directory holding `tasks/<id>/`.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Largest accepted upload in bytes.
    #[arg(long, env = "MAX_UPLOAD_SIZE", default_value_t = 500 * 1024 * 1024)]
    max_upload_size: u64,

    /// Tasks converted at the same time.
    #[arg(long, env = "MAX_CONCURRENT_TASKS", default_value_t = 2)]
    max_concurrent_tasks: usize,

    /// Image description calls in flight across all tasks.
    #[arg(long, env = "MAX_CONCURRENT_DESCRIPTIONS", default_value_t = 5)]
    max_concurrent_descriptions: usize,

    /// Attempts per image description.
    #[arg(long, env = "DESCRIPTION_MAX_RETRIES", default_value_t = 3)]
    description_max_retries: u32,

    /// Base backoff between description attempts.
    #[arg(long, env = "DESCRIPTION_RETRY_DELAY_MS", default_value_t = 1000)]
    description_retry_delay_ms: u64,

    /// Per-call timeout for the vision model.
    #[arg(long, env = "API_TIMEOUT_SECS", default_value_t = 60)]
    api_timeout: u64,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Vision model ID (e.g. gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Directory containing the pdfium shared library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Per-attempt webhook timeout.
    #[arg(long, env = "WEBHOOK_TIMEOUT_SECS", default_value_t = 10)]
    webhook_timeout: u64,

    /// Attempts per webhook delivery.
    #[arg(long, env = "WEBHOOK_MAX_RETRIES", default_value_t = 3)]
    webhook_max_retries: u32,

    /// Base backoff between webhook attempts.
    #[arg(long, env = "WEBHOOK_RETRY_DELAY_MS", default_value_t = 5000)]
    webhook_retry_delay_ms: u64,

    /// Seconds between retention sweeps.
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value_t = 900)]
    cleanup_interval: u64,

    /// Hours a finished task is kept.
    #[arg(long, env = "RETENTION_HOURS", default_value_t = 24)]
    retention_hours: u64,

    /// Enable debug logging.
    #[arg(short, long, env = "MD_SERVICE_VERBOSE")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, env = "MD_SERVICE_QUIET", conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    let manager = TaskManager::start(config)
        .await
        .context("Failed to start task manager")?;

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", cli.host, cli.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}");

    server::serve(listener, manager.clone(), shutdown_signal())
        .await
        .context("HTTP server failed")?;

    manager.shutdown().await;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::builder()
        .data_dir(&cli.data_dir)
        .max_upload_size(cli.max_upload_size)
        .max_concurrent_tasks(cli.max_concurrent_tasks)
        .max_concurrent_descriptions(cli.max_concurrent_descriptions)
        .description_max_retries(cli.description_max_retries)
        .retry_base_delay_ms(cli.description_retry_delay_ms)
        .api_timeout_secs(cli.api_timeout)
        .webhook_timeout_secs(cli.webhook_timeout)
        .webhook_max_retries(cli.webhook_max_retries)
        .webhook_retry_delay_ms(cli.webhook_retry_delay_ms)
        .cleanup_interval_secs(cli.cleanup_interval)
        .retention_hours(cli.retention_hours);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = cli.pdfium_lib_path {
        builder = builder.pdfium_lib_path(path);
    }

    builder.build().context("Invalid configuration")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
