use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tern_tftp::{
    DirectoryHandler, LogFormat, LoggingConfig, Result, TftpConfig, TftpError, TftpServer,
    load_config, validate_config, write_config,
};
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tern-tftp-server", about = "Standalone TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/tern/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Retransmission timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Retransmissions per packet before a session is aborted
    #[arg(long)]
    max_retries: Option<u32>,

    /// Accept write requests
    #[arg(long)]
    allow_write: bool,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

/// Build the subscriber from `[logging]`. The guard must live as long as the
/// process when logging to a file, or buffered lines are lost on exit.
fn init_logging(logging: &LoggingConfig) -> Result<(Dispatch, Option<WorkerGuard>)> {
    let filter = EnvFilter::try_new(&logging.level)
        .map_err(|e| TftpError::Config(format!("Invalid logging.level: {}", e)))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let Some(log_file) = &logging.file else {
        let dispatch = match logging.format {
            LogFormat::Text => Dispatch::new(builder.finish()),
            LogFormat::Json => Dispatch::new(builder.json().finish()),
        };
        return Ok((dispatch, None));
    };

    let dir = match log_file.parent() {
        Some(path) => path,
        None => std::path::Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TftpError::Config("logging.file must include a file name".to_string()))?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let builder = builder.with_writer(non_blocking).with_ansi(false);
    let dispatch = match logging.format {
        LogFormat::Text => Dispatch::new(builder.finish()),
        LogFormat::Json => Dispatch::new(builder.json().finish()),
    };
    Ok((dispatch, Some(guard)))
}

/// Run the server until Ctrl-C, with every log line going to `log`.
async fn serve(config: TftpConfig, log: Dispatch) -> Result<()> {
    let handler = Arc::new(DirectoryHandler::from_config(&config));
    info!(
        root_dir = %config.root_dir.display(),
        write_enabled = config.write.enabled,
        "Serving files"
    );

    let server = TftpServer::new(config.bind_addr, handler)
        .with_session_config(config.session)
        .with_log(log);

    let shutdown = server.shutdown_token();
    tokio::spawn(
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        }
        .with_current_subscriber(),
    );

    server.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.session.timeout_ms = timeout_ms;
    }
    if let Some(max_retries) = cli.max_retries {
        config.session.max_retries = max_retries;
    }
    if cli.allow_write {
        config.write.enabled = true;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config, true)?;

    let (log, _log_guard) = init_logging(&config.logging)?;
    serve(config, log.clone()).with_subscriber(log).await
}
