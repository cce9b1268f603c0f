use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tern_tftp::{SessionConfig, TftpClient, TransferMode};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tern-tftp-client", about = "Fetch or store a file over TFTP", long_about = None)]
struct Cli {
    /// TFTP server address (e.g., 192.168.1.100:69)
    #[arg(short, long)]
    server: SocketAddr,

    /// Transfer mode (octet or netascii)
    #[arg(short, long, default_value = "octet")]
    mode: String,

    /// Retransmission timeout in milliseconds
    #[arg(short, long, default_value_t = 500)]
    timeout_ms: u64,

    /// Retransmissions per packet before giving up
    #[arg(short = 'r', long, default_value_t = 3)]
    max_retries: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a file from the server
    Get {
        /// Remote filename
        remote: String,
        /// Destination path (defaults to the remote name)
        local: Option<PathBuf>,
    },
    /// Upload a file to the server
    Put {
        /// Source path
        local: PathBuf,
        /// Remote filename (defaults to the local file name)
        remote: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let mode: TransferMode = cli.mode.parse()?;
    if mode == TransferMode::Mail {
        bail!("mail mode is not supported");
    }

    let client = TftpClient::new(cli.server)
        .with_mode(mode)
        .with_session_config(SessionConfig::new(
            Duration::from_millis(cli.timeout_ms),
            cli.max_retries,
        ));

    match cli.command {
        Command::Get { remote, local } => {
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));
            let data = client
                .get(&remote)
                .await
                .with_context(|| format!("Failed to fetch {}", remote))?;
            tokio::fs::write(&local, &data)
                .await
                .with_context(|| format!("Failed to write {}", local.display()))?;
            info!("Saved {} bytes to {}", data.len(), local.display());
        }
        Command::Put { local, remote } => {
            let remote = match remote {
                Some(remote) => remote,
                None => local
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(String::from)
                    .with_context(|| format!("Cannot derive a remote name from {}", local.display()))?,
            };
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let stats = client
                .put(&remote, data)
                .await
                .with_context(|| format!("Failed to store {}", remote))?;
            info!("Sent {} bytes in {} blocks", stats.bytes, stats.blocks);
        }
    }

    Ok(())
}
