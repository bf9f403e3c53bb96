use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use mailwarden::config::Config;
use mailwarden::server;

#[derive(Parser)]
#[command(name = "mailwarden", version)]
#[command(about = "An IMAP sidecar for advanced inbox filtering")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// Path to config file
    #[arg(short, long, default_value = "mailwarden.toml")]
    config: String,

    /// Show what would be done without actually doing it
    #[arg(long)]
    dry_run: bool,

    /// Show debug output
    #[arg(long)]
    debug: bool,

    /// Only show errors in output
    #[arg(long, conflicts_with = "debug")]
    errors_only: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run once to process messages
    Once {
        #[command(flatten)]
        common: CommonArgs,

        /// Comma-separated list of UIDs to process (default: all unread)
        #[arg(long)]
        uids: Option<String>,
    },

    /// Run in server mode
    Server {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// List mailboxes
    ListMailboxes {
        /// Path to config file
        #[arg(short, long, default_value = "mailwarden.toml")]
        config: String,

        /// Show debug output
        #[arg(long)]
        debug: bool,
    },
}

fn init_tracing(debug: bool, errors_only: bool) {
    let default_level = if debug {
        "debug"
    } else if errors_only {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse a comma-separated UID list.
fn parse_uids(raw: &str) -> anyhow::Result<HashSet<u32>> {
    let mut uids = HashSet::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let uid: u32 = part.parse().with_context(|| format!("invalid UID {part:?}"))?;
        uids.insert(uid);
    }
    Ok(uids)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();
    match cli.command {
        Command::Once { common, uids } => {
            init_tracing(common.debug, common.errors_only);
            let config = Config::load(&common.config).context("parse config")?;
            let uid_filter = uids.as_deref().map(parse_uids).transpose()?;
            server::run_once_command(Arc::new(config), uid_filter, common.dry_run)
                .await
                .context("process messages")?;
        }
        Command::Server { common } => {
            init_tracing(common.debug, common.errors_only);
            let config = Config::load(&common.config).context("parse config")?;
            server::run_server(config, common.dry_run)
                .await
                .context("run server")?;
        }
        Command::ListMailboxes { config, debug } => {
            init_tracing(debug, false);
            let config = Config::load(&config).context("parse config")?;
            server::run_list_mailboxes(Arc::new(config))
                .await
                .context("list mailboxes")?;
        }
    }
    Ok(())
}
