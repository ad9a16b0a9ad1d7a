//! peercam node: entry point.
//!
//! ```text
//! peercam-node advertise [--save <path>]          Accept invitations, log payloads
//! peercam-node browse --image <path> [--interval <secs>] [--peer <label>]
//!                                                 Stream an image file to a peer
//! peercam-node --config <path> ...                Load a custom config TOML
//! peercam-node --gen-config                       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peercam_node::config::NodeFileConfig;
use peercam_node::service::{Mode, NodeService};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "peercam-node", about = "Discover nearby peers and stream captures between them")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "peercam.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Label shown to other nodes. Defaults to the host name.
    #[arg(short, long)]
    label: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce this node and accept every invitation.
    Advertise {
        /// Write each received payload to this file.
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Find an advertiser and stream an image file to it.
    Browse {
        /// Image file re-read on every tick.
        #[arg(long)]
        image: PathBuf,
        /// Seconds between sends (1-60).
        #[arg(long)]
        interval: Option<u64>,
        /// Only contact the advertiser with this label.
        #[arg(long)]
        peer: Option<String>,
    },
}

impl From<Command> for Mode {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Advertise { save } => Mode::Advertise { save },
            Command::Browse {
                image,
                interval,
                peer,
            } => Mode::Browse {
                image,
                interval,
                peer,
            },
        }
    }
}

fn default_label() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "peercam".into())
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&NodeFileConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let Some(command) = cli.command else {
        eprintln!("choose a mode: `advertise` or `browse` (see --help)");
        std::process::exit(2);
    };

    // Load config.
    let config = NodeFileConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("peercam-node v{}", env!("CARGO_PKG_VERSION"));
    info!("service type: {}", config.discovery.service_type);
    info!("announce address: {}", config.network.announce_addr);

    let label = cli.label.unwrap_or_else(default_label);
    let service = NodeService::new(config, label, command.into());
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
