//! echotun CLI
//!
//! Command-line interface for running the ICMP tunnel relay and managing
//! its settings file.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use echotun_daemon::RelayService;
use echotun_settings::{default_settings_path, Settings};

/// echotun - IP over ICMP Echo
#[derive(Parser)]
#[command(name = "echotun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (needs root or CAP_NET_RAW + CAP_NET_ADMIN)
    Relay(RelayArgs),

    /// Manage the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags overriding the settings file
#[derive(Args)]
struct RelayArgs {
    /// Tunnel network, the relay takes .1
    #[arg(short, long)]
    network: Option<Ipv4Addr>,

    /// Shared passphrase
    #[arg(short, long)]
    passphrase: Option<String>,

    /// TUN device MTU
    #[arg(short, long)]
    mtu: Option<u16>,

    /// TUN device name
    #[arg(short, long)]
    device: Option<String>,

    /// Outbound rate limit in kbit/s (0 disables)
    #[arg(long)]
    rate_kbps: Option<u32>,

    /// Answer ordinary pings
    #[arg(long)]
    answer_echo: bool,

    /// Do not listen for ICMPv6
    #[arg(long)]
    no_ipv6: bool,

    /// Do not listen for ICMP over IPv4
    #[arg(long)]
    no_ipv4: bool,

    /// Switch to this user id after setup
    #[arg(short, long)]
    user_id: Option<u32>,

    /// Switch to this group id after setup
    #[arg(short, long)]
    group_id: Option<u32>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a settings file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective settings
    Show,
}

impl RelayArgs {
    fn apply(self, settings: &mut Settings) {
        let tunnel = &mut settings.tunnel;
        if let Some(network) = self.network {
            tunnel.network = network;
        }
        if let Some(mtu) = self.mtu {
            tunnel.mtu = mtu;
        }
        if let Some(device) = self.device {
            tunnel.device = Some(device);
        }
        if let Some(rate_kbps) = self.rate_kbps {
            tunnel.rate_kbps = rate_kbps;
        }
        if self.answer_echo {
            tunnel.answer_echo = true;
        }
        if self.no_ipv4 {
            tunnel.ipv4 = false;
        }
        if self.no_ipv6 {
            tunnel.ipv6 = false;
        }
        if let Some(passphrase) = self.passphrase {
            settings.auth.passphrase = Some(passphrase);
        }
        if let Some(user_id) = self.user_id {
            settings.process.user_id = Some(user_id);
        }
        if let Some(group_id) = self.group_id {
            settings.process.group_id = Some(group_id);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    echotun_logging::init(cli.verbose);

    let path = cli.config.unwrap_or_else(default_settings_path);

    match cli.command {
        Commands::Relay(args) => {
            run_relay(&path, args).await?;
        }
        Commands::Config { action } => {
            config(&path, action)?;
        }
    }

    Ok(())
}

// ============================================================================
// Relay
// ============================================================================

async fn run_relay(path: &Path, args: RelayArgs) -> Result<()> {
    let mut settings = Settings::load_from(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    info!("Starting echotun relay on {}/24...", settings.tunnel.network);
    let service = RelayService::open(&settings).context("Failed to start relay")?;
    service
        .run_until_shutdown()
        .await
        .context("Relay terminated")?;
    Ok(())
}

// ============================================================================
// Settings
// ============================================================================

fn config(path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            Settings::default()
                .save_to(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default settings to {}", path.display());
        }
        ConfigAction::Show => {
            let mut settings = Settings::load_from(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?;
            if settings.auth.passphrase.is_some() {
                settings.auth.passphrase = Some("<redacted>".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}
