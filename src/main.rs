use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ipwatch::{WatchConfig, Watcher};

/// Run hooks when network interfaces gain new IP addresses.
#[derive(Parser, Debug)]
#[command(name = "ipwatch", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// The maximum number of attempts that will be made for a failing hook
    #[arg(long, default_value_t = 3, value_name = "N")]
    max_retries: u32,

    /// Watch only for IPv4 address changes
    #[arg(short = '4', long = "ipv4")]
    ipv4: bool,

    /// Watch only for IPv6 address changes
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,

    /// Condition that must hold before hooks run, e.g. "IsGlobalUnicast" or
    /// "!IsLoopback"; repeatable
    #[arg(long = "filter", value_name = "NAME")]
    filters: Vec<String>,

    /// Hook to run on a new address ("internal:echo" or
    /// "executable:<path>"); repeatable
    #[arg(long = "hook", value_name = "SPEC")]
    hooks: Vec<String>,

    /// Name of an interface to watch (default: all interfaces); repeatable
    #[arg(long = "interface", value_name = "NAME")]
    interfaces: Vec<String>,

    /// File of KEY=VALUE pairs added to every executable hook's environment
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = WatchConfig {
        interfaces: cli.interfaces,
        filters: cli.filters,
        hooks: cli.hooks,
        ipv4_only: cli.ipv4,
        ipv6_only: cli.ipv6,
        max_retries: cli.max_retries,
        env_file: cli.env_file,
    };

    // Configuration errors surface here, before the watch loop starts.
    let watcher = Watcher::new(config)?;
    watcher.watch().await?;
    Ok(())
}
