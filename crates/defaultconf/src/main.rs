//! defaultconf entry point
//!
//! `defaultconf daemon` runs the selection daemon; the other subcommands
//! edit the registration store and signal the daemon, for handlers that
//! register from hook scripts.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use defaultconf::{
    AddressFamily, DEFAULT_CONFIG_PATH, DaemonConfig, NetlinkChannel, ProtocolTag,
    RegistrationStore, Selector, daemon, status,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Default route selection daemon
#[derive(Parser, Debug)]
#[command(name = "defaultconf")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the selection daemon
    Daemon,
    /// Ask a running daemon to reload the registration store
    SignalDaemon,
    /// Register a default gateway
    Add {
        #[arg(short = 'f', long = "af")]
        af: AddressFamily,
        #[arg(short = 'i', long = "link")]
        link: String,
        #[arg(short = 'p', long)]
        protocol: ProtocolTag,
        /// Local address the gateway depends on
        #[arg(short = 's', long)]
        source: Option<IpAddr>,
        addr: IpAddr,
    },
    /// Withdraw matching gateways
    Remove(Filter),
    /// Print the best stored gateway for the filter
    GetDefault(Filter),
    /// Disable matching gateways without withdrawing them
    Disable(Filter),
    /// Re-enable gateways disabled by an equal or narrower filter
    Enable(Filter),
    /// Print kernel state, candidates and decisions as JSON
    Status,
}

#[derive(ClapArgs, Debug)]
struct Filter {
    #[arg(short = 'f', long = "af")]
    af: Option<AddressFamily>,
    #[arg(short = 'i', long = "link")]
    link: Option<String>,
    #[arg(short = 'p', long)]
    protocol: Option<ProtocolTag>,
}

impl From<Filter> for Selector {
    fn from(filter: Filter) -> Self {
        Selector::new(filter.af, filter.link, filter.protocol)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("defaultconf: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("defaultconf: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = DaemonConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    match args.command {
        Command::Daemon => {
            config.validate().context("Invalid configuration")?;
            info!("Starting defaultconf");
            daemon::run(args.config, config).await?;
        }
        Command::SignalDaemon => {
            daemon::signal_running_daemon(&config)?;
        }
        Command::Add {
            af,
            link,
            protocol,
            source,
            addr,
        } => {
            RegistrationStore::update(&config, |store| {
                let gateway = store.add(af, &link, protocol, addr, source)?;
                info!(version = gateway.version, "Registered {} via {} dev {}", af, addr, link);
                Ok(())
            })?;
        }
        Command::Remove(filter) => {
            let selector = Selector::from(filter);
            let removed = RegistrationStore::update(&config, |store| Ok(store.remove(&selector)))?;
            info!(removed, filter = %selector, "Removed gateways");
        }
        Command::GetDefault(filter) => {
            let selector = Selector::from(filter);
            let store = RegistrationStore::load(&config.state_path)?;
            match store.get_default(&selector, &config.priority_policy()) {
                Some(gateway) => println!("{}", serde_json::to_string(gateway)?),
                None => return Ok(ExitCode::FAILURE),
            }
        }
        Command::Disable(filter) => {
            let selector = Selector::from(filter);
            RegistrationStore::update(&config, |store| Ok(store.disable(selector)))?;
        }
        Command::Enable(filter) => {
            let selector = Selector::from(filter);
            let enabled = RegistrationStore::update(&config, |store| Ok(store.enable(&selector)))?;
            info!(enabled, filter = %selector, "Enabled gateways");
        }
        Command::Status => {
            let mut channel = NetlinkChannel::open(config.request_timeout())?;
            let report = status::query(&mut channel, &config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}
