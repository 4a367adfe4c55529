//! `usb-device` command-line entry point.

use clap::{Parser, Subcommand};
use colored::Colorize;

use usb_device::commands;
use usb_device::config::Config;
use usb_device::monitor::{parse_send, MonitorOptions};

/// Manage named USB devices: identity, power, locks, and the display hub.
#[derive(Parser, Debug)]
#[command(name = "usb-device", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered devices and their cached status
    List,
    /// Scan live topology and rebuild the location cache
    Scan,
    /// Verify external dependencies
    Check,
    /// Show resolved topology for a device (fuzzy name match)
    Find { name: String },
    /// Show a device's type tag
    #[command(name = "type")]
    TypeTag { name: String },
    /// Print a device's serial port path on stdout
    Port { name: String },
    /// Power-cycle a device, escalating to a hub cycle if needed
    Reset {
        name: String,
        /// Skip the hub-cycle confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Restore power to a device's port
    On { name: String },
    /// Cut power to a device's port
    Off { name: String },
    /// Take the advisory lock on a device
    Checkout {
        name: String,
        /// Lock owner (default: user@host)
        #[arg(long)]
        owner: Option<String>,
        /// Free-form reason recorded with the lock
        #[arg(long)]
        purpose: Option<String>,
        /// Lock lifetime in seconds (default 1800)
        #[arg(long)]
        ttl: Option<u64>,
        /// Poll until the current holder releases
        #[arg(long)]
        wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Release the advisory lock on a device
    Checkin {
        name: String,
        /// Release even if another live process holds the lock
        #[arg(short, long)]
        force: bool,
    },
    /// List all advisory locks
    Locks,
    /// Print the tool version
    Version,
    /// Monitor a device's serial output (data on stdout, status on stderr)
    Monitor {
        /// Device name (fuzzy match) or /dev/ path
        name: String,
        #[arg(short, long, default_value_t = 115_200)]
        baud: u32,
        /// Prefix each line with a timestamp
        #[arg(short, long)]
        timestamps: bool,
        /// Exit after SECS seconds (default: run until killed)
        #[arg(long, value_name = "SECS")]
        timeout: Option<f64>,
        /// Send DATA after connecting (repeatable; prefix `@SECSx` delays)
        #[arg(long, value_name = "DATA")]
        send: Vec<String>,
    },
    /// Display-hub agent
    Hub {
        #[command(subcommand)]
        command: HubCommands,
    },
    #[command(external_subcommand)]
    Device(Vec<String>),
}

#[derive(Subcommand, Debug)]
enum HubCommands {
    /// Show hub info and channel assignments
    Status,
    /// One-shot push to the displays
    Sync,
    /// Run the display agent until signalled
    Watch,
    /// Install the agent as a systemd user service
    Install,
    /// Remove the systemd user service
    Uninstall,
    /// Follow the agent's journal
    Log,
}

async fn run(cli: Cli, config: &Config) -> anyhow::Result<()> {
    match cli.command {
        Commands::List => commands::list(config).await?,
        Commands::Scan => commands::scan(config).await?,
        Commands::Check => commands::check(config).await?,
        Commands::Find { name } => commands::find(config, &name).await?,
        Commands::TypeTag { name } => commands::type_tag(config, &name).await?,
        Commands::Port { name } => commands::port(config, &name).await?,
        Commands::Reset { name, force } => commands::reset(config, &name, force).await?,
        Commands::On { name } => commands::power_switch(config, &name, true).await?,
        Commands::Off { name } => commands::power_switch(config, &name, false).await?,
        Commands::Checkout {
            name,
            owner,
            purpose,
            ttl,
            wait,
            timeout,
        } => {
            let opts = commands::checkout_options(owner, purpose, ttl, wait, timeout);
            commands::checkout(config, &name, opts).await?
        }
        Commands::Checkin { name, force } => commands::checkin(config, &name, force).await?,
        Commands::Locks => commands::locks(config).await?,
        Commands::Version => commands::version(),
        Commands::Monitor {
            name,
            baud,
            timestamps,
            timeout,
            send,
        } => {
            let opts = MonitorOptions {
                baud,
                timestamps,
                timeout: timeout.map(std::time::Duration::from_secs_f64),
                sends: send.iter().map(|s| parse_send(s)).collect(),
            };
            commands::monitor_cmd(config, &name, opts).await?
        }
        Commands::Hub { command } => match command {
            HubCommands::Status => commands::hub_status(config).await?,
            HubCommands::Sync => commands::hub_sync(config).await?,
            HubCommands::Watch => commands::hub_watch(config).await?,
            HubCommands::Install => commands::hub_install(config).await?,
            HubCommands::Uninstall => commands::hub_uninstall().await?,
            HubCommands::Log => commands::hub_log().await?,
        },
        Commands::Device(args) => {
            let (name, actions) = args.split_first().ok_or_else(|| {
                usb_device::error::Error::Resolution("missing device name".to_string())
            })?;
            commands::device_chain(config, name, actions).await?
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if matches!(
        cli.command,
        Commands::Hub {
            command: HubCommands::Watch
        }
    ) {
        usb_device::tracing::init_agent();
    } else {
        usb_device::tracing::init_journald_or_stderr();
    }

    let config = Config::from_env();
    if let Err(e) = run(cli, &config).await {
        eprintln!("{} {e}", "error:".red());
        std::process::exit(1);
    }
}
