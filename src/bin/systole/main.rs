// Command line front end: pick and pair a cuff, then log its readings

mod logging;
mod menu;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::time::Duration;
use tracing::info;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use systole::{
    select_strategy, BtleplugTransport, CaptureOutcome, ConfigStore, ConnectionSupervisor,
    CsvSink, PairingOutcome, Settings,
};

type Supervisor = ConnectionSupervisor<BtleplugTransport>;

#[derive(Parser)]
#[command(name = "systole", version, about = "Log readings of a bluetooth blood pressure monitor")]
struct Cli {
    /// JSON settings file, defaults are used when not given
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List nearby devices
    Scan {
        /// Seconds to scan, defaults to the configured scan timeout
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Pair with a device and remember it. Without an address, scan and choose.
    Pair {
        address: Option<String>,
        #[arg(long)]
        pin: Option<String>,
    },
    /// Keep the device connected and store every reading until Ctrl-C
    Run {
        /// Defaults to the paired device
        #[arg(long)]
        address: Option<String>,
    },
    /// Store the readings sent within one window, then exit
    Capture {
        /// Defaults to the paired device
        #[arg(long)]
        address: Option<String>,
        /// Seconds to listen, defaults to the configured capture window
        #[arg(long)]
        window: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => Settings::load(path)
            .with_context(|| format!("could not read settings from {}", path.display()))?,
        None => Settings::from_env(),
    };
    let _logging = logging::init_logger(&settings.log)?;
    let settings = Arc::new(settings);

    let transport = Arc::new(BtleplugTransport::new().await?);
    let sink = Arc::new(CsvSink::new(settings.records_path()));
    let pairing = select_strategy(&settings, transport.clone());
    let supervisor = Arc::new(ConnectionSupervisor::new(
        transport,
        sink,
        pairing,
        settings.clone(),
    ));
    let store = ConfigStore::new(settings.config_path());

    match cli.command {
        Command::Scan { timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.scan_timeout());
            scan(&supervisor, timeout).await
        }
        Command::Pair { address, pin } => {
            pair(&supervisor, &store, &settings, address, pin).await
        }
        Command::Run { address } => {
            let address = paired_address(&store, address)?;
            let handle = supervisor.start(&address);

            tokio::signal::ctrl_c().await?;
            info!("Stopping");
            handle.stop().await;
            Ok(())
        }
        Command::Capture { address, window } => {
            let address = paired_address(&store, address)?;
            let window = window
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.capture_window());

            match supervisor.capture(&address, window).await? {
                CaptureOutcome::Received { decoded, rejected } => {
                    println!("Stored {} readings ({} undecodable)", decoded, rejected)
                }
                CaptureOutcome::NoData => println!("No data received"),
            }
            Ok(())
        }
    }
}

async fn scan(supervisor: &Supervisor, timeout: Duration) -> anyhow::Result<()> {
    println!("Scanning for {:?}...", timeout);
    let devices = supervisor.discover(timeout).await?;

    if devices.is_empty() {
        println!("No devices found");
    }
    for device in devices {
        println!("{}", device);
    }
    Ok(())
}

async fn pair(
    supervisor: &Supervisor,
    store: &ConfigStore,
    settings: &Settings,
    address: Option<String>,
    pin: Option<String>,
) -> anyhow::Result<()> {
    let address = match address {
        Some(address) => address,
        None => {
            println!("Scanning...");
            let devices = supervisor.discover(settings.scan_timeout()).await?;
            if devices.is_empty() {
                println!("No devices found");
                return Ok(());
            }

            let stdin = io::stdin();
            match menu::choose_device(&devices, &mut stdin.lock(), &mut io::stdout())? {
                Some(device) => device.address.clone(),
                None => return Ok(()),
            }
        }
    };

    println!("Pairing with {}...", address);
    let mut outcome = supervisor.pair(&address, pin.as_deref()).await;

    // The device may want a PIN nobody gave yet, ask once
    if outcome == PairingOutcome::Rejected && pin.is_none() {
        let stdin = io::stdin();
        let pin = menu::prompt(
            "Pairing failed. PIN (Enter to give up): ",
            &mut stdin.lock(),
            &mut io::stdout(),
        )?;
        if !pin.is_empty() {
            outcome = supervisor.pair(&address, Some(&pin)).await;
        }
    }

    match outcome {
        PairingOutcome::Paired => {
            store.remember_device(&address)?;
            println!("Device {} saved to {}", address, store.path().display());
            Ok(())
        }
        other => bail!("pairing with {} failed: {}", address, other),
    }
}

fn paired_address(store: &ConfigStore, address: Option<String>) -> anyhow::Result<String> {
    if let Some(address) = address {
        return Ok(address);
    }

    store
        .load()?
        .device_address
        .context("no device paired yet, run `systole pair` first")
}
