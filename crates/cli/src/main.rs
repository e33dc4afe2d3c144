//! usb-detect
//!
//! Lists connected USB devices and streams hot-plug events.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{DeviceFilter, DeviceRecord, parse_hex_id, setup_logging};
use detection::{NotificationKind, UsbDetection};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use usb_detect::config::{CliConfig, expand_path};
use usb_detect::output;

#[derive(Parser, Debug)]
#[command(name = "usb-detect")]
#[command(
    author,
    version,
    about = "USB device detection - list devices and watch hot-plug events"
)]
#[command(long_about = "
Lists the USB devices connected to this machine and reports devices as they
are plugged in and removed.

EXAMPLES:
    # List every device
    usb-detect find

    # List Logitech devices as JSON
    usb-detect find --vendor-id 0x046d --json

    # Stream add/remove events until Ctrl+C
    usb-detect monitor

    # Write the default configuration file
    usb-detect --save-config

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-detect/config.toml
    3. /etc/usb-detect/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected devices (the default)
    Find {
        /// Only devices with this vendor id (hex)
        #[arg(long, value_name = "HEX", value_parser = parse_hex_id)]
        vendor_id: Option<u16>,

        /// Only devices with this product id (hex)
        #[arg(long, value_name = "HEX", value_parser = parse_hex_id)]
        product_id: Option<u16>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print current devices, then stream add/remove events until Ctrl+C
    Monitor {
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CliConfig::default();
        let path = CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        CliConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-detect v{}", env!("CARGO_PKG_VERSION"));

    let usb = UsbDetection::with_libusb(config.watcher.clone())
        .context("Failed to initialize USB detection")?;

    match args.command.unwrap_or(Command::Find {
        vendor_id: None,
        product_id: None,
        json: false,
    }) {
        Command::Find {
            vendor_id,
            product_id,
            json,
        } => find_mode(&usb, DeviceFilter::new(vendor_id, product_id), json).await,
        Command::Monitor { json } => monitor_mode(&usb, json).await,
    }
}

async fn find_mode(usb: &UsbDetection, filter: DeviceFilter, json: bool) -> Result<()> {
    info!("Searching for devices matching {}", filter);

    let devices = usb
        .find(filter)
        .await
        .context("Failed to enumerate USB devices")?;

    if json {
        println!("{}", output::devices_json(&devices)?);
    } else {
        print_listing(&devices);
    }
    Ok(())
}

async fn monitor_mode(usb: &UsbDetection, json: bool) -> Result<()> {
    usb.register_added(move |device| print_event(NotificationKind::Added, device, json));
    usb.register_removed(move |device| print_event(NotificationKind::Removed, device, json));

    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<String>();
    usb.register_error(move |message| {
        let _ = failure_tx.send(message.to_string());
    });

    usb.start_monitoring()
        .context("Failed to start monitoring")?;

    let devices = usb.devices();
    if json {
        for device in &devices {
            println!("{}", output::device_json(device)?);
        }
    } else {
        print_listing(&devices);
        println!("Watching for changes, press Ctrl+C to stop.\n");
    }

    let result = tokio::select! {
        signal = signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                Ok(())
            }
            Err(e) => Err(anyhow!(e).context("Error waiting for Ctrl+C")),
        },
        Some(message) = failure_rx.recv() => Err(anyhow!("Monitoring failed: {}", message)),
    };

    usb.stop_monitoring()
        .context("Failed to stop monitoring")?;
    info!("Monitoring stopped");
    result
}

fn print_listing(devices: &[DeviceRecord]) {
    if devices.is_empty() {
        println!("No USB devices found.");
        return;
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!("{}\n", output::device_block(device));
    }
}

fn print_event(kind: NotificationKind, device: &DeviceRecord, json: bool) {
    if json {
        match output::event_json(kind, device) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize event for {}: {}", device.key(), e),
        }
    } else {
        println!("{}", output::event_line(kind, device));
    }
}
