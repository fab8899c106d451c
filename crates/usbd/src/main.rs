//! usbd-host
//!
//! USB host driver daemon. Tracks attached devices through libusb hot-plug
//! and reports attach/detach events until interrupted.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{EventBridge, UsbdEvent, create_event_bridge, setup_logging};
use protocol::DeviceAction;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use usbd::usb::{HostController, RusbController, spawn_hotplug_worker};
use usbd::{ChannelSubscriber, UsbdConfig, UsbdService};

#[derive(Parser, Debug)]
#[command(name = "usbd-host")]
#[command(author, version, about = "USB host driver service")]
#[command(long_about = "
Manages attached USB devices: tracks hot-plug, keeps per-device request
pools and reports device events.

EXAMPLES:
    # Run with default config
    usbd-host

    # List USB devices and exit
    usbd-host --list-devices

    # Run with debug logging
    usbd-host --log-level debug

CONFIGURATION:
    The service looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbd-host/usbd.toml
    3. /etc/usbd-host/usbd.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = UsbdConfig::default();
        let path = UsbdConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        let path = usbd::config::expand_path(&path.to_string_lossy());
        UsbdConfig::load(Some(path)).context("Failed to load configuration")?
    } else {
        UsbdConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.service.log_level);
    setup_logging(log_level, config.service.log_format).context("Failed to setup logging")?;

    info!("usbd-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let controller = Arc::new(
        RusbController::new(config.usb.filters.clone())
            .map_err(|e| anyhow!("Failed to initialize libusb: {}", e))?,
    );

    if args.list_devices {
        return list_devices(controller.as_ref());
    }

    run_service(config, controller).await
}

/// List USB devices and exit
fn list_devices(controller: &dyn HostController) -> Result<()> {
    let devices = controller
        .enumerate()
        .map_err(|e| anyhow!("Failed to enumerate devices: {}", e))?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  Bus {:03} Device {:03}: {:04x}:{:04x} class {:#04x}{}",
            device.bus_num,
            device.dev_addr,
            device.vendor_id,
            device.product_id,
            device.device_class,
            if device.is_hub() { " (hub)" } else { "" }
        );
    }
    Ok(())
}

async fn run_service(config: UsbdConfig, controller: Arc<RusbController>) -> Result<()> {
    let context = controller.context().clone();
    let service = Arc::new(UsbdService::new(controller, config.service_options()));

    let (bridge, sink) = create_event_bridge();
    service
        .bind_subscriber(Arc::new(ChannelSubscriber::new(sink)))
        .map_err(|e| anyhow!("Failed to bind subscriber: {}", e))?;

    let worker = spawn_hotplug_worker(
        service.clone(),
        context,
        config.usb.filters.clone(),
        config.usb.event_poll(),
    )
    .context("Failed to spawn hot-plug worker")?;

    info!("Press Ctrl+C to shutdown");
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
        () = log_events(bridge) => warn!("Event channel closed"),
    }

    worker.shutdown();
    if let Err(e) = service.unbind_subscriber() {
        warn!("Failed to unbind subscriber: {}", e);
    }
    service.shutdown();

    info!("Service shutdown complete");
    Ok(())
}

/// Log subscriber events until the channel closes
async fn log_events(bridge: EventBridge) {
    while let Ok(event) = bridge.recv_event().await {
        match event {
            UsbdEvent::Device(info) => match info.action {
                DeviceAction::DevUp => info!("Device {:03}:{:03} attached", info.bus_num, info.dev_addr),
                DeviceAction::DevDown => info!("Device {:03}:{:03} removed", info.bus_num, info.dev_addr),
                DeviceAction::UpDevice => info!("Gadget function up"),
                DeviceAction::DownDevice => info!("Gadget function down"),
            },
            UsbdEvent::Port(port) => info!(
                "Port {} changed: power role {}, data role {}, mode {}",
                port.port_id, port.power_role, port.data_role, port.mode
            ),
        }
    }
}
