use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use sb01_tuning::{read_tun_file, TuningRange};
use sb01_usb::devices::{find_devices, DeviceLink, LibUsbLink};
use sb01_usb::events::{DeviceEvent, EventHub};
use sb01_usb::register::{RegisterAddress, RegisterValue};
use sb01_usb::session::{ConnectionSession, SessionOptions, StreamMode};
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use crate::cli::{Cli, Payload, SubCommands};
use crate::settings::Settings;

mod cli;
mod settings;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        args.log_level.into(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;

    let mut settings = Settings::read(&args.config)?;
    settings.apply_overrides(&args);

    match &args.command {
        SubCommands::List => list(&settings),
        SubCommands::Tuning {
            file,
            start_note,
            end_note,
            json,
        } => tuning(file, *start_note, *end_note, *json),
        SubCommands::Read { address } => {
            let address = RegisterAddress::try_from(*address)?;
            let mut session = open_session(&args, &settings, registers_only())?;
            session.connect().await?;

            let result = session.read_register(address.get()).await;
            session.disconnect().await?;

            let value = result?;
            println!("{:#04x} = {} ({:#06x})", address.get(), value, value);
            Ok(())
        }
        SubCommands::Write { address, value } => {
            let address = RegisterAddress::try_from(*address)?;
            let value = RegisterValue::try_from(*value)?;
            let mut session = open_session(&args, &settings, registers_only())?;
            session.connect().await?;

            let result = session.write_register(address.get(), value.get()).await;
            session.disconnect().await?;

            result?;
            info!("Wrote {:#06x} to register {:#04x}", value.get(), address.get());
            Ok(())
        }
        SubCommands::Monitor { count } => {
            let mut session = open_session(&args, &settings, settings.session_options())?;
            let result = monitor(&mut session, *count).await;
            session.disconnect().await?;
            result
        }
        SubCommands::Send { payload } => {
            let mut session = open_session(&args, &settings, settings.session_options())?;
            let result = send(&mut session, payload).await;
            session.disconnect().await?;
            result
        }
    }
}

fn registers_only() -> SessionOptions {
    SessionOptions {
        register: true,
        stream: StreamMode::Disabled,
    }
}

fn open_session(args: &Cli, settings: &Settings, options: SessionOptions) -> Result<ConnectionSession> {
    let timeouts = settings.timeouts();
    let link = match (args.location, settings.device_filter()) {
        (Some((bus, address)), _) => LibUsbLink::from_location(bus, address, timeouts)
            .with_context(|| format!("No device at bus {} address {}", bus, address))?,
        (None, Some((vendor_id, product_id))) => {
            LibUsbLink::first_matching(vendor_id, product_id, timeouts).with_context(|| {
                format!("No device found with id {:04x}:{:04x}", vendor_id, product_id)
            })?
        }
        (None, None) => {
            bail!("No device selected, set --vendor-id and --product-id or --location")
        }
    };

    let link: Arc<dyn DeviceLink> = Arc::new(link);
    Ok(ConnectionSession::with_events(
        link,
        options,
        EventHub::new(settings.event_capacity),
    ))
}

fn list(settings: &Settings) -> Result<()> {
    let devices = find_devices(settings.device_filter());
    if devices.is_empty() {
        info!("No matching devices found");
        return Ok(());
    }

    for device in devices {
        let (major, minor, sub) = device.device_version();
        println!(
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} v{}.{}.{} {}",
            device.bus_number(),
            device.address(),
            device.vendor_id(),
            device.product_id(),
            major,
            minor,
            sub,
            device.product_name().unwrap_or("")
        );
    }
    Ok(())
}

fn tuning(file: &Path, start_note: u8, end_note: u8, json: bool) -> Result<()> {
    let range = TuningRange::new(start_note, end_note)?;
    let offsets = read_tun_file(file, range)
        .with_context(|| format!("Could not read tuning file {}", file.to_string_lossy()))?;

    if json {
        println!("{}", serde_json::to_string(&offsets)?);
        return Ok(());
    }

    for (note, offset) in (range.start()..=range.end()).zip(offsets) {
        println!("{:>3} {:+}", note, offset);
    }
    Ok(())
}

async fn monitor(session: &mut ConnectionSession, count: Option<usize>) -> Result<()> {
    // Subscribing first so the connection events are printed as well.
    let mut events = session.subscribe();
    session.connect().await?;
    if !session.is_streaming() {
        bail!("The device has no streaming interface");
    }

    let mut received = 0;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(DeviceEvent::Data(data)) => {
                    println!("{}", hex_dump(&data));
                    received += 1;
                    if count.is_some_and(|count| received >= count) {
                        return Ok(());
                    }
                }
                Ok(DeviceEvent::Connected { role }) => info!("{} channel connected", role),
                Ok(DeviceEvent::ReadError { error }) => {
                    error!("Stream read failed: {}", error);
                    return Err(error.into());
                }
                Ok(DeviceEvent::Disconnected) | Err(RecvError::Closed) => return Ok(()),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} events", skipped),
            }
        }
    }
}

async fn send(session: &mut ConnectionSession, payload: &Payload) -> Result<()> {
    session.connect().await?;
    if !session.is_streaming() {
        bail!("The device has no streaming interface");
    }

    let sent = session.send(&payload.0).await?;
    info!("Sent {} of {} bytes", sent, payload.0.len());
    Ok(())
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}
