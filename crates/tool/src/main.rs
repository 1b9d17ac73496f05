//! canusb-tool
//!
//! Diagnostic command line tool for USB-to-CAN interfaces. Lists USB devices,
//! shows the bulk endpoint table of an interface, monitors the inbound pipe
//! of a CAN channel and sends raw messages on its outbound pipe, all through
//! the pipe runtime.

mod config;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use config::ToolConfig;
use pipe::{
    Endpoints, PipeError, PumpEvent, RusbInterface, Timeout, UsbPipe, query_endpoints,
    spawn_read_pump, transmit,
};
use rusb::UsbContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "canusb-tool")]
#[command(
    author,
    version,
    about = "USB-to-CAN diagnostics - inspect endpoints and monitor pipes"
)]
#[command(long_about = "
Diagnostic tool for USB-to-CAN interfaces built on the canusb pipe runtime.

EXAMPLES:
    # List USB devices
    canusb-tool list

    # Show the bulk endpoint table of the configured device
    canusb-tool endpoints

    # Show endpoints of a specific device and interface
    canusb-tool endpoints --vid 0x0c72 --pid 0x000c --interface 0

    # Print 100 elements received on CAN channel 1
    canusb-tool monitor --endpoint 1 --count 100

    # Send two messages on CAN channel 1
    canusb-tool send --endpoint 1 0x0102030405060708 a0b1

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/canusb/tool.toml
    3. /etc/canusb/tool.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

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
    /// List USB devices
    List,

    /// Show the bulk endpoint table of a device interface
    Endpoints {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Print data received on the inbound pipe of a logical endpoint
    Monitor {
        #[command(flatten)]
        device: DeviceArgs,

        /// Logical endpoint (CAN channel), 1-based
        #[arg(short, long)]
        endpoint: u8,

        /// Stop after this many elements (or packets)
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Wait per element in ms (0 = poll, 65535 = infinite)
        #[arg(short, long, default_value_t = 1000)]
        timeout_ms: u16,
    },

    /// Send messages on the outbound pipe of a logical endpoint
    Send {
        #[command(flatten)]
        device: DeviceArgs,

        /// Logical endpoint (CAN channel), 1-based
        #[arg(short, long)]
        endpoint: u8,

        /// Timeout of each bulk write in ms
        #[arg(short, long, default_value_t = 1000)]
        timeout_ms: u64,

        /// Messages as hex bytes (e.g. 0x0102 or a0b1c2), zero-padded to the
        /// element size
        #[arg(required = true, value_parser = parse_message)]
        messages: Vec<Message>,
    },
}

/// Overrides of the `[device]` configuration section
#[derive(clap::Args, Debug)]
struct DeviceArgs {
    /// Vendor ID (hex, e.g. 0x0c72)
    #[arg(long, value_parser = parse_hex_id)]
    vid: Option<u16>,

    /// Product ID (hex, e.g. 0x000c)
    #[arg(long, value_parser = parse_hex_id)]
    pid: Option<u16>,

    /// Interface number
    #[arg(long)]
    interface: Option<u8>,
}

fn parse_hex_id(value: &str) -> Result<u16, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid USB ID '{}': {}", value, e))
}

/// Raw message bytes given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
struct Message(Vec<u8>);

fn parse_message(value: &str) -> Result<Message, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(format!(
            "invalid message '{}': expected an even number of hex digits",
            value
        ));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid message '{}': bad hex byte", value))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Message)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ToolConfig::default();
        let path = ToolConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ToolConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ToolConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    debug!("canusb-tool v{}", env!("CARGO_PKG_VERSION"));

    match args.command.unwrap_or(Command::List) {
        Command::List => list_devices(),
        Command::Endpoints { device } => show_endpoints(&config, &device),
        Command::Monitor {
            device,
            endpoint,
            count,
            timeout_ms,
        } => monitor(&config, &device, endpoint, count, Timeout::from(timeout_ms)),
        Command::Send {
            device,
            endpoint,
            timeout_ms,
            messages,
        } => send(
            &config,
            &device,
            endpoint,
            &messages,
            Duration::from_millis(timeout_ms),
        ),
    }
}

/// Open the configured device, with command line overrides applied
fn open_interface(config: &ToolConfig, overrides: &DeviceArgs) -> Result<RusbInterface> {
    let vendor_id = overrides.vid.unwrap_or(config.device.vendor_id);
    let product_id = overrides.pid.unwrap_or(config.device.product_id);
    let interface = overrides.interface.unwrap_or(config.device.interface);

    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let usb = RusbInterface::open(&context, vendor_id, product_id, interface).with_context(
        || {
            format!(
                "Failed to open interface {} of device {:04x}:{:04x}",
                interface, vendor_id, product_id
            )
        },
    )?;
    info!(
        "Opened interface {} of device {:04x}:{:04x}",
        interface, vendor_id, product_id
    );
    Ok(usb)
}

fn list_devices() -> Result<()> {
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let devices: Vec<_> = context
        .devices()
        .context("Failed to list USB devices")?
        .iter()
        .collect();

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in &devices {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(
                    "Skipping device {:03}:{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        println!(
            "  Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            device.bus_number(),
            device.address(),
            descriptor.vendor_id(),
            descriptor.product_id()
        );
        if let Ok(config) = device.active_config_descriptor() {
            for interface in config.interfaces() {
                if let Some(alt) = interface.descriptors().next() {
                    println!(
                        "      Interface {}: class 0x{:02x}, {} endpoint(s)",
                        interface.number(),
                        alt.class_code(),
                        alt.num_endpoints()
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_endpoints(endpoints: &Endpoints) {
    println!(
        "{} logical endpoint(s) including endpoint 0\n",
        endpoints.num_endpoints()
    );
    println!("  EP  IN pipe (size)   OUT pipe (size)");
    for (number, endpoint) in endpoints.iter() {
        let describe = |props: &pipe::PipeProps| {
            if props.is_present() {
                format!("#{} ({})", props.pipe_ref, props.packet_size)
            } else {
                "-".to_string()
            }
        };
        println!(
            "  {:<3} {:<16} {}",
            number,
            describe(&endpoint.pipe_in),
            describe(&endpoint.pipe_out)
        );
    }
}

fn show_endpoints(config: &ToolConfig, device: &DeviceArgs) -> Result<()> {
    let usb = open_interface(config, device)?;
    let endpoints = query_endpoints(&usb).context("Failed to enumerate endpoints")?;
    print_endpoints(&endpoints);
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Data lost by the active transport of an inbound runtime
fn lost_count(pipe: &UsbPipe) -> u64 {
    if pipe.uses_byte_stream() {
        pipe.stream_drops()
    } else {
        pipe.overflow_counter()
    }
}

fn monitor(
    config: &ToolConfig,
    device: &DeviceArgs,
    endpoint: u8,
    count: Option<u64>,
    timeout: Timeout,
) -> Result<()> {
    let usb = Arc::new(open_interface(config, device)?);
    let endpoints = query_endpoints(usb.as_ref()).context("Failed to enumerate endpoints")?;

    let pipe_ref = endpoints.pipe_ref_in(endpoint);
    if pipe_ref == 0 {
        bail!("Endpoint {} has no bulk IN pipe", endpoint);
    }

    let mut pipe = UsbPipe::new(config.pipe_config()).context("Failed to create pipe runtime")?;
    pipe.configure(pipe_ref)?;
    let pipe = Arc::new(pipe);

    let pump = spawn_read_pump(usb, pipe.clone(), config.pump_settings())
        .context("Failed to start read pump")?;
    let events = pump.events();
    info!(
        "Monitoring endpoint {} (pipe #{}, {})",
        endpoint,
        pipe_ref,
        if pipe.uses_byte_stream() {
            "byte stream"
        } else {
            "message queue"
        }
    );

    let mut packet = vec![0u8; pipe.element_size()];
    let mut received: u64 = 0;
    let mut overflows: u64 = 0;
    let result = loop {
        if count.is_some_and(|limit| received >= limit) {
            break Ok(());
        }

        let read = if pipe.uses_byte_stream() {
            pipe.read_packet(&mut packet, timeout)
        } else {
            pipe.dequeue(&mut packet, timeout)
        };
        match read {
            Ok(()) => {
                received += 1;
                println!("{:>8}  {}", received, hex(&packet));
            }
            Err(e) if e.is_transient() => {}
            Err(e) => break Err(anyhow!(e).context("Failed to read pipe")),
        }

        let counter = lost_count(&pipe);
        if counter > overflows {
            if pipe.uses_byte_stream() {
                println!(
                    "          ** byte stream full: {} packet(s) lost **",
                    counter - overflows
                );
            } else {
                println!(
                    "          ** queue overflow: {} element(s) lost **",
                    counter - overflows
                );
            }
            overflows = counter;
        }

        while let Ok(event) = events.try_recv() {
            match event {
                PumpEvent::Failed { pipe, error } => {
                    error!("Read pump on pipe #{} failed: {}", pipe, error);
                }
                other => debug!("Pump event: {:?}", other),
            }
        }
        if !pump.is_running() {
            break Err(anyhow!("Read pump stopped"));
        }
    };

    match pump.abort() {
        Ok(()) => {}
        // The loop already reported the pump failure
        Err(PipeError::Usb(e)) => debug!("Read pump ended with: {}", e),
        Err(e) => error!("Read pump ended with: {}", e),
    }
    info!("{} element(s) received, {} lost", received, overflows);

    result
}

/// Zero-pad `message` to one queue element
fn to_element(message: &[u8], element_size: usize) -> Result<Vec<u8>> {
    if message.len() > element_size {
        bail!(
            "Message of {} bytes exceeds the element size of {} bytes",
            message.len(),
            element_size
        );
    }
    let mut element = vec![0u8; element_size];
    element[..message.len()].copy_from_slice(message);
    Ok(element)
}

fn send(
    config: &ToolConfig,
    device: &DeviceArgs,
    endpoint: u8,
    messages: &[Message],
    timeout: Duration,
) -> Result<()> {
    let element_size = config.pipe.element_size;
    let elements = messages
        .iter()
        .map(|Message(bytes)| to_element(bytes, element_size))
        .collect::<Result<Vec<_>>>()?;

    let usb = open_interface(config, device)?;
    let endpoints = query_endpoints(&usb).context("Failed to enumerate endpoints")?;

    let pipe_ref = endpoints.pipe_ref_out(endpoint);
    if pipe_ref == 0 {
        bail!("Endpoint {} has no bulk OUT pipe", endpoint);
    }

    let mut pipe =
        UsbPipe::new(config.tx_pipe_config()).context("Failed to create pipe runtime")?;
    pipe.configure(pipe_ref)?;
    info!("Sending {} message(s) on pipe #{}", elements.len(), pipe_ref);

    let capacity = pipe.queue_stats().capacity;
    let mut sent = 0;
    for element in &elements {
        if pipe.queue_len() == capacity {
            sent += transmit(&usb, &pipe, timeout).context("Failed to send messages")?;
        }
        pipe.enqueue(element)?;
    }
    sent += transmit(&usb, &pipe, timeout).context("Failed to send messages")?;

    println!("{} message(s) sent on endpoint {}", sent, endpoint);
    Ok(())
}
