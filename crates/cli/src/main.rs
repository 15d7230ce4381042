//! bulkcat
//!
//! Command-line front end for the vendor bulk device. Streams bytes between
//! stdin/stdout and the device's bulk endpoints, and exposes the device's
//! control requests and reset.

mod config;
mod usb;

use anyhow::{Context as _, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{BusAddress, DeviceEvent, EventStream, create_event_bridge, setup_logging};
use config::BulkcatConfig;
use driver::{BulkDevice, OpenHandle};
use protocol::{DeviceMatch, DriverError, READ_MAX_LENGTH};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::signal;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use usb::{ClaimedDevice, HotplugWatcher, RusbTransport, UsbPipe};

type Device = BulkDevice<RusbTransport<UsbPipe>>;
type Handle = OpenHandle<RusbTransport<UsbPipe>>;

/// How long a stopped command gets to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "bulkcat")]
#[command(
    author,
    version,
    about = "bulkcat - byte-stream access to a vendor USB bulk device"
)]
#[command(long_about = "
Reads and writes the bulk endpoints of a vendor-specific USB device as a
plain byte stream. Writes are queued asynchronously with a bounded number in
flight; reads wait a bounded time for each inbound transfer.

EXAMPLES:
    # List matching devices
    bulkcat list

    # Dump device output to a file until Ctrl+C
    bulkcat read --output capture.bin

    # Send a file to the device
    bulkcat write --input firmware.cmd

    # Read the product string
    bulkcat string 2

    # Pick a specific device and interface
    bulkcat --device 1:7 --interface 0 read -n 4096

CONFIGURATION:
    bulkcat looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/bulkcat/config.toml
    3. /etc/bulkcat/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Use the device at this bus position
    #[arg(short, long, value_name = "BUS:ADDR", value_parser = parse_bus_address)]
    device: Option<BusAddress>,

    /// Claim this interface instead of the first vendor-class one
    #[arg(short, long, value_name = "NUM")]
    interface: Option<u8>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// List matching devices
    List,

    /// Copy device output to stdout or a file
    Read {
        /// Stop after this many bytes
        #[arg(short = 'n', long, value_name = "BYTES")]
        count: Option<u64>,

        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Stop after this many consecutive reads time out
        #[arg(long, value_name = "READS")]
        idle: Option<u32>,
    },

    /// Send stdin or a file to the device
    Write {
        /// Read from this file instead of stdin
        #[arg(short, long, value_name = "PATH")]
        input: Option<PathBuf>,

        /// Spin instead of blocking when every in-flight slot is taken
        #[arg(long)]
        nonblocking: bool,
    },

    /// Fetch a string descriptor
    String {
        /// Descriptor index
        index: u8,

        /// Print the raw descriptor bytes as well
        #[arg(long)]
        raw: bool,
    },

    /// Issue the device's CLEAR_FEATURE request
    ClearHalt,

    /// Port-reset the device, draining I/O around the reset
    Reset,
}

/// Parse `BUS:ADDR`, decimal
fn parse_bus_address(s: &str) -> Result<BusAddress, String> {
    let (bus, address) = s
        .split_once(':')
        .ok_or_else(|| format!("expected BUS:ADDR, got '{}'", s))?;
    let bus = bus
        .trim()
        .parse()
        .map_err(|_| format!("invalid bus number '{}'", bus))?;
    let address = address
        .trim()
        .parse()
        .map_err(|_| format!("invalid device address '{}'", address))?;
    Ok(BusAddress { bus, address })
}

#[tokio::main]
async fn main() {
    let code = match run(Args::parse()).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("bulkcat: {:#}", e);
            exit_code(&e)
        }
    };
    // A command stuck on stdin must not hold the runtime open
    std::process::exit(code);
}

/// errno-style exit status for a failed run
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| {
            cause
                .downcast_ref::<common::Error>()
                .map(common::Error::exit_code)
                .or_else(|| cause.downcast_ref::<DriverError>().map(|e| e.errno()))
        })
        .unwrap_or(1)
}

async fn run(args: Args) -> Result<()> {
    if args.save_config {
        let config = BulkcatConfig::default();
        let path = args.config.unwrap_or_else(BulkcatConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BulkcatConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BulkcatConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("bulkcat v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", log_level);

    let command = args
        .command
        .ok_or_else(|| anyhow!("No command given, see --help"))?;
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let matcher = config.device_match();
    let interface = args.interface.or(config.device.interface);

    if command == Command::List {
        return list_mode(&context, &matcher, interface);
    }

    let claimed = ClaimedDevice::open(&context, &matcher, interface, args.device)?;
    let transport = RusbTransport::new(Arc::clone(claimed.pipe()), config.transfer_timeouts())
        .context("Failed to start USB transport")?;
    let device = BulkDevice::attach(transport, claimed.binding(), config.driver_config())
        .context("Failed to attach to device")?;

    let session = Session::new(device, &claimed);
    let result = session.run(command, &context, matcher, &config).await;

    // Interface goes back to the kernel only after the engine let go of it
    drop(claimed);
    result
}

/// List matching devices and exit
fn list_mode(context: &rusb::Context, matcher: &DeviceMatch, interface: Option<u8>) -> Result<()> {
    let devices = usb::list_devices(context, matcher, interface)?;

    if devices.is_empty() {
        println!("No matching USB devices found.");
        return Ok(());
    }

    println!("Found {} device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:03}:{:03}  {:04x}:{:04x} - {} {}",
            device.at.bus,
            device.at.address,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        match device.binding {
            Some(binding) => println!(
                "      Interface {}: bulk in {}, bulk out {}",
                binding.number,
                format_endpoint(binding.endpoints.bulk_in),
                format_endpoint(binding.endpoints.bulk_out)
            ),
            None => println!("      No vendor interface"),
        }
        println!();
    }

    Ok(())
}

fn format_endpoint(address: Option<u8>) -> String {
    address.map_or_else(|| "none".to_string(), |a| format!("{:#04x}", a))
}

/// One attached device and the tasks driving it
struct Session {
    /// Emptied by whoever disconnects first
    device: Arc<Mutex<Option<Device>>>,
    pipe: Arc<UsbPipe>,
    at: BusAddress,
    stopping: Arc<AtomicBool>,
}

impl Session {
    fn new(device: Device, claimed: &ClaimedDevice) -> Self {
        Self {
            device: Arc::new(Mutex::new(Some(device))),
            pipe: Arc::clone(claimed.pipe()),
            at: claimed.at(),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(
        self,
        command: Command,
        context: &rusb::Context,
        matcher: DeviceMatch,
        config: &BulkcatConfig,
    ) -> Result<()> {
        let handle = {
            let device = lock(&self.device);
            let device = device.as_ref().ok_or(DriverError::NotFound)?;
            device.open().context("Failed to open device")?
        };
        let interrupter = handle.interrupter();

        let (sink, events) = create_event_bridge();
        let watcher = match HotplugWatcher::start(context, matcher, sink) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Hot-plug monitoring unavailable: {:#}", e);
                None
            }
        };

        let mut task = self.spawn(command, handle, config)?;
        let mut watching = watcher.is_some();

        let outcome = loop {
            tokio::select! {
                joined = &mut task => break joined.context("I/O task panicked")?,
                _ = signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    self.stopping.store(true, Ordering::Release);
                    interrupter.interrupt();
                    self.disconnect();
                    break wind_down(&mut task).await;
                }
                event = recv_event(&events), if watching => match event {
                    Some(DeviceEvent::Left { at }) if at == self.at => {
                        warn!("Device {:03}:{:03} unplugged", at.bus, at.address);
                        self.disconnect();
                    }
                    Some(other) => debug!("Ignoring hot-plug event {:?}", other),
                    None => watching = false,
                },
            }
        };

        self.disconnect();
        drop(watcher);

        let summary = outcome?;
        if let Some(summary) = summary {
            info!("{}", summary);
        }
        Ok(())
    }

    fn spawn(
        &self,
        command: Command,
        handle: Handle,
        config: &BulkcatConfig,
    ) -> Result<JoinHandle<common::Result<Option<String>>>> {
        let stopping = Arc::clone(&self.stopping);

        let task = match command {
            Command::Read {
                count,
                output,
                idle,
            } => {
                let out: Box<dyn Write + Send> = match output {
                    Some(path) => Box::new(File::create(&path).with_context(|| {
                        format!("Failed to create output file: {}", path.display())
                    })?),
                    None => Box::new(io::stdout()),
                };
                task::spawn_blocking(move || {
                    let total = read_loop(&handle, out, count, idle, &stopping)?;
                    Ok(Some(format!("Read {} bytes", total)))
                })
            }
            Command::Write { input, nonblocking } => {
                let input: Box<dyn Read + Send> = match input {
                    Some(path) => Box::new(File::open(&path).with_context(|| {
                        format!("Failed to open input file: {}", path.display())
                    })?),
                    None => Box::new(io::stdin()),
                };
                let chunk = config.io.max_transfer;
                task::spawn_blocking(move || {
                    let total = write_loop(&handle, input, chunk, nonblocking, &stopping)?;
                    Ok(Some(format!("Wrote {} bytes", total)))
                })
            }
            Command::String { index, raw } => task::spawn_blocking(move || {
                let descriptor = handle.string_descriptor(index)?;
                println!("{}", descriptor.to_string_lossy());
                if raw {
                    let hex: Vec<String> = descriptor
                        .as_bytes()
                        .iter()
                        .map(|b| format!("{:02x}", b))
                        .collect();
                    println!("{}", hex.join(" "));
                }
                Ok(None)
            }),
            Command::ClearHalt => task::spawn_blocking(move || {
                handle.clear_feature()?;
                Ok(Some("Feature cleared".to_string()))
            }),
            Command::Reset => {
                let device = Arc::clone(&self.device);
                let pipe = Arc::clone(&self.pipe);
                task::spawn_blocking(move || reset_device(&device, &pipe, &handle).map(Some))
            }
            Command::List => return Err(anyhow!("list does not open a device")),
        };

        Ok(task)
    }

    /// Disconnect the engine if nobody has yet
    fn disconnect(&self) {
        let device = lock(&self.device).take();
        if let Some(device) = device {
            // Waits for outstanding completions
            task::block_in_place(|| device.disconnect());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn recv_event(events: &EventStream) -> Option<DeviceEvent> {
    events.recv().await.ok()
}

/// Give a stopped command a moment to notice, then abandon it
async fn wind_down(
    task: &mut JoinHandle<common::Result<Option<String>>>,
) -> common::Result<Option<String>> {
    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(common::Error::Channel(format!("I/O task failed: {}", e))),
        Err(_) => {
            debug!("I/O task still blocked, abandoning it");
            Ok(None)
        }
    }
}

/// Copy inbound data to `out` until the count is reached, the device goes
/// idle, or the session stops
fn read_loop(
    handle: &Handle,
    mut out: Box<dyn Write + Send>,
    count: Option<u64>,
    idle: Option<u32>,
    stopping: &AtomicBool,
) -> common::Result<u64> {
    let mut buf = vec![0u8; READ_MAX_LENGTH];
    let mut total = 0u64;
    let mut empty = 0u32;

    loop {
        let want = match count {
            Some(count) if total >= count => break,
            Some(count) => (count - total).min(buf.len() as u64) as usize,
            None => buf.len(),
        };

        match handle.read(&mut buf[..want]) {
            Ok(0) => {
                empty += 1;
                if idle.is_some_and(|idle| empty >= idle) {
                    debug!("No data for {} reads, stopping", empty);
                    break;
                }
            }
            Ok(n) => {
                empty = 0;
                out.write_all(&buf[..n])?;
                out.flush()?;
                total += n as u64;
            }
            Err(_) if stopping.load(Ordering::Acquire) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(total)
}

/// Feed `input` to the device chunk by chunk, then flush
fn write_loop(
    handle: &Handle,
    mut input: Box<dyn Read + Send>,
    chunk: usize,
    nonblocking: bool,
    stopping: &AtomicBool,
) -> common::Result<u64> {
    let mut buf = vec![0u8; chunk.max(1)];
    let mut total = 0u64;

    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        let mut data = &buf[..n];
        while !data.is_empty() {
            match handle.write(data, nonblocking) {
                Ok(accepted) => {
                    data = &data[accepted..];
                    total += accepted as u64;
                }
                Err(DriverError::TryAgain) => thread::yield_now(),
                Err(_) if stopping.load(Ordering::Acquire) => return Ok(total),
                Err(e) => return Err(e.into()),
            }
        }
    }

    handle.flush()?;
    Ok(total)
}

/// Reset the device with the engine quiesced around it
fn reset_device(
    device: &Mutex<Option<Device>>,
    pipe: &UsbPipe,
    handle: &Handle,
) -> common::Result<String> {
    let result = {
        let device = lock(device);
        let device = device.as_ref().ok_or(DriverError::NotFound)?;
        device.pre_reset();
        let result = pipe.with_handle_mut(|usb| usb.reset());
        device.post_reset();
        result
    };
    result.map_err(|e| common::Error::Usb(format!("Reset failed: {}", e)))?;

    // The reset is latched for the next caller; consume it here
    match handle.flush() {
        Ok(()) | Err(DriverError::PipeStall) => Ok("Device reset".to_string()),
        Err(e) => Err(e.into()),
    }
}
