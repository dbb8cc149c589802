// src/main.rs
//
// A small clap-derive CLI exposing connect/send/flash/monitor/stats,
// in the spirit of the teacher's `cli` feature (`gs_usb_cli`,
// `bt_scan_cli`): plain binary target, one subcommand per console
// operation. Each invocation connects, does one thing, and disconnects —
// there is no long-lived daemon here, so state does not persist across
// separate CLI invocations.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use canbridge_lib::adapter::bluetooth_spp::BluetoothSppDriver;
use canbridge_lib::adapter::gs_usb::UsbGsDriver;
use canbridge_lib::adapter::network_relay::NetworkRelayDriver;
use canbridge_lib::adapter::pcan::PcanDriver;
use canbridge_lib::adapter::{AdapterVariant, BackendConfig};
use canbridge_lib::bootloader::FlashJob;
use canbridge_lib::config::{load_config, AppConfig};
use canbridge_lib::frame::Frame;
use canbridge_lib::logging::init_file_logging;
use canbridge_lib::session::Dispatcher;
use canbridge_lib::tlog;

#[derive(Parser)]
#[command(name = "canbridge", about = "Host-side CAN bridge: observe/inject console plus a firmware flashing engine")]
struct Cli {
    /// Config file path (created with defaults on first run).
    #[arg(long, default_value = "canbridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to an adapter and report its capabilities.
    Connect {
        #[arg(long)]
        variant: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        baudrate: Option<u32>,
    },
    /// Connect, transmit one frame, then disconnect.
    Send {
        #[arg(long)]
        variant: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        baudrate: Option<u32>,
        /// Hex arbitration ID, e.g. 18FF0001 or 123.
        #[arg(long)]
        id: String,
        #[arg(long)]
        extended: bool,
        /// Hex-encoded payload bytes, e.g. "DEADBEEF".
        #[arg(long, default_value = "")]
        data: String,
    },
    /// Connect, observe traffic for a duration, then disconnect.
    Monitor {
        #[arg(long)]
        variant: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        baudrate: Option<u32>,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Connect and flash a firmware image to one module over CAN.
    Flash {
        #[arg(long)]
        variant: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        baudrate: Option<u32>,
        #[arg(long)]
        module: u8,
        #[arg(long)]
        file: PathBuf,
    },
}

fn build_variant(variant: &str, channel: &str, baudrate: u32) -> Result<AdapterVariant, String> {
    let backend = BackendConfig::default();
    match variant {
        "pcan" => PcanDriver::new(channel, baudrate, backend)
            .map(AdapterVariant::Pcan)
            .map_err(|e| e.to_string()),
        "usb_gs" => {
            let index: usize = channel
                .parse()
                .map_err(|_| format!("usb_gs channel must be a device index, got '{channel}'"))?;
            UsbGsDriver::new(index, baudrate, backend)
                .map(AdapterVariant::UsbGs)
                .map_err(|e| e.to_string())
        }
        "network_relay" => NetworkRelayDriver::new(channel, baudrate)
            .map(AdapterVariant::NetworkRelay)
            .map_err(|e| e.to_string()),
        "bluetooth_spp" => {
            let (mac, rfcomm) = channel.split_once(':').unwrap_or((channel, "1"));
            let rfcomm: u8 = rfcomm
                .parse()
                .map_err(|_| format!("invalid RFCOMM channel '{rfcomm}'"))?;
            BluetoothSppDriver::new(mac, rfcomm)
                .map(AdapterVariant::BluetoothSpp)
                .map_err(|e| e.to_string())
        }
        other => Err(format!(
            "unknown adapter variant '{other}' (expected pcan, usb_gs, network_relay, bluetooth_spp)"
        )),
    }
}

fn parse_frame_id(text: &str) -> Result<u32, String> {
    u32::from_str_radix(text.trim_start_matches("0x"), 16).map_err(|e| format!("invalid frame ID '{text}': {e}"))
}

fn parse_hex_data(text: &str) -> Result<Vec<u8>, String> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(text).map_err(|e| format!("invalid hex payload '{text}': {e}"))
}

fn run(cli: Cli, config: AppConfig) -> Result<(), String> {
    match cli.command {
        Command::Connect { variant, channel, baudrate } => {
            let baudrate = baudrate.unwrap_or(config.default_baudrate);
            let dispatcher = Dispatcher::new(config.queue_depth);
            let adapter = build_variant(&variant, &channel, baudrate)?;
            dispatcher.connect(adapter, channel, baudrate).map_err(|e| e.to_string())?;
            let status = dispatcher.status();
            println!("connected: {} on channel '{}' @ {} baud", variant, status.channel, status.baudrate);
            dispatcher.disconnect().map_err(|e| e.to_string())?;
        }
        Command::Send { variant, channel, baudrate, id, extended, data } => {
            let baudrate = baudrate.unwrap_or(config.default_baudrate);
            let dispatcher = Dispatcher::new(config.queue_depth);
            let adapter = build_variant(&variant, &channel, baudrate)?;
            dispatcher.connect(adapter, channel, baudrate).map_err(|e| e.to_string())?;
            let frame = Frame::new(parse_frame_id(&id)?, extended, false, parse_hex_data(&data)?, 0.0);
            dispatcher.send_frame(&frame).map_err(|e| e.to_string())?;
            println!("sent frame id=0x{:X} extended={extended} len={}", frame.id(), frame.data().len());
            dispatcher.disconnect().map_err(|e| e.to_string())?;
        }
        Command::Monitor { variant, channel, baudrate, seconds } => {
            let baudrate = baudrate.unwrap_or(config.default_baudrate);
            let dispatcher = Dispatcher::new(config.queue_depth);
            let adapter = build_variant(&variant, &channel, baudrate)?;
            dispatcher.connect(adapter, channel, baudrate).map_err(|e| e.to_string())?;
            let subscriber = dispatcher.attach_subscriber();
            let deadline = std::time::Instant::now() + Duration::from_secs(seconds);
            while std::time::Instant::now() < deadline {
                if let Some((frame, seq)) = subscriber.recv() {
                    println!(
                        "#{seq} id=0x{:X} extended={} data={}",
                        frame.frame.id(),
                        frame.frame.extended(),
                        hex::encode_upper(frame.frame.data())
                    );
                } else {
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
            if subscriber.dropped_count() > 0 {
                println!("dropped {} frames (consumer too slow)", subscriber.dropped_count());
            }
            dispatcher.detach_subscriber(&subscriber);
            dispatcher.disconnect().map_err(|e| e.to_string())?;
        }
        Command::Flash { variant, channel, baudrate, module, file } => {
            let baudrate = baudrate.unwrap_or(config.default_baudrate);
            let image = std::fs::read(&file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;
            let dispatcher = Dispatcher::new(config.queue_depth);
            let adapter = build_variant(&variant, &channel, baudrate)?;
            dispatcher.connect(adapter, channel, baudrate).map_err(|e| e.to_string())?;

            let mut job = FlashJob::new(module, image);
            job.verify = config.verify_enabled;
            job.write_batch_size = config.batch_size;
            job.verify_batch_size = config.verify_batch_size;

            dispatcher
                .start_flash(job, |ev| println!("{}: {:.0}% {}", ev.stage, ev.percent, ev.message))
                .map_err(|e| e.to_string())?;

            while dispatcher.status().flash_in_progress {
                std::thread::sleep(Duration::from_millis(100));
            }
            println!("flash finished: {:?}", dispatcher.flash_state());
            dispatcher.disconnect().map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_file_logging(std::path::Path::new(&config.reports_dir)) {
        eprintln!("warning: file logging disabled: {e}");
    }
    tlog!("[cli] canbridge starting");

    if let Err(e) = run(cli, config) {
        tlog!("[cli] command failed: {e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
