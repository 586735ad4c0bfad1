//! Consumer of the readiness device.
//!
//! Usage:
//!   cargo run --bin userdev-client -- --reads 3 --period-ms 500
//!
//! Starts a device in a private namespace, asks it for asynchronous
//! notification (which it refuses), then falls back to blocking reads and
//! logs every record it gets.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};

use userdev::{ConsumerId, DevError, Device, DeviceConfig, Namespace, OpenFlags, PAYLOAD_LEN};

#[derive(Parser, Debug)]
#[command(name = "userdev-client", about = "Blocking-read consumer of the readiness device")]
struct Args {
    /// Number of records to read before tearing the device down.
    #[arg(long, default_value_t = 3)]
    reads: u32,

    /// Producer period in milliseconds. Defaults to USERDEV_PERIOD_MS or 5000.
    #[arg(long, env = "USERDEV_PERIOD_MS")]
    period_ms: Option<u64>,

    /// Node name to publish and open.
    #[arg(long, env = "USERDEV_NAME")]
    name: Option<String>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("userdev-client: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), DevError> {
    let consumer = current_consumer();
    println!("PID = {}", consumer.0);

    let mut config = DeviceConfig::from_env();
    if let Some(period_ms) = args.period_ms {
        config = config.with_period(Duration::from_millis(period_ms));
    }
    if let Some(name) = &args.name {
        config = config.with_name(name.as_str());
    }

    let namespace = Arc::new(Namespace::new());
    let device = Device::start(config, &namespace)?;

    // Ask for asynchronous notification. The device does not implement it.
    let session = namespace.open(device.name(), OpenFlags::BLOCKING)?;
    match session.register_consumer(consumer) {
        Ok(()) => info!("registered {} for notifications", consumer),
        Err(e) => warn!("notification registration failed: {}", e),
    }
    session.close();

    install_handler();

    let session = namespace.open(device.name(), OpenFlags::BLOCKING)?;
    let mut buf = [0u8; PAYLOAD_LEN];
    for i in 1..=args.reads {
        let started = Instant::now();
        let n = session.read(&mut buf)?;
        info!(
            "read {}/{}: {:?} ({} bytes) after {:?}",
            i,
            args.reads,
            String::from_utf8_lossy(&buf[..n]),
            n,
            started.elapsed()
        );
    }
    session.close();

    device.teardown();
    report_signals();
    Ok(())
}

#[cfg(unix)]
fn current_consumer() -> ConsumerId {
    userdev::notify::signal::current_consumer()
}

#[cfg(not(unix))]
fn current_consumer() -> ConsumerId {
    ConsumerId(std::process::id() as i32)
}

#[cfg(unix)]
fn install_handler() {
    if let Err(e) = userdev::notify::signal::install_async_handler() {
        warn!("could not install signal handler: {}", e);
    }
}

#[cfg(not(unix))]
fn install_handler() {}

#[cfg(unix)]
fn report_signals() {
    info!(
        "signals received: {}",
        userdev::notify::signal::signal_count()
    );
}

#[cfg(not(unix))]
fn report_signals() {}
