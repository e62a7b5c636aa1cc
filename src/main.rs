//! ledlink CLI
//!
//! Runs the whole pipeline: watch-directory ingress, triplet dispatch, and
//! the serial session, until interrupted.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use ledlink::config::{Config, CONFIG_ENV};
use ledlink::dispatcher::Dispatcher;
use ledlink::grouping::Grouping;
use ledlink::ingress::Ingress;
use ledlink::mapping::Mapper;
use ledlink::session::{Session, SessionOptions};
use ledlink::transport::Transport;

/// Upper-computer LED matrix controller.
///
/// Ingests painting jobs from the watch directory and streams them to the
/// display device over the configured serial port.
#[derive(Parser, Debug)]
#[command(name = "ledlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Verbose output (debug-level logging)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ledlink: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let cfg = Config::load(args.config.as_deref()).context("load configuration")?;
    init_logging(&cfg, args.verbose)?;
    info!("ledlink {} starting", ledlink::version());

    for dir in [
        &cfg.grouping.watch_dir,
        &cfg.grouping.work_dir,
        &cfg.grouping.done_dir,
        &cfg.grouping.error_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }

    let mapper = Mapper::new(&cfg)?;
    let grouping = Grouping::new(&cfg.grouping)?;
    let dispatcher = Arc::new(Mutex::new(Dispatcher::new(&cfg, grouping, mapper.clone())?));
    let ingress = Ingress::new(&cfg, mapper);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install interrupt handler")?;

    // Ingress/reload cycle at 1 Hz.
    let ingress_dispatcher = Arc::clone(&dispatcher);
    let ingress_stop = Arc::clone(&shutdown);
    let ingress_thread = std::thread::Builder::new()
        .name("ingress".to_string())
        .spawn(move || {
            while !ingress_stop.load(Ordering::SeqCst) {
                if let Err(e) = ingress.ingest_batch() {
                    error!("ingress cycle failed: {e}");
                }
                if let Err(e) = ingress_dispatcher.lock().unwrap().reload() {
                    error!("dispatch reload failed: {e}");
                }
                if sleep_interruptible(&ingress_stop, Duration::from_secs(1)) {
                    break;
                }
            }
        })
        .context("spawn ingress thread")?;

    let Some(transport) = open_transport(&cfg, &shutdown) else {
        info!("shutdown requested before serial opened");
        shutdown.store(true, Ordering::SeqCst);
        let _ = ingress_thread.join();
        return Ok(());
    };

    let handler_dispatcher = Arc::clone(&dispatcher);
    let session = Session::new(
        Arc::clone(&transport),
        Some(Box::new(move || {
            handler_dispatcher.lock().unwrap().request_next_payload()
        })),
        "session",
        SessionOptions::from_comm(&cfg.comm),
    );
    let archive_dispatcher = Arc::clone(&dispatcher);
    session.set_on_a1_result(Box::new(move |ok| {
        archive_dispatcher.lock().unwrap().archive_pending(ok);
    }));

    info!("production flow started, press Ctrl+C to stop");
    sleep_until(&shutdown);

    info!("stopping");
    session.shutdown();
    let _ = ingress_thread.join();
    Ok(())
}

/// Open the first configured port, with 5 s → 30 s exponential backoff.
#[cfg(feature = "serial")]
fn open_transport(cfg: &Config, shutdown: &AtomicBool) -> Option<Arc<dyn Transport>> {
    use ledlink::transport::SerialPortTransport;

    let mut backoff = Duration::from_secs(5);
    while !shutdown.load(Ordering::SeqCst) {
        if cfg.serial.ports.is_empty() {
            warn!("serial.ports is empty; configure a port list, retrying in 10s");
            if sleep_interruptible(shutdown, Duration::from_secs(10)) {
                return None;
            }
            continue;
        }
        for name in &cfg.serial.ports {
            match SerialPortTransport::open(name, cfg.serial.baud, 100) {
                Ok(port) => {
                    info!("serial opened on {name} baud={}", cfg.serial.baud);
                    return Some(port);
                }
                Err(e) => error!("open serial {name} failed: {e}"),
            }
        }
        if sleep_interruptible(shutdown, backoff) {
            return None;
        }
        backoff = backoff.mul_f64(1.5).min(Duration::from_secs(30));
    }
    None
}

#[cfg(not(feature = "serial"))]
fn open_transport(_cfg: &Config, _shutdown: &AtomicBool) -> Option<Arc<dyn Transport>> {
    error!("built without the \"serial\" feature; no physical port support");
    None
}

/// Sleep in short slices so shutdown stays responsive. Returns true when
/// shutdown was requested.
fn sleep_interruptible(flag: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        let slice = remaining.min(Duration::from_millis(200));
        std::thread::sleep(slice);
        remaining -= slice;
    }
    flag.load(Ordering::SeqCst)
}

fn sleep_until(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn init_logging(cfg: &Config, verbose: bool) -> anyhow::Result<()> {
    use tracing_subscriber::filter::{filter_fn, FilterExt, LevelFilter};
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        cfg.logging
            .level
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::INFO)
    };

    for path in [&cfg.logging.file, &cfg.logging.device_info_file] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    let app_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.logging.file)
        .with_context(|| format!("open {}", cfg.logging.file.display()))?;
    let device_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.logging.device_info_file)
        .with_context(|| format!("open {}", cfg.logging.device_info_file.display()))?;

    // Raw device chatter goes only to its dedicated sink.
    let not_device = || filter_fn(|meta| meta.target() != "device");
    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(level.and(not_device())))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(app_file))
                .with_filter(level.and(not_device())),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(device_file))
                .with_filter(filter_fn(|meta| meta.target() == "device")),
        )
        .init();
    Ok(())
}
