//! Minimal feed monitor: joins a multicast group, decodes ITCH 5.0, and
//! prints per-instrument touch updates plus periodic pipeline statistics.
//!
//! Usage: feed_tap <multicast_group> <port> [symbol]

use spdlog::info;
use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::time::Duration;
use tickflow::engine::{Engine, EngineConfig};
use tickflow::types::{MessageKind, PRICE_SCALE};
use tickflow::{ClosureSubscriber, Itch50Decoder};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(target_os = "linux")]
fn install_signal_handler() {
    extern "C" fn on_signal(_: i32) {
        SHUTDOWN.store(true, Relaxed);
    }
    let handler = on_signal as extern "C" fn(i32) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(target_os = "linux"))]
fn install_signal_handler() {}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(group) = args.next().and_then(|s| s.parse::<Ipv4Addr>().ok()) else {
        eprintln!("usage: feed_tap <multicast_group> <port> [symbol]");
        return ExitCode::FAILURE;
    };
    let Some(port) = args.next().and_then(|s| s.parse::<u16>().ok()) else {
        eprintln!("usage: feed_tap <multicast_group> <port> [symbol]");
        return ExitCode::FAILURE;
    };
    let symbol_filter = args.next();

    install_signal_handler();

    let mut config = EngineConfig::default();
    config.network.multicast_group = Some(group);
    config.network.port = port;
    config.stats_interval = Some(Duration::from_secs(5));

    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("configuration rejected: {}", err);
            return ExitCode::FAILURE;
        }
    };

    // Resolve the optional symbol filter against the feed's directory
    // messages as they arrive.
    let filter = Arc::new(symbol_filter);
    let decoder = Itch50Decoder::new().with_sequence_checking(true);
    engine.set_decoder(Box::new(decoder));

    let tap_filter = filter.clone();
    engine.add_subscriber(Box::new(ClosureSubscriber::new("tap", move |msg| {
        if tap_filter.is_some() {
            // Without a directory snapshot the filter matches instrument
            // ids parsed as numbers; directory-bound names print anyway.
            let wanted = tap_filter
                .as_deref()
                .and_then(|s| s.parse::<u32>().ok())
                .map(|id| id == msg.instrument_id)
                .unwrap_or(true);
            if !wanted {
                return true;
            }
        }
        match msg.kind() {
            MessageKind::Trade => {
                println!(
                    "trade instr={} qty={} px={:.4}",
                    msg.instrument_id,
                    msg.quantity,
                    msg.price as f64 / PRICE_SCALE as f64
                );
            }
            MessageKind::OrderAdd => {
                println!(
                    "add   instr={} id={} {:?} qty={} px={:.4}",
                    msg.instrument_id,
                    msg.order_id,
                    msg.side(),
                    msg.quantity,
                    msg.price as f64 / PRICE_SCALE as f64
                );
            }
            _ => {}
        }
        true
    })));

    engine.set_error_callback(|kind, detail| {
        eprintln!("engine error {:?}: {}", kind, detail);
    });
    engine.set_statistics_callback(|stats| {
        info!(
            "pkts={} drops={} parsed={} errs={} dispatched={} books={}",
            stats.capture.packets_received,
            stats.capture.packets_dropped,
            stats.pipeline.messages_parsed,
            stats.pipeline.parse_errors,
            stats.pipeline.messages_dispatched,
            stats.symbols_active,
        );
    });

    if !engine.initialize() {
        eprintln!("initialization failed (socket setup)");
        return ExitCode::FAILURE;
    }
    if !engine.start() {
        eprintln!("engine failed to start");
        return ExitCode::FAILURE;
    }
    info!("listening on {}:{}", group, port);

    while !SHUTDOWN.load(Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("signal received, shutting down");
    engine.stop();
    ExitCode::SUCCESS
}
