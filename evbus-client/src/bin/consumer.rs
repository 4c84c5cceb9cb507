//! Demo consumer: attaches to a running bus by tag, prints every transition
//! it sees and counts `L1Accept` events, stopping on Ctrl-C.

use evbus_client::ConsumerRuntime;
use evbus_core::{BusConfig, ClientRequest};
use slog::{info, o};
use std::cell::Cell;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

fn main() -> evbus_core::error::Result<()> {
    let logger = evbus_core::logging::init();

    let mut args = env::args().skip(1);
    let config_path = args.next();
    let config = match config_path {
        Some(path) => BusConfig::load(path),
        None => BusConfig::default(),
    };
    let request = match args.next().as_deref() {
        Some("partition") => {
            let q: u32 = args
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            ClientRequest::Partition(q)
        }
        _ => ClientRequest::Serial,
    };

    let mut runtime = ConsumerRuntime::attach(&config, request, logger.clone())?;

    let logger = logger.new(o!("component" => "consumer_demo"));
    info!(logger, "catching up on live transitions");
    runtime.catch_up(|header, _payload| {
        info!(logger, "caught up on transition"; "service" => ?header.service);
    })?;
    info!(logger, "caught up, entering steady state");

    install_sigint_handler();

    let event_count = Cell::new(0u64);
    runtime.run(
        |_header, _payload| {
            event_count.set(event_count.get() + 1);
        },
        |header, _payload| {
            info!(logger, "transition"; "service" => ?header.service, "events_seen" => event_count.get());
        },
        || SHUTDOWN.load(Ordering::SeqCst),
    )?;

    info!(logger, "shutting down"; "events_seen" => event_count.get());
    Ok(())
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// `ctrlc` isn't part of the dependency stack, so this installs a minimal
/// SIGINT handler directly: good enough for a demo binary that only needs
/// a clean way to stop the steady-state loop.
fn install_sigint_handler() {
    extern "C" fn on_sigint(_sig: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as usize);
    }
}
