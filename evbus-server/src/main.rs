use evbus_core::{BusConfig, Datagram, Service};
use evbus_server::start;
use slog::info;
use std::env;

/// Demo binary: wires up a bus from a config file (or the coded default)
/// and runs the scheduler loop, logging as consumers come and go. A real
/// producer links `evbus-server` as a library and drives `Producer::submit`
/// from wherever its own event loop lives (spec §1: out of scope here).
fn main() -> std::io::Result<()> {
    let logger = evbus_core::logging::init();

    let config = match env::args().nth(1) {
        Some(path) => BusConfig::load(path),
        None => BusConfig::default(),
    };

    let mut bus = start(&config, logger.clone()).unwrap_or_else(|e| {
        eprintln!("failed to start bus: {}", e);
        std::process::exit(1);
    });

    info!(logger, "submitting initial Map transition");
    if let Err(e) = bus.producer.submit(Datagram::new(Service::Map, Vec::new())) {
        eprintln!("failed to submit Map: {}", e);
    }

    bus.run_scheduler()
}
