pub mod connection;
pub mod core;
pub mod producer;
pub mod scheduler;

pub use connection::ConnectionManager;
pub use core::Core;
pub use producer::Producer;
pub use scheduler::Scheduler;

use evbus_core::BusConfig;
use slog::{info, Logger};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};

/// Wires up a complete bus producer: the shared [`Core`], the connection
/// manager thread (discovery + accept), and a [`Producer`] handle ready for
/// the application to call [`Producer::submit`] on. The scheduler itself is
/// returned unstarted so the caller's main thread can run it directly
/// (spec §5: two cooperative threads, the caller's own thread is the
/// second one).
pub struct Bus {
    pub producer: Producer,
    pub scheduler: Scheduler,
    pub core: Arc<Mutex<Core>>,
    pub shuffle_rx: Option<Receiver<(u32, evbus_core::Datagram)>>,
    pub new_consumer_rx: Option<Receiver<connection::NewConsumer>>,
    pub poll: Option<mio::Poll>,
}

pub fn start(config: &BusConfig, logger: Logger) -> evbus_core::error::Result<Bus> {
    let core = Arc::new(Mutex::new(Core::new(config, logger.clone())?));

    let mut poll = mio::Poll::new()?;
    let waker = Arc::new(mio::Waker::new(poll.registry(), scheduler::WAKE_TOKEN)?);

    let (shuffle_tx, shuffle_rx) = sync_channel(config.pool.event_buffers as usize);
    let (new_consumer_tx, new_consumer_rx) = std::sync::mpsc::channel();

    let connection_manager = ConnectionManager::bind(&config.tag, logger.clone())?;
    let cm_core = core.clone();
    std::thread::spawn(move || connection_manager.run(cm_core, new_consumer_tx));

    let producer = Producer::new(core.clone(), shuffle_tx, waker);
    let scheduler = Scheduler::new(logger.clone());

    info!(logger, "bus started"; "tag" => &config.tag);
    Ok(Bus {
        producer,
        scheduler,
        core,
        shuffle_rx: Some(shuffle_rx),
        new_consumer_rx: Some(new_consumer_rx),
        poll: Some(poll),
    })
}

impl Bus {
    /// Runs the scheduler loop on the calling thread. Does not return
    /// under normal operation.
    pub fn run_scheduler(&mut self) -> std::io::Result<()> {
        let shuffle_rx = self.shuffle_rx.take().expect("run_scheduler called once");
        let new_consumer_rx = self.new_consumer_rx.take().expect("run_scheduler called once");
        let poll = self.poll.take().expect("run_scheduler called once");
        let placeholder = Scheduler::new(slog::Logger::root(slog::Discard, slog::o!()));
        let scheduler = std::mem::replace(&mut self.scheduler, placeholder);
        scheduler.run(self.core.clone(), shuffle_rx, new_consumer_rx, poll)
    }
}
