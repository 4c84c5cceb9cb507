//! Distribution Scheduler: the single thread that owns every consumer's
//! transition socket and drains the shuffle queue (spec §4.3 "Shuffle
//! path", §4.4 retirement detection, §5 "main scheduler loop multiplexed
//! over the shuffle queue and every consumer's transition socket").

use crate::connection::NewConsumer;
use crate::core::Core;
use evbus_core::Datagram;
use mio::{Events, Interest, Poll, Token};
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::io::Read;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAKE_TOKEN: Token = Token(0);
const TRANSITION_TOKEN_BASE: usize = 1;

pub struct Scheduler {
    logger: Logger,
}

impl Scheduler {
    pub fn new(logger: Logger) -> Scheduler {
        Scheduler {
            logger: logger.new(o!("component" => "scheduler")),
        }
    }

    /// Runs forever on the calling thread. `poll` must already have its
    /// waker registered at [`WAKE_TOKEN`] by the caller (`mio::Waker::new`
    /// needs the same `Poll` this loop drives).
    pub fn run(
        self,
        core: Arc<Mutex<Core>>,
        shuffle_rx: Receiver<(u32, Datagram)>,
        new_consumer_rx: Receiver<NewConsumer>,
        mut poll: Poll,
    ) -> std::io::Result<()> {
        let mut events = Events::with_capacity(128);
        let mut registered: HashMap<u32, Token> = HashMap::new();

        loop {
            poll.poll(&mut events, Some(Duration::from_millis(50)))?;

            // Pick up freshly registered consumers every tick rather than
            // strictly off the waker event, since std::sync::mpsc and the
            // waker coalesce independently of poll's returned event set.
            while let Ok(new_consumer) = new_consumer_rx.try_recv() {
                let mut guard = core.lock().expect("core mutex poisoned");
                if let Some(slot) = guard.consumers[new_consumer.id as usize].as_mut() {
                    let token = Token(TRANSITION_TOKEN_BASE + new_consumer.id as usize);
                    if poll
                        .registry()
                        .register(&mut slot.transition_socket, token, Interest::READABLE)
                        .is_ok()
                    {
                        registered.insert(new_consumer.id, token);
                        debug!(self.logger, "registered transition socket"; "id" => new_consumer.id);
                    }
                }
            }

            while let Ok((buffer_index, dg)) = shuffle_rx.try_recv() {
                let mut guard = core.lock().expect("core mutex poisoned");
                if let Err(e) = guard.shuffle_distribute(buffer_index, dg) {
                    warn!(self.logger, "shuffle distribute failed"; "error" => %e);
                }
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let id = (event.token().0 - TRANSITION_TOKEN_BASE) as u32;
                self.handle_transition_socket_ready(&core, id, &mut poll, &mut registered);
            }
        }
    }

    /// A consumer sent bytes back on its transition socket (returning a
    /// buffer it had held, triggering a replay per spec §4.2 `deallocate`),
    /// or closed it (retirement, spec §4.4).
    fn handle_transition_socket_ready(
        &self,
        core: &Arc<Mutex<Core>>,
        id: u32,
        poll: &mut Poll,
        registered: &mut HashMap<u32, Token>,
    ) {
        let mut guard = core.lock().expect("core mutex poisoned");
        let mut buf = [0u8; evbus_core::BufferMsg::WIRE_SIZE];
        let read_result = match guard.consumers[id as usize].as_mut() {
            Some(slot) => slot.transition_socket.read(&mut buf),
            None => return,
        };

        match read_result {
            Ok(n) if n == buf.len() => {
                if let Ok(msg) = evbus_core::BufferMsg::from_bytes(&buf) {
                    let tr_idx = msg.buffer_index as u32 - guard.geometry.event_buffers;
                    let released = guard.transitions.deallocate(tr_idx, id);
                    if released {
                        self.replay(&mut guard, id);
                    }
                }
            }
            Ok(_) | Err(_) => {
                if registered.remove(&id).is_some() {
                    if let Some(slot) = guard.consumers[id as usize].as_mut() {
                        let _ = poll.registry().deregister(&mut slot.transition_socket);
                    }
                }
                guard.retire_consumer(id);
                info!(self.logger, "consumer socket closed, retired"; "id" => id);
            }
        }
    }

    /// Re-admits consumer `id` to any transitions now unblocked by its
    /// `not_ready` bit clearing (the continuation of `Pds::TransitionCache`
    /// admission after a buffer is freed).
    fn replay(&self, core: &mut Core, id: u32) {
        let stack = core.transitions.current_stack_copy();
        for tr_idx in stack {
            if core.transitions.try_allocate_to_consumer(tr_idx, id) {
                let service = core.transitions.service_of(tr_idx);
                core.send_transition_replay(id, tr_idx, service);
            }
        }
    }
}
