//! The producer-side shared state: buffer pool, transition cache, consumer
//! table and the named event queues, all behind one mutex (spec §5:
//! "the transition cache is shared... serialized with a single mutex").
//! This repo widens that single mutex to cover the whole producer-side core
//! rather than just the transition cache, since in practice every operation
//! that touches one touches the others too (consumer registry, `dest` map,
//! pool writes); see DESIGN.md's Open Questions.

use evbus_core::error::{Error, Result};
use evbus_core::queue::{QueueReceiver, QueueSender};
use evbus_core::{BufferMsg, BufferPool, ClientRequest, Datagram, Mode, PoolGeometry, Service, TransitionCache};
use hashbrown::HashMap;
use mio::net::TcpStream;
use slog::{debug, info, o, warn, Logger};
use std::collections::VecDeque;
use std::io::Write;

/// One live consumer, as tracked by the producer (spec §4.4).
pub struct ConsumerSlot {
    pub id: u32,
    pub request: ClientRequest,
    pub queue_index: u32,
    pub transition_socket: TcpStream,
}

pub struct Core {
    pub geometry: PoolGeometry,
    pub pool: BufferPool,
    pub transitions: TransitionCache,
    pub consumers: Vec<Option<ConsumerSlot>>,
    free_ids: Vec<u32>,
    /// `dest[i]` is the id of the consumer currently holding event buffer
    /// `i` in a serial, single-owner hand-off, or `-1` if free, in flight,
    /// or parked in a shared partition queue with no single owner.
    dest: Vec<i32>,
    /// The free-token reservoir: entirely in-process, since nothing outside
    /// the scheduler ever touches it (DESIGN.md Open Question).
    free_tokens: VecDeque<u32>,
    /// Lazily-connected senders for each consumer/partition delivery
    /// address; connecting fails until that consumer has bound its side,
    /// so these are built on first successful use rather than eagerly.
    event_delivery: HashMap<u32, QueueSender>,
    /// Eagerly-bound receivers for the returned-token side of every slot;
    /// the producer always owns this end regardless of whether a consumer
    /// currently occupies the slot.
    event_return: HashMap<u32, QueueReceiver>,
    partitions: u32,
    /// Per-partition round-robin cursor, indexed into that partition's
    /// live member list (ids sorted ascending), not a queue index.
    rr_cursor: HashMap<u32, u32>,
    tag: String,
    logger: Logger,
}

impl Core {
    pub fn new(config: &evbus_core::BusConfig, logger: Logger) -> Result<Core> {
        let geometry = PoolGeometry {
            event_buffers: config.pool.event_buffers,
            transition_buffers: config.pool.transition_buffers,
            buffer_size: config.pool.buffer_size,
        };
        let pool = BufferPool::create(&config.tag, geometry, config.unlink_on_shutdown)?;
        let transitions = TransitionCache::new(config.pool.transition_buffers);

        // Every consumer, serial or round-robin, gets a dedicated delivery
        // and return queue pair named after its own id: a Unix-domain
        // datagram socket can only ever have one process bound to a given
        // path, so the original's "several readers race on one mqueue"
        // round-robin semantics has to be re-expressed as the scheduler
        // cycling *among consumer ids that share a partition*, each still
        // delivered to over its own dedicated address (DESIGN.md Open
        // Question).
        let mut event_return = HashMap::new();
        for id in 0..config.max_clients as u32 {
            let out_path = evbus_core::names::event_output_queue(&config.tag, id);
            let receiver = QueueReceiver::bind(&out_path, config.pool.event_buffers as usize, &logger)?;
            event_return.insert(id, receiver);
        }

        let core = Core {
            geometry,
            pool,
            transitions,
            consumers: (0..config.max_clients).map(|_| None).collect(),
            free_ids: (0..config.max_clients as u32).rev().collect(),
            dest: vec![-1; config.pool.event_buffers as usize],
            free_tokens: (0..config.pool.event_buffers).collect(),
            event_delivery: HashMap::new(),
            event_return,
            partitions: config.pool.partitions,
            rr_cursor: HashMap::new(),
            tag: config.tag.clone(),
            logger: logger.new(o!("component" => "core")),
        };

        info!(core.logger, "buffer pool seeded"; "event_buffers" => config.pool.event_buffers);
        Ok(core)
    }

    /// Connects (or reuses) the delivery sender for consumer `id`. Fails
    /// until that consumer has bound its receiving side at that address.
    fn delivery_sender(&mut self, id: u32) -> Option<&QueueSender> {
        if !self.event_delivery.contains_key(&id) {
            let path = evbus_core::names::event_input_queue(&self.tag, id);
            match QueueSender::connect(&path) {
                Ok(sender) => {
                    self.event_delivery.insert(id, sender);
                }
                Err(_) => return None,
            }
        }
        self.event_delivery.get(&id)
    }

    /// Registers a joining consumer, replaying the live transition stack to
    /// it bottom-up (spec §4.4 "initialize_client").
    pub fn register_consumer(&mut self, request: ClientRequest, transition_socket: TcpStream) -> Result<u32> {
        let id = self.free_ids.pop().ok_or(Error::TooManyConsumers {
            limit: self.consumers.len(),
        })?;

        if let ClientRequest::Partition(q) = request {
            if q >= self.partitions {
                self.free_ids.push(id);
                return Err(Error::ProtocolViolation(format!(
                    "requested partition {} but only {} exist",
                    q, self.partitions
                )));
            }
        }
        let queue_index = id;

        let slot = ConsumerSlot {
            id,
            request,
            queue_index,
            transition_socket,
        };

        info!(self.logger, "consumer registered"; "id" => id, "queue_index" => queue_index);
        self.consumers[id as usize] = Some(slot);
        Ok(id)
    }

    /// Replays the live transition stack to a newly registered consumer,
    /// bottom-up (spec §4.4 "initialize_client"). Kept separate from
    /// [`Core::register_consumer`] so the caller can ack the registration
    /// handshake first — the replayed tokens and the ack share the same
    /// socket and must go out in that order.
    pub fn replay_initial(&mut self, id: u32) {
        for tr_idx in self.transitions.current_stack_copy() {
            if self.transitions.try_allocate_to_consumer(tr_idx, id) {
                let service = self.transitions.service_of(tr_idx);
                self.send_transition_replay(id, tr_idx, service);
            }
        }
    }

    /// Releases every resource a retiring consumer held: its transition
    /// buffers and any event buffer it was mid-processing (spec §4.4
    /// retirement).
    pub fn retire_consumer(&mut self, id: u32) {
        self.transitions.deallocate_all(id);

        // Drain any tokens the consumer had already handed back but the
        // producer hadn't yet reclaimed, clearing `dest` for each as we go
        // (spec §4.4 retirement step 2), before the dest-sweep below so it
        // doesn't double-count them.
        if let Some(receiver) = self.event_return.get(&id) {
            while let Ok(Some(msg)) = receiver.try_recv() {
                let b = msg.buffer_index as u32;
                self.dest[b as usize] = -1;
                self.free_tokens.push_back(b);
            }
        }

        for (b, owner) in self.dest.iter_mut().enumerate() {
            if *owner == id as i32 {
                *owner = -1;
                self.free_tokens.push_back(b as u32);
            }
        }
        self.consumers[id as usize] = None;
        self.free_ids.push(id);
        info!(self.logger, "consumer retired"; "id" => id);
    }

    /// Sends a transition token to consumer `id`'s socket if it is still
    /// registered, used by the scheduler's replay-on-release path (spec
    /// §4.2 "update").
    pub fn send_transition_replay(&mut self, id: u32, tr_idx: u32, service: Option<Service>) {
        let geometry = self.geometry;
        let logger = self.logger.clone();
        if let Some(slot) = self.consumers[id as usize].as_mut() {
            Self::send_token_static(&logger, slot, geometry, tr_idx, service.unwrap_or(Service::L1Accept));
        }
    }

    /// Validates and fully admits+broadcasts a transition datagram (spec
    /// §4.3 steps for non-`L1Accept` service codes).
    pub fn submit_transition(&mut self, dg: Datagram) -> Result<()> {
        let cap = self.geometry.buffer_size as usize;
        if dg.len() > cap {
            return Err(Error::OversizeDatagram {
                len: dg.len(),
                capacity: cap,
            });
        }
        let service = dg.header.service;
        let tr_idx = self.transitions.allocate(service).ok_or(Error::TransitionPoolExhausted)?;
        self.pool.write_datagram(self.geometry.event_buffers + tr_idx, &dg)?;

        if service == Service::Enable {
            self.reclaim_all_event_tokens();
        }

        let ids: Vec<u32> = self.consumers.iter().flatten().map(|s| s.id).collect();
        for id in ids {
            if self.transitions.try_allocate_to_consumer(tr_idx, id) {
                if let Some(slot) = self.consumers[id as usize].as_mut() {
                    Self::send_token_static(&self.logger, slot, self.geometry, tr_idx, service);
                }
            }
        }
        debug!(self.logger, "transition broadcast"; "service" => ?service, "tr_idx" => tr_idx);
        Ok(())
    }

    fn send_token_static(logger: &Logger, slot: &mut ConsumerSlot, geometry: PoolGeometry, tr_idx: u32, service: Service) {
        let msg = BufferMsg::new(
            (geometry.event_buffers + tr_idx) as i32,
            geometry.transition_buffers as i32,
            geometry.buffer_size,
            Mode::Serial,
        );
        if slot.transition_socket.write_all(&msg.to_bytes()).is_err() {
            warn!(logger, "transition send failed, will deallocate"; "id" => slot.id, "service" => ?service);
        }
    }

    /// Steals back every event token currently sitting in a per-consumer or
    /// per-partition return queue into the free reservoir, so an `Enable`
    /// starts a run with a clean slate (spec §4.3, original `_moveQueue`).
    fn reclaim_all_event_tokens(&mut self) {
        let indices: Vec<u32> = self.event_return.keys().copied().collect();
        let mut moved = 0u32;
        for i in indices {
            while let Ok(Some(msg)) = self.event_return.get(&i).unwrap().try_recv() {
                self.free_tokens.push_back(msg.buffer_index as u32);
                moved += 1;
            }
        }
        for owner in self.dest.iter_mut() {
            *owner = -1;
        }
        if moved > 0 {
            debug!(self.logger, "reclaimed event tokens for Enable"; "count" => moved);
        }
    }

    /// Finds a free event-buffer token: the in-process reservoir first,
    /// then every consumer's return queue (spec §4.3 step 2). Returns
    /// `None` if the whole pool is in flight, in which case the caller
    /// drops the event.
    pub fn acquire_event_token(&mut self) -> Option<u32> {
        if let Some(b) = self.free_tokens.pop_front() {
            self.dest[b as usize] = -1;
            return Some(b);
        }
        let ids: Vec<u32> = self.event_return.keys().copied().collect();
        for id in ids {
            if let Ok(Some(msg)) = self.event_return.get(&id).unwrap().try_recv() {
                let b = msg.buffer_index as u32;
                self.dest[b as usize] = -1;
                return Some(b);
            }
        }
        None
    }

    /// Writes the payload into shared memory and hands the token to every
    /// live serial consumer in turn, falling back to round-robin within
    /// each partition's live membership (spec §4.3 "Shuffle path";
    /// DESIGN.md documents why serial and round-robin destinations are
    /// tried in that order here rather than behind one bus-wide flag).
    pub fn shuffle_distribute(&mut self, buffer_index: u32, dg: Datagram) -> Result<()> {
        self.pool.write_datagram(buffer_index, &dg)?;

        let msg = BufferMsg::new(
            buffer_index as i32,
            self.geometry.event_buffers as i32,
            self.geometry.buffer_size,
            Mode::Serial,
        );

        let serial_ids: Vec<u32> = self
            .consumers
            .iter()
            .flatten()
            .filter(|s| matches!(s.request, ClientRequest::Serial))
            .map(|s| s.id)
            .collect();

        for id in serial_ids {
            if let Some(sender) = self.delivery_sender(id) {
                if sender.try_send(&msg).unwrap_or(false) {
                    self.dest[buffer_index as usize] = id as i32;
                    return Ok(());
                }
            }
        }

        for q in 0..self.partitions {
            let mut members: Vec<u32> = self
                .consumers
                .iter()
                .flatten()
                .filter(|s| matches!(s.request, ClientRequest::Partition(p) if p == q))
                .map(|s| s.id)
                .collect();
            if members.is_empty() {
                continue;
            }
            members.sort_unstable();
            let start = (*self.rr_cursor.entry(q).or_insert(0) as usize) % members.len();

            for attempt in 0..members.len() {
                let idx = (start + attempt) % members.len();
                let id = members[idx];
                if let Some(sender) = self.delivery_sender(id) {
                    if sender.try_send(&msg).unwrap_or(false) {
                        self.rr_cursor.insert(q, (idx as u32 + 1) % members.len() as u32);
                        self.dest[buffer_index as usize] = id as i32;
                        return Ok(());
                    }
                }
            }
        }

        // Every destination is full or unattached: reclaim rather than
        // leak an already-allocated event buffer (spec §4.3 step 4).
        warn!(self.logger, "all destinations full, reclaiming token"; "buffer_index" => buffer_index);
        self.dest[buffer_index as usize] = -1;
        self.free_tokens.push_back(buffer_index);
        Ok(())
    }

    /// Returns an acquired-but-never-distributed token to the free
    /// reservoir (used when the shuffle handoff itself cannot be
    /// completed).
    pub fn reclaim_token(&mut self, buffer_index: u32) {
        self.free_tokens.push_back(buffer_index);
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}
