//! Consumer Runtime (spec §4.5): attaches to a running bus, maps the pool
//! read-only, drains the live transition stack before ever surfacing a
//! data event, then runs a steady-state loop that always prefers a pending
//! transition over a pending `L1Accept`.

use evbus_core::error::{Error, Result};
use evbus_core::queue::{QueueReceiver, QueueSender};
use evbus_core::{BufferMsg, BufferPoolReader, BusConfig, ClientRequest, Datagram, DatagramHeader, Service};
use mio::net::TcpStream as MioTcpStream;
use slog::{debug, info, o, warn, Logger};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Blocks until the producer's discovery advertisement arrives, then
/// returns the port its registration listener is bound to (spec §4.4
/// "discover" / §4.5 step 1).
pub fn discover(tag: &str, logger: &Logger) -> Result<u16> {
    let path = evbus_core::names::discovery_queue(tag);
    let receiver = QueueReceiver::bind(&path, 4, logger)?;
    loop {
        match receiver.try_recv()? {
            Some(msg) => {
                let port = msg.buffer_index as u16;
                info!(logger, "discovered producer"; "port" => port);
                return Ok(port);
            }
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

pub struct ConsumerRuntime {
    pool: BufferPoolReader,
    transition_socket: TcpStream,
    delivery: QueueReceiver,
    /// Lazily connected so a consumer that never returns a token (the
    /// common case for a read-only spectator) never has to open it.
    return_sender: Option<QueueSender>,
    queue_index: u32,
    tag: String,
    logger: Logger,
}

impl ConsumerRuntime {
    /// Full attach sequence: discover, connect, handshake, map the pool,
    /// bind this consumer's own delivery queue (spec §4.5 steps 1-3).
    pub fn attach(config: &BusConfig, request: ClientRequest, logger: Logger) -> Result<ConsumerRuntime> {
        let logger = logger.new(o!("component" => "consumer_runtime"));
        let port = discover(&config.tag, &logger)?;

        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        let mut req = [0u8; 5];
        match request {
            ClientRequest::Serial => req[0] = 0,
            ClientRequest::Partition(q) => {
                req[0] = 1;
                req[1..5].copy_from_slice(&q.to_le_bytes());
            }
        }
        stream.write_all(&req)?;

        let mut ack = [0u8; 5];
        stream.read_exact(&mut ack)?;
        if ack[0] != 1 {
            return Err(Error::ProtocolViolation("registration rejected".to_owned()));
        }
        let queue_index = u32::from_le_bytes([ack[1], ack[2], ack[3], ack[4]]);

        let geometry = evbus_core::PoolGeometry {
            event_buffers: config.pool.event_buffers,
            transition_buffers: config.pool.transition_buffers,
            buffer_size: config.pool.buffer_size,
        };
        let pool = BufferPoolReader::open(&config.tag, geometry)?;

        let delivery_path = evbus_core::names::event_input_queue(&config.tag, queue_index);
        let delivery = QueueReceiver::bind(&delivery_path, config.pool.event_buffers as usize, &logger)?;

        info!(logger, "attached to bus"; "queue_index" => queue_index);
        Ok(ConsumerRuntime {
            pool,
            transition_socket: stream,
            delivery,
            return_sender: None,
            queue_index,
            tag: config.tag.clone(),
            logger,
        })
    }

    /// Drains the transition socket until a `Map` has been observed,
    /// handing every datagram read to `on_event` first (spec §4.5 step 4:
    /// a late joiner must see at least the live nesting before the bus
    /// considers it caught up).
    pub fn catch_up<F: FnMut(&DatagramHeader, &[u8])>(&mut self, mut on_event: F) -> Result<()> {
        loop {
            let msg = self.read_transition_token()?;
            let header = self.dispatch(&msg, &mut on_event)?;
            self.return_transition_token(&msg)?;
            if header.service == Service::Map {
                return Ok(());
            }
        }
    }

    fn read_transition_token(&mut self) -> Result<BufferMsg> {
        let mut buf = [0u8; BufferMsg::WIRE_SIZE];
        self.transition_socket.read_exact(&mut buf).map_err(|e| {
            Error::ProtocolViolation(format!("transition socket closed: {}", e))
        })?;
        BufferMsg::from_bytes(&buf).map_err(Error::Io)
    }

    fn dispatch<F: FnMut(&DatagramHeader, &[u8])>(&self, msg: &BufferMsg, on_event: &mut F) -> Result<DatagramHeader> {
        let buf = self.pool.buffer(msg.buffer_index as u32);
        let header = Datagram::decode_header(buf)
            .ok_or_else(|| Error::ProtocolViolation("undecodable datagram header".to_owned()))?;
        on_event(&header, &buf[DatagramHeader::SIZE..DatagramHeader::SIZE + header.payload_len as usize]);
        Ok(header)
    }

    /// Tells the producer this transition buffer is no longer held (spec
    /// §4.2 `deallocate`, over the same socket the token arrived on).
    fn return_transition_token(&mut self, msg: &BufferMsg) -> Result<()> {
        self.transition_socket.write_all(&msg.to_bytes()).map_err(Error::Io)
    }

    /// Tells the producer this event buffer is no longer held, returning
    /// it to this consumer's own dedicated return queue (spec §4.5 step 6).
    /// Unlike the original's client, which retries only in serial mode,
    /// here every consumer owns a single dedicated return address so there
    /// is nothing to retry across (DESIGN.md Open Question).
    fn return_event_token(&mut self, msg: &BufferMsg) -> Result<()> {
        if self.return_sender.is_none() {
            let path = evbus_core::names::event_output_queue(&self.tag, self.queue_index);
            self.return_sender = Some(QueueSender::connect(&path)?);
        }
        let sender = self.return_sender.as_ref().expect("just connected");
        if !sender.try_send(msg)? {
            warn!(self.logger, "return queue full, token dropped"; "buffer_index" => msg.buffer_index);
        }
        Ok(())
    }

    /// The steady-state loop (spec §4.5 step 5): always prefer a pending
    /// transition over a pending event, since a transition redefines what
    /// the following events mean. Runs until `should_stop` returns `true`.
    pub fn run<FE, FT, FS>(&mut self, mut on_event: FE, mut on_transition: FT, mut should_stop: FS) -> Result<()>
    where
        FE: FnMut(&DatagramHeader, &[u8]),
        FT: FnMut(&DatagramHeader, &[u8]),
        FS: FnMut() -> bool,
    {
        let mut transition_fd = MioTcpStream::from_std(
            self.transition_socket
                .try_clone()
                .map_err(Error::Io)?,
        );
        let mut poll = mio::Poll::new().map_err(Error::Io)?;
        const TRANSITION: mio::Token = mio::Token(0);
        const EVENT: mio::Token = mio::Token(1);
        poll.registry()
            .register(&mut transition_fd, TRANSITION, mio::Interest::READABLE)
            .map_err(Error::Io)?;
        poll.registry()
            .register(self.delivery.as_source(), EVENT, mio::Interest::READABLE)
            .map_err(Error::Io)?;

        let mut events = mio::Events::with_capacity(32);
        while !should_stop() {
            poll.poll(&mut events, Some(Duration::from_millis(100))).map_err(Error::Io)?;

            // Transitions always win a tie, per spec §4.5 step 5.
            if events.iter().any(|e| e.token() == TRANSITION) {
                let msg = self.read_transition_token()?;
                let header = self.dispatch(&msg, &mut on_transition)?;
                self.return_transition_token(&msg)?;
                debug!(self.logger, "handled transition"; "service" => ?header.service);
                continue;
            }

            if events.iter().any(|e| e.token() == EVENT) {
                while let Some(msg) = self.delivery.try_recv()? {
                    let header = self.dispatch(&msg, &mut on_event)?;
                    debug_assert_eq!(header.service, Service::L1Accept);
                    self.return_event_token(&msg)?;
                }
            }
        }
        Ok(())
    }
}
