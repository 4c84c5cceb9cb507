//! Connection Manager: the discovery advertisement loop and the TCP accept
//! loop that turns a joining process into a registered consumer (spec
//! §4.4). Runs on its own OS thread so a slow or absent consumer never
//! stalls the scheduler.

use crate::core::Core;
use evbus_core::error::Result;
use evbus_core::queue::QueueSender;
use evbus_core::wire::BufferMsg;
use evbus_core::ClientRequest;
use mio::net::TcpStream as MioTcpStream;
use slog::{error, info, o, warn, Logger};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sent to the scheduler thread each time a consumer finishes the
/// registration handshake, so it can start polling that consumer's
/// transition socket.
pub struct NewConsumer {
    pub id: u32,
}

pub struct ConnectionManager {
    listener: TcpListener,
    port: u16,
    tag: String,
    logger: Logger,
}

impl ConnectionManager {
    pub fn bind(tag: &str, logger: Logger) -> Result<ConnectionManager> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        Ok(ConnectionManager {
            listener,
            port,
            tag: tag.to_owned(),
            logger: logger.new(o!("component" => "connection_manager")),
        })
    }

    /// Runs forever: a discovery-advertisement loop on a timer, and a
    /// blocking accept loop, each consumer handed off to `core` once its
    /// handshake is read (spec §4.4 "discover").
    pub fn run(self, core: Arc<Mutex<Core>>, new_consumer_tx: Sender<NewConsumer>) {
        let tag = self.tag.clone();
        let advertise_logger = self.logger.clone();
        let port = self.port;
        std::thread::spawn(move || loop {
            let path = evbus_core::names::discovery_queue(&tag);
            if let Ok(sender) = QueueSender::connect(&path) {
                let msg = BufferMsg::port_advertisement(port);
                if sender.try_send(&msg).is_err() {
                    warn!(advertise_logger, "discovery advertisement failed");
                }
            }
            std::thread::sleep(Duration::from_millis(500));
        });

        info!(self.logger, "accepting consumer connections"; "port" => self.port);
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    error!(self.logger, "accept failed"; "error" => %e);
                    continue;
                }
            };
            match read_request(stream) {
                Ok((request, stream)) => {
                    let mio_stream = MioTcpStream::from_std(stream);
                    let mut guard = core.lock().expect("core mutex poisoned");
                    match guard.register_consumer(request, mio_stream) {
                        Ok(id) => {
                            let queue_index = guard
                                .consumers[id as usize]
                                .as_ref()
                                .map(|s| s.queue_index)
                                .unwrap_or(0);
                            let ack_failed = guard.consumers[id as usize]
                                .as_mut()
                                .map(|s| write_ack(&mut s.transition_socket, queue_index).is_err())
                                .unwrap_or(true);
                            if !ack_failed {
                                guard.replay_initial(id);
                            } else {
                                warn!(self.logger, "failed to ack registration"; "id" => id);
                            }
                            drop(guard);
                            let _ = new_consumer_tx.send(NewConsumer { id });
                        }
                        Err(e) => error!(self.logger, "registration failed"; "error" => %e),
                    }
                }
                Err(e) => error!(self.logger, "handshake failed"; "error" => %e),
            }
        }
    }
}

/// Reads the fixed 5-byte registration request: one tag byte (`0` =
/// serial, `1` = partition) followed by a little-endian `u32` partition
/// index (ignored for serial requests).
fn read_request(mut stream: TcpStream) -> std::io::Result<(ClientRequest, TcpStream)> {
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf)?;
    let request = if buf[0] == 0 {
        ClientRequest::Serial
    } else {
        let q = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        ClientRequest::Partition(q)
    };
    Ok((request, stream))
}

/// Writes the registration ack: one success byte followed by the
/// little-endian assigned queue index the consumer must bind/connect its
/// event queues to (spec §4.4 "initialize_client").
fn write_ack(stream: &mut MioTcpStream, queue_index: u32) -> std::io::Result<()> {
    let mut buf = [0u8; 5];
    buf[0] = 1;
    buf[1..5].copy_from_slice(&queue_index.to_le_bytes());
    stream.write_all(&buf)
}
