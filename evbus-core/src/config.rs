use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

/// Bitmap width capping live consumers (spec §9's "32 in the original, 10
/// under a stricter limit"). Kept stricter here; raise at your own risk —
/// the allocation bitmap is a plain integer type of this many bits.
pub const MAX_CONSUMERS: usize = 10;

pub const DEFAULT_PORT_HINT: u16 = 0; // 0 == let the OS pick an ephemeral port

#[derive(Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    /// Number of event (L1Accept) buffers, `Nev`.
    pub event_buffers: u32,
    /// Number of transition buffers, `Ntr`.
    pub transition_buffers: u32,
    /// Buffer size in bytes, `S`.
    pub buffer_size: u32,
    /// Number of round-robin partitions, `Nq`.
    pub partitions: u32,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            event_buffers: 64,
            transition_buffers: 16,
            buffer_size: 1 << 20,
            partitions: 4,
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct BusConfig {
    /// Identifies the shared memory region and the whole family of queues.
    /// Must be identical between producer and every consumer.
    pub tag: String,
    pub pool: PoolConfig,
    pub max_clients: usize,
    /// Whether the shared region and queues are unlinked at producer
    /// shutdown (spec §5, §9: the original leaves them linked).
    pub unlink_on_shutdown: bool,
}

impl Default for BusConfig {
    fn default() -> BusConfig {
        BusConfig {
            tag: "default".to_owned(),
            pool: PoolConfig::default(),
            max_clients: MAX_CONSUMERS,
            unlink_on_shutdown: false,
        }
    }
}

impl BusConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> BusConfig {
        serdeconv::from_toml_file(path).expect("error loading bus configuration file")
    }

    pub fn total_buffers(&self) -> u32 {
        self.pool.event_buffers + self.pool.transition_buffers
    }
}

/// What a joining consumer asks for at handshake time (spec §6 "Consumer
/// configuration").
#[derive(Debug, Clone, Copy)]
pub enum ClientRequest {
    Serial,
    Partition(u32),
}
