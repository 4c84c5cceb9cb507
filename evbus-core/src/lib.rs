pub mod config;
pub mod datagram;
pub mod error;
pub mod logging;
pub mod names;
pub mod pool;
pub mod queue;
pub mod transitions;
pub mod wire;

pub use config::{BusConfig, ClientRequest, PoolConfig, MAX_CONSUMERS};
pub use datagram::{Datagram, DatagramHeader, Service};
pub use error::{Error, Result};
pub use pool::{BufferPool, BufferPoolReader, PoolGeometry};
pub use transitions::TransitionCache;
pub use wire::{BufferMsg, Mode};
