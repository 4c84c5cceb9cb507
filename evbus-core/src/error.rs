use std::io;

/// Errors shared between the producer and consumer halves of the bus.
///
/// Mirrors the hand-rolled error enum the rest of the stack uses: a flat set
/// of named failure modes plus a catch-all `Io` variant, rather than a boxed
/// trait object.
#[derive(Debug)]
pub enum Error {
    /// A named control channel could not be created or opened.
    QueueOpen { name: String, source: io::Error },
    /// The shared-memory region could not be created, sized or mapped.
    ShmOpen(io::Error),
    /// A datagram's header + payload does not fit in a single buffer of
    /// size `S`. Fatal to the producer (spec §4.3 step 1).
    OversizeDatagram { len: usize, capacity: usize },
    /// The transition cache has no free transition buffer. Fatal to the
    /// producer (spec §4.2 `allocate`).
    TransitionPoolExhausted,
    /// More consumers attempted to register than the compile/startup-time
    /// bitmap width allows (spec §9).
    TooManyConsumers { limit: usize },
    /// A peer sent a `BufferMsg` whose buffer index is outside the pool,
    /// or a transition arrived out of the expected sequence.
    ProtocolViolation(String),
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::QueueOpen { name, source } => write!(f, "failed to open queue {}: {}", name, source),
            Error::ShmOpen(e) => write!(f, "failed to open shared memory: {}", e),
            Error::OversizeDatagram { len, capacity } => {
                write!(f, "datagram of {} bytes exceeds buffer capacity {}", len, capacity)
            }
            Error::TransitionPoolExhausted => write!(f, "transition buffer pool exhausted"),
            Error::TooManyConsumers { limit } => write!(f, "consumer limit of {} exceeded", limit),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io(source)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
