//! The datagram taxonomy the bus inspects. Everything else about a datagram
//! (its payload layout) is the producer/consumer application's business —
//! the bus only ever looks at `service` and `payload_len`.

/// Service code carried in a datagram's header.
///
/// The first ten form five paired transitions; each pair's closing code is
/// exactly `opening + 1`. `L1Accept` is unpaired and is the only data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Service {
    Map = 0,
    Unmap = 1,
    Configure = 2,
    Unconfigure = 3,
    BeginRun = 4,
    EndRun = 5,
    BeginCalibCycle = 6,
    EndCalibCycle = 7,
    Enable = 8,
    Disable = 9,
    L1Accept = 10,
}

impl Service {
    pub const NUMBER_OF: u8 = 11;

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<Service> {
        use Service::*;
        match code {
            0 => Some(Map),
            1 => Some(Unmap),
            2 => Some(Configure),
            3 => Some(Unconfigure),
            4 => Some(BeginRun),
            5 => Some(EndRun),
            6 => Some(BeginCalibCycle),
            7 => Some(EndCalibCycle),
            8 => Some(Enable),
            9 => Some(Disable),
            10 => Some(L1Accept),
            _ => None,
        }
    }

    /// A datagram with this service is a transition (anything but `L1Accept`).
    #[inline]
    pub fn is_transition(self) -> bool {
        self != Service::L1Accept
    }

    /// Opening transitions have an even, non-`L1Accept` code.
    #[inline]
    pub fn is_opening(self) -> bool {
        self.is_transition() && self.code() & 1 == 0
    }

    /// Closing transitions have an odd code.
    #[inline]
    pub fn is_closing(self) -> bool {
        self.is_transition() && self.code() & 1 == 1
    }

    /// The code this transition pairs with (`code ^ 1`), meaningless for
    /// `L1Accept`.
    #[inline]
    pub fn paired_code(self) -> u8 {
        self.code() ^ 1
    }
}

/// Fixed-size header every datagram carries ahead of its variable payload.
/// `payload_len` is validated by the scheduler against the buffer size `S`
/// before anything is copied into shared memory (spec §4.3 step 1).
#[derive(Debug, Clone, Copy)]
pub struct DatagramHeader {
    pub service: Service,
    pub payload_len: u32,
}

impl DatagramHeader {
    pub const SIZE: usize = 8;

    pub fn total_len(&self) -> usize {
        Self::SIZE + self.payload_len as usize
    }
}

/// A datagram as submitted to the bus: header plus an owned payload. The
/// payload's on-wire format beyond its length is out of scope (spec §1).
pub struct Datagram {
    pub header: DatagramHeader,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn new(service: Service, payload: Vec<u8>) -> Self {
        Datagram {
            header: DatagramHeader {
                service,
                payload_len: payload.len() as u32,
            },
            payload,
        }
    }

    pub fn len(&self) -> usize {
        DatagramHeader::SIZE + self.payload.len()
    }

    /// Writes `header` followed by `payload` into `dst`. Panics if `dst` is
    /// too small; callers must have already checked `len() <= S`.
    pub fn encode_into(&self, dst: &mut [u8]) {
        dst[0] = self.header.service.code();
        dst[1..4].copy_from_slice(&[0, 0, 0]);
        dst[4..8].copy_from_slice(&self.header.payload_len.to_ne_bytes());
        dst[8..8 + self.payload.len()].copy_from_slice(&self.payload);
    }

    /// Reads a header back out of a buffer slot; used by consumers and by
    /// the transition cache when it needs to know what is sitting in a
    /// transition buffer.
    pub fn decode_header(src: &[u8]) -> Option<DatagramHeader> {
        let service = Service::from_code(src[0])?;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[4..8]);
        Some(DatagramHeader {
            service,
            payload_len: u32::from_ne_bytes(len_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_closing_pairing() {
        assert!(Service::Map.is_opening());
        assert!(Service::Unmap.is_closing());
        assert_eq!(Service::Map.paired_code(), Service::Unmap.code());
        assert!(!Service::L1Accept.is_opening());
        assert!(!Service::L1Accept.is_closing());
    }

    #[test]
    fn header_roundtrip() {
        let dg = Datagram::new(Service::Configure, vec![1, 2, 3, 4]);
        let mut buf = [0u8; 64];
        dg.encode_into(&mut buf);
        let header = Datagram::decode_header(&buf).unwrap();
        assert_eq!(header.service, Service::Configure);
        assert_eq!(header.payload_len, 4);
    }
}
