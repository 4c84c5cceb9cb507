//! Wire layout for `BufferMsg`, the fixed-width token record that flows over
//! every control channel and the per-consumer transition socket.
//!
//! Four 32-bit fields in declaration order, host byte order (spec §6):
//! `buffer_index` (signed), `buffer_count` (signed), `buffer_size_and_mode`
//! (unsigned; low 28 bits = size, high 4 bits = mode), and a reserved zero
//! field. `NativeEndian` stands in for "host byte order" since these never
//! cross a host boundary.

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

const SIZE_MASK: u32 = 0x0fff_ffff;
const MODE_SHIFT: u32 = 28;

/// A return-queue selector or the serial flag, packed into the high 4 bits
/// of `buffer_size_and_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serial,
    /// 0-based index into the `Nq` partition queues.
    Partition(u32),
}

impl Mode {
    fn pack(self) -> u32 {
        match self {
            Mode::Serial => 0,
            Mode::Partition(q) => q + 1,
        }
    }

    fn unpack(bits: u32) -> Mode {
        if bits == 0 {
            Mode::Serial
        } else {
            Mode::Partition(bits - 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMsg {
    pub buffer_index: i32,
    pub buffer_count: i32,
    buffer_size_and_mode: u32,
    reserved: u32,
}

impl BufferMsg {
    pub const WIRE_SIZE: usize = 16;

    pub fn new(buffer_index: i32, buffer_count: i32, buffer_size: u32, mode: Mode) -> Self {
        BufferMsg {
            buffer_index,
            buffer_count,
            buffer_size_and_mode: (buffer_size & SIZE_MASK) | (mode.pack() << MODE_SHIFT),
            reserved: 0,
        }
    }

    /// Convenience constructor for discovery advertisements, which reuse
    /// this record shape with the port number in `buffer_index` and every
    /// other field zeroed (spec §4.4, §6).
    pub fn port_advertisement(port: u16) -> Self {
        BufferMsg {
            buffer_index: port as i32,
            buffer_count: 0,
            buffer_size_and_mode: 0,
            reserved: 0,
        }
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size_and_mode & SIZE_MASK
    }

    pub fn mode(&self) -> Mode {
        Mode::unpack(self.buffer_size_and_mode >> MODE_SHIFT)
    }

    pub fn is_serial(&self) -> bool {
        matches!(self.mode(), Mode::Serial)
    }

    pub fn read<R: Read>(mut stream: R) -> io::Result<BufferMsg> {
        let buffer_index = stream.read_i32::<NativeEndian>()?;
        let buffer_count = stream.read_i32::<NativeEndian>()?;
        let buffer_size_and_mode = stream.read_u32::<NativeEndian>()?;
        let reserved = stream.read_u32::<NativeEndian>()?;
        Ok(BufferMsg {
            buffer_index,
            buffer_count,
            buffer_size_and_mode,
            reserved,
        })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> io::Result<()> {
        stream.write_i32::<NativeEndian>(self.buffer_index)?;
        stream.write_i32::<NativeEndian>(self.buffer_count)?;
        stream.write_u32::<NativeEndian>(self.buffer_size_and_mode)?;
        stream.write_u32::<NativeEndian>(self.reserved)
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        self.write(&mut buf[..]).expect("fixed-size buffer write cannot fail");
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<BufferMsg> {
        Self::read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_mode_roundtrips() {
        let msg = BufferMsg::new(3, 20, 4096, Mode::Serial);
        let bytes = msg.to_bytes();
        let back = BufferMsg::from_bytes(&bytes).unwrap();
        assert_eq!(back, msg);
        assert!(back.is_serial());
        assert_eq!(back.buffer_size(), 4096);
    }

    #[test]
    fn partition_mode_roundtrips() {
        let msg = BufferMsg::new(7, 20, 4096, Mode::Partition(2));
        let bytes = msg.to_bytes();
        let back = BufferMsg::from_bytes(&bytes).unwrap();
        assert_eq!(back.mode(), Mode::Partition(2));
        assert!(!back.is_serial());
    }
}
