//! The shared buffer pool: a contiguous region of `Nev` event buffers
//! followed by `Ntr` transition buffers, each of fixed size `S`, rounded up
//! to a page (spec §3, §4.1). Carries no logic; it is memory.
//!
//! Grounded on the original's `shm_open`/`ftruncate`/`mmap` sequence
//! (`XtcMonitorServer::_init`), expressed with `memmap2` the way the
//! retrieved `shm`/`ring_buffer` example does it rather than raw `mmap(2)`.

use crate::error::{Error, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub event_buffers: u32,
    pub transition_buffers: u32,
    pub buffer_size: u32,
}

impl PoolGeometry {
    pub fn total_buffers(&self) -> u32 {
        self.event_buffers + self.transition_buffers
    }

    /// Index `i < Nev` is an event buffer; `i >= Nev` is a transition
    /// buffer (spec §3).
    pub fn is_event_index(&self, index: u32) -> bool {
        index < self.event_buffers
    }

    fn raw_len(&self) -> usize {
        self.total_buffers() as usize * self.buffer_size as usize
    }

    /// Rounded up to a multiple of the system page size (spec §4.1).
    fn mapped_len(&self) -> usize {
        let page = page_size();
        let raw = self.raw_len();
        let remainder = raw % page;
        if remainder == 0 {
            raw
        } else {
            raw + (page - remainder)
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn shm_name_cstring(tag: &str) -> Result<CString> {
    let name = format!("/{}", crate::names::shm_name(tag));
    CString::new(name).map_err(|e| Error::ShmOpen(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
}

/// The producer's read-write view of the pool. Lives for the producer
/// process (spec §3 "Lifetimes").
pub struct BufferPool {
    geometry: PoolGeometry,
    mmap: MmapMut,
    name: CString,
    unlink_on_drop: bool,
}

impl BufferPool {
    pub fn create(tag: &str, geometry: PoolGeometry, unlink_on_drop: bool) -> Result<BufferPool> {
        let name = shm_name_cstring(tag)?;
        let len = geometry.mapped_len();

        unsafe {
            // Permissive mode: this is the one trust boundary documented in
            // DESIGN.md, matching the original's umask(1) intent of letting
            // unrelated processes on the same host attach.
            let fd = libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666);
            if fd < 0 {
                return Err(Error::ShmOpen(std::io::Error::last_os_error()));
            }
            if libc::ftruncate(fd, len as libc::off_t) < 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(Error::ShmOpen(err));
            }
            let file = File::from_raw_fd(fd);
            let mmap = MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(Error::ShmOpen)?;
            // `file` owns the fd now; let it leak from our perspective but
            // keep it alive by forgetting so the mapping (which duped
            // nothing) stays valid. memmap2 keeps its own fd via dup, so
            // the File can simply be dropped, closing the original fd.
            drop(file);

            Ok(BufferPool {
                geometry,
                mmap,
                name,
                unlink_on_drop,
            })
        }
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    pub fn buffer(&self, index: u32) -> &[u8] {
        let s = self.geometry.buffer_size as usize;
        let off = index as usize * s;
        &self.mmap[off..off + s]
    }

    pub fn buffer_mut(&mut self, index: u32) -> &mut [u8] {
        let s = self.geometry.buffer_size as usize;
        let off = index as usize * s;
        &mut self.mmap[off..off + s]
    }

    /// Copies a datagram's encoded bytes into the named buffer slot.
    pub fn write_datagram(&mut self, index: u32, dg: &crate::datagram::Datagram) -> Result<()> {
        let cap = self.geometry.buffer_size as usize;
        if dg.len() > cap {
            return Err(Error::OversizeDatagram {
                len: dg.len(),
                capacity: cap,
            });
        }
        dg.encode_into(self.buffer_mut(index));
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            unsafe {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

/// A consumer's read-only view of the pool, mapped once at attach time and
/// kept for the consumer's lifetime (spec §3, §4.5 step 3).
pub struct BufferPoolReader {
    geometry: PoolGeometry,
    mmap: Mmap,
}

impl BufferPoolReader {
    pub fn open(tag: &str, geometry: PoolGeometry) -> Result<BufferPoolReader> {
        let name = shm_name_cstring(tag)?;
        let len = geometry.mapped_len();

        unsafe {
            let fd = libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0);
            if fd < 0 {
                return Err(Error::ShmOpen(std::io::Error::last_os_error()));
            }
            let file = File::from_raw_fd(fd);
            let mmap = MmapOptions::new().len(len).map(&file).map_err(Error::ShmOpen)?;
            drop(file);

            Ok(BufferPoolReader { geometry, mmap })
        }
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    pub fn buffer(&self, index: u32) -> &[u8] {
        let s = self.geometry.buffer_size as usize;
        let off = index as usize * s;
        &self.mmap[off..off + s]
    }
}
