//! The producer-facing handle: the only part of this crate the out-of-scope
//! application (the thing that actually produces datagrams) touches (spec
//! §1, §4.3 "Submit path").

use crate::core::Core;
use evbus_core::error::Result;
use evbus_core::{Datagram, Service};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};

pub struct Producer {
    core: Arc<Mutex<Core>>,
    shuffle_tx: SyncSender<(u32, Datagram)>,
    waker: Arc<mio::Waker>,
}

impl Producer {
    pub fn new(core: Arc<Mutex<Core>>, shuffle_tx: SyncSender<(u32, Datagram)>, waker: Arc<mio::Waker>) -> Producer {
        Producer { core, shuffle_tx, waker }
    }

    /// Submits one datagram to the bus. Transitions are fully admitted and
    /// broadcast before this returns; `L1Accept` events are hanced off to
    /// the shuffle path and this returns as soon as a destination token has
    /// been reserved (or immediately, if the event was dropped for lack of
    /// one) — spec §4.3.
    pub fn submit(&self, dg: Datagram) -> Result<()> {
        if dg.header.service == Service::L1Accept {
            let mut guard = self.core.lock().expect("core mutex poisoned");
            let cap = guard.geometry.buffer_size as usize;
            if dg.len() > cap {
                return Err(evbus_core::error::Error::OversizeDatagram {
                    len: dg.len(),
                    capacity: cap,
                });
            }
            match guard.acquire_event_token() {
                Some(buffer_index) => {
                    drop(guard);
                    if self.shuffle_tx.try_send((buffer_index, dg)).is_err() {
                        // The shuffle queue is sized to Nev, so this only
                        // happens under a badly misconfigured pool; treat
                        // it the same as "no free token" (spec §4.3 step 2).
                        let mut guard = self.core.lock().expect("core mutex poisoned");
                        guard.reclaim_token(buffer_index);
                    } else {
                        self.waker.wake().ok();
                    }
                }
                None => { /* pool exhausted: the event is dropped, spec §4.3 step 2 */ }
            }
            Ok(())
        } else {
            let mut guard = self.core.lock().expect("core mutex poisoned");
            guard.submit_transition(dg)
        }
    }
}
