//! Deterministic, tag-derived names for the shared-memory object and every
//! control channel. Resolved from the original `XtcMonitorMsg` static
//! naming helpers (`sharedMemoryName`, `eventInputQueue`, ...), substituting
//! this repo's own prefix (SPEC_FULL.md §10). Names must match byte-for-byte
//! between producer and consumer, so every one of these is a pure function
//! of `tag` and (where relevant) a small integer.

use std::path::PathBuf;

fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(dir)
    } else {
        PathBuf::from("/tmp")
    }
}

fn socket_path(name: &str) -> PathBuf {
    runtime_dir().join(format!("{}.sock", name))
}

pub fn shm_name(tag: &str) -> String {
    format!("evbus.shm.{}", tag)
}

/// `i` is a consumer id (`0..max_clients`), not a partition index: each
/// consumer gets its own dedicated delivery/return pair regardless of
/// whether it requested serial or round-robin delivery, since a Unix
/// datagram socket can only ever be bound by one process (DESIGN.md Open
/// Question — the original's POSIX mqueues let several readers race on
/// one shared queue, which this transport can't reproduce).
pub fn event_input_queue(tag: &str, i: u32) -> PathBuf {
    socket_path(&format!("evbus.evq.{}.in.{}", tag, i))
}

pub fn event_output_queue(tag: &str, i: u32) -> PathBuf {
    socket_path(&format!("evbus.evq.{}.out.{}", tag, i))
}

pub fn discovery_queue(tag: &str) -> PathBuf {
    socket_path(&format!("evbus.disc.{}", tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(
            event_input_queue("run1", 2),
            event_input_queue("run1", 2)
        );
        assert_ne!(event_input_queue("run1", 1), event_input_queue("run1", 2));
    }
}
