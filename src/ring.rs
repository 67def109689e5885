use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use log::warn;

use crate::util;

/// Capacity of the ring shared by one reader/writer thread pair.
pub const INTRA_THREAD_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Downstream messages never grow past this; the emitter splits oversized
/// transactions at this boundary.
pub const MAX_TRANSACTION_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
struct RingState {
    data: Vec<u8>,
    pos_start: usize,
    pos_end: usize,
}

/// Bounded single-producer/single-consumer byte ring carrying framed
/// messages from a source's reader thread to its target's writer thread.
/// Producers write linearly and rewind to the front once the consumer has
/// drained; blocking happens only on the two condition variables.
#[derive(Debug)]
pub struct CommandBuffer {
    state: Mutex<RingState>,
    readers_cond: Condvar,
    writer_cond: Condvar,
    terminated: AtomicBool,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::with_capacity(INTRA_THREAD_BUFFER_SIZE)
    }
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                data: vec![0u8; capacity],
                pos_start: 0,
                pos_end: 0,
            }),
            readers_cond: Condvar::new(),
            writer_cond: Condvar::new(),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let _unused = self.state.lock().unwrap();
        self.readers_cond.notify_all();
        self.writer_cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Appends one framed message, blocking while the ring is full. A
    /// message that cannot fit even an empty ring is dropped with a
    /// diagnostic.
    pub fn push_message(&self, msg: &[u8]) {
        let need = 4 + util::align4(msg.len());
        let mut state = self.state.lock().unwrap();
        if need > state.data.len() {
            warn!("message of {} bytes exceeds ring capacity, dropped", msg.len());
            return;
        }

        loop {
            if self.is_terminated() {
                return;
            }
            if state.pos_end + need <= state.data.len() {
                let at = state.pos_end;
                util::write32(&mut state.data, at, msg.len() as u32);
                state.data[at + 4..at + 4 + msg.len()].copy_from_slice(msg);
                state.pos_end += need;
                self.writer_cond.notify_all();
                return;
            }
            // tail exhausted: rewind once the consumer has drained
            if state.pos_start == state.pos_end {
                state.pos_start = 0;
                state.pos_end = 0;
                continue;
            }
            state = self.readers_cond.wait(state).unwrap();
        }
    }

    /// Takes the next message, blocking while the ring is empty. Returns
    /// `None` once terminated and drained.
    pub fn pop_message(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.pos_start != state.pos_end {
                let len = util::read32(&state.data, state.pos_start) as usize;
                let at = state.pos_start + 4;
                let msg = state.data[at..at + len].to_vec();
                state.pos_start += 4 + util::align4(len);
                self.readers_cond.notify_all();
                return Some(msg);
            }
            if self.is_terminated() {
                return None;
            }
            state = self.writer_cond.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod ring_tests {
    use std::env::set_var;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn setup() {
        set_var("RUST_LOG", "info");
        crate::util::init();
    }

    #[test]
    fn push_pop_in_order() {
        setup();
        let ring = CommandBuffer::with_capacity(256);
        ring.push_message(b"one");
        ring.push_message(b"two");
        assert_eq!(ring.pop_message().unwrap(), b"one");
        assert_eq!(ring.pop_message().unwrap(), b"two");
    }

    #[test]
    fn rewind_under_pressure() {
        setup();
        // small ring forces many rewinds
        let ring = Arc::new(CommandBuffer::with_capacity(64));
        let producer_ring = ring.clone();

        let producer = thread::spawn(move || {
            for n in 0..100u32 {
                producer_ring.push_message(format!("msg-{:03}", n).as_bytes());
            }
            producer_ring.terminate();
        });

        let mut got = Vec::new();
        while let Some(msg) = ring.pop_message() {
            got.push(String::from_utf8(msg).unwrap());
        }
        producer.join().unwrap();

        assert_eq!(got.len(), 100);
        assert_eq!(got[0], "msg-000");
        assert_eq!(got[99], "msg-099");
    }

    #[test]
    fn terminate_unblocks_consumer() {
        setup();
        let ring = Arc::new(CommandBuffer::new());
        let consumer_ring = ring.clone();
        let consumer = thread::spawn(move || consumer_ring.pop_message());
        ring.terminate();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn oversized_message_is_dropped() {
        setup();
        let ring = CommandBuffer::with_capacity(16);
        ring.push_message(&[0u8; 64]);
        ring.terminate();
        assert!(ring.pop_message().is_none());
    }
}
