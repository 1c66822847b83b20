//! Bounded many-writer/single-reader record ring.
//!
//! Writers reserve a ticket with a CAS on `head`; the ticket selects a slot,
//! which moves EMPTY -> WRITING -> READY. The reader consumes slots in ticket
//! order and stops at the first one that is not READY yet, so records come out
//! in reservation order. A reservation fails, and the record is dropped, when
//! the ring is full or the record does not fit in a slot.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use bytemuck::Pod;
use tuner_ebpf_common::engine::Channel;

/// Largest record a slot holds.
pub const SLOT_BYTES: usize = 64;

mod slot_state {
    pub const EMPTY: u8 = 0;
    pub const WRITING: u8 = 1;
    pub const READY: u8 = 2;
}

struct Slot {
    state: AtomicU8,
    len: UnsafeCell<usize>,
    data: UnsafeCell<[u8; SLOT_BYTES]>,
}

pub struct RecordRing {
    slots: Box<[Slot]>,
    mask: u64,
    /// Next ticket to hand out.
    head: AtomicU64,
    /// Next ticket to consume.
    tail: AtomicU64,
    reading: AtomicBool,
    dropped: AtomicU64,
}

// SAFETY: a slot's payload is written only by the producer holding its ticket
// while the slot is WRITING, and read only by the single reader once READY.
unsafe impl Sync for RecordRing {}
unsafe impl Send for RecordRing {}

impl RecordRing {
    /// `slots` is rounded up to a power of two.
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1).next_power_of_two();
        Self {
            slots: (0..slots)
                .map(|_| Slot {
                    state: AtomicU8::new(slot_state::EMPTY),
                    len: UnsafeCell::new(0),
                    data: UnsafeCell::new([0; SLOT_BYTES]),
                })
                .collect(),
            mask: slots as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            reading: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Ring sized like a kernel channel of `bytes`.
    pub fn with_byte_size(bytes: usize) -> Self {
        Self::new(bytes / SLOT_BYTES)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Records committed or in flight, not yet consumed.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records refused since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn reserve(&self) -> Option<&Slot> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) > self.mask {
                return None;
            }
            match self.head.compare_exchange_weak(
                head,
                head + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        let slot = &self.slots[(head & self.mask) as usize];
        slot.state.store(slot_state::WRITING, Ordering::Relaxed);
        Some(slot)
    }

    /// Copies `bytes` into the ring as one record.
    pub fn push(&self, bytes: &[u8]) -> bool {
        if bytes.len() > SLOT_BYTES {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(slot) = self.reserve() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        // SAFETY: the ticket gives this producer exclusive use of the slot
        // until it is marked READY.
        unsafe {
            (*slot.data.get())[..bytes.len()].copy_from_slice(bytes);
            *slot.len.get() = bytes.len();
        }
        slot.state.store(slot_state::READY, Ordering::Release);
        true
    }

    /// Hands every consecutive committed record to `f`, in reservation order.
    /// Returns the number consumed; 0 if another reader is active.
    pub fn drain<F: FnMut(&[u8])>(&self, mut f: F) -> usize {
        if self
            .reading
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }
        let mut consumed = 0;
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            if tail == self.head.load(Ordering::Acquire) {
                break;
            }
            let slot = &self.slots[(tail & self.mask) as usize];
            if slot.state.load(Ordering::Acquire) != slot_state::READY {
                break;
            }
            // SAFETY: READY slots are not touched by producers until the
            // tail moves past them.
            unsafe {
                let len = *slot.len.get();
                f(&(*slot.data.get())[..len]);
            }
            slot.state.store(slot_state::EMPTY, Ordering::Relaxed);
            self.tail.store(tail + 1, Ordering::Release);
            consumed += 1;
        }
        self.reading.store(false, Ordering::Release);
        consumed
    }

    /// Convenience for tests and the simulator.
    pub fn drain_vec(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.drain(|rec| out.push(rec.to_vec()));
        out
    }
}

impl Channel for RecordRing {
    fn emit<T: Pod, F: FnOnce(&mut T)>(&self, fill: F) -> bool {
        if std::mem::size_of::<T>() > SLOT_BYTES {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut record = T::zeroed();
        fill(&mut record);
        self.push(bytemuck::bytes_of(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drops_when_full_and_recovers_after_drain() {
        let ring = RecordRing::new(4);
        for i in 0..4u32 {
            assert!(ring.push(&i.to_le_bytes()));
        }
        assert!(!ring.push(&[9]));
        assert_eq!(ring.dropped(), 1);

        let records = ring.drain_vec();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0], 0u32.to_le_bytes());
        assert_eq!(records[3], 3u32.to_le_bytes());
        assert!(ring.push(&[1]));
    }

    #[test]
    fn slot_count_rounds_up_to_a_power_of_two() {
        assert_eq!(RecordRing::new(3).capacity(), 4);
        assert_eq!(RecordRing::new(0).capacity(), 1);
        assert_eq!(RecordRing::with_byte_size(4096).capacity(), 4096 / SLOT_BYTES);
    }

    #[test]
    fn oversized_records_are_refused() {
        let ring = RecordRing::new(2);
        assert!(!ring.push(&[0u8; SLOT_BYTES + 1]));
        assert!(ring.is_empty());
        assert_eq!(ring.dropped(), 1);
    }

    #[test]
    fn emit_zero_fills_before_commit() {
        let ring = RecordRing::new(2);
        assert!(ring.emit(|v: &mut [u64; 2]| v[1] = 7));
        let records = ring.drain_vec();
        let value: [u64; 2] = bytemuck::pod_read_unaligned(&records[0]);
        assert_eq!(value, [0, 7]);
    }

    #[test]
    fn concurrent_writers_lose_nothing_within_capacity() {
        let ring = Arc::new(RecordRing::new(4096));
        let writers: Vec<_> = (0..4u32)
            .map(|w| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        assert!(ring.push(&(w * 1000 + i).to_le_bytes()));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        let records = ring.drain_vec();
        assert_eq!(records.len(), 2000);
        // per-writer order survives interleaving
        for w in 0..4u32 {
            let seq: Vec<u32> = records
                .iter()
                .map(|r| u32::from_le_bytes([r[0], r[1], r[2], r[3]]))
                .filter(|v| v / 1000 == w)
                .collect();
            assert!(seq.windows(2).all(|p| p[0] < p[1]));
        }
    }
}
