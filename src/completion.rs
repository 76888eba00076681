//! Completion tracking: the atomic ready bitmap and the descriptor table.
//!
//! Producers publish a finished item in two steps: store its descriptor
//! (release), then set its ready bit (release). The master scans bits with
//! acquire loads, so a visible bit guarantees a fully visible descriptor;
//! a reader can never observe a torn or default descriptor behind a set bit.

use std::sync::atomic::{AtomicU64, Ordering};

/// One item's placement record, packed into a single 64-bit word:
/// `offset_blocks:16 | blocks:16 | sequence:32`.
///
/// Written once at commit time and never mutated until the buffer recycles.
/// A committed item always has `blocks != 0`, so the all-zero default is
/// recognizably invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemDescriptor {
    /// Payload offset within the buffer, in blocks.
    pub offset_blocks: u16,
    /// Payload length, in blocks (never 0 for a committed item).
    pub blocks: u16,
    /// Capture sequence number assigned by the producer.
    pub sequence: u32,
}

impl ItemDescriptor {
    /// Encode into the packed word.
    pub fn encode(self) -> u64 {
        (self.offset_blocks as u64) | ((self.blocks as u64) << 16) | ((self.sequence as u64) << 32)
    }

    /// Decode from the packed word.
    pub fn decode(raw: u64) -> Self {
        Self {
            offset_blocks: (raw & 0xffff) as u16,
            blocks: ((raw >> 16) & 0xffff) as u16,
            sequence: (raw >> 32) as u32,
        }
    }
}

/// Write-once table of item descriptors, one packed word per slot.
pub struct DescriptorTable {
    entries: Box<[AtomicU64]>,
}

impl DescriptorTable {
    /// Create a table with `slots` entries.
    pub fn new(slots: u32) -> Self {
        let entries = (0..slots).map(|_| AtomicU64::new(0)).collect();
        Self { entries }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record item `slot`'s descriptor. Must happen before the matching
    /// ready bit is set.
    pub fn record(&self, slot: u32, desc: ItemDescriptor) {
        debug_assert!(desc.blocks != 0, "committed item must occupy blocks");
        self.entries[slot as usize].store(desc.encode(), Ordering::Release);
    }

    /// Load item `slot`'s descriptor.
    pub fn load(&self, slot: u32) -> ItemDescriptor {
        ItemDescriptor::decode(self.entries[slot as usize].load(Ordering::Acquire))
    }

    /// Load the raw packed word (for mirroring into a host image).
    pub fn load_raw(&self, slot: u32) -> u64 {
        self.entries[slot as usize].load(Ordering::Acquire)
    }
}

/// Atomic bitmap of completed items, one bit per item slot.
///
/// Bits are set exactly once per buffer lifetime and only cleared wholesale
/// when the buffer recycles.
pub struct CompletionBitmap {
    words: Box<[AtomicU64]>,
    num_slots: u32,
}

impl CompletionBitmap {
    /// Create a bitmap tracking `num_slots` items, all clear.
    pub fn new(num_slots: u32) -> Self {
        let num_words = (num_slots as usize).div_ceil(64);
        let words = (0..num_words).map(|_| AtomicU64::new(0)).collect();
        Self { words, num_slots }
    }

    /// Number of tracked slots.
    pub fn capacity(&self) -> u32 {
        self.num_slots
    }

    /// Mark item `slot` ready. Release-ordered: everything written before
    /// this call is visible to a scanner that observes the bit.
    pub fn set(&self, slot: u32) {
        assert!(slot < self.num_slots, "slot index out of bounds");
        let word = (slot / 64) as usize;
        let bit = 1u64 << (slot % 64);
        let prev = self.words[word].fetch_or(bit, Ordering::Release);
        debug_assert_eq!(prev & bit, 0, "completion bit set twice for slot {slot}");
    }

    /// Check whether item `slot` is marked ready.
    pub fn is_set(&self, slot: u32) -> bool {
        if slot >= self.num_slots {
            return false;
        }
        let word = (slot / 64) as usize;
        let bit = 1u64 << (slot % 64);
        self.words[word].load(Ordering::Acquire) & bit != 0
    }

    /// Count the consecutive ready bits starting at `first`, reading at most
    /// `window_words` bitmap words.
    ///
    /// This is the master's batching primitive: a return of `n > 0` means
    /// items `first .. first + n` are all ready, and the scan is guaranteed
    /// not to have skipped an unready item.
    pub fn ready_run(&self, first: u32, window_words: usize) -> u32 {
        if first >= self.num_slots {
            return 0;
        }
        let mut run = 0u32;
        let mut slot = first;
        let mut words_read = 0usize;
        loop {
            let word_idx = (slot / 64) as usize;
            if word_idx >= self.words.len() {
                break;
            }
            let bit = slot % 64;
            let word = self.words[word_idx].load(Ordering::Acquire) >> bit;
            if word & 1 == 0 {
                break;
            }
            let avail = 64 - bit;
            // Trailing ones of the shifted word, capped at the bits we
            // actually shifted in.
            let consecutive = (!word).trailing_zeros().min(avail);
            run += consecutive;
            slot += consecutive;
            words_read += 1;
            if consecutive < avail || words_read >= window_words {
                break;
            }
        }
        run.min(self.num_slots - first)
    }

    /// Clear every bit. Called only while no producer holds a reservation
    /// against this buffer (recycle time).
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_descriptor_round_trip() {
        let desc = ItemDescriptor {
            offset_blocks: 513,
            blocks: 9,
            sequence: 0xdead_beef,
        };
        assert_eq!(ItemDescriptor::decode(desc.encode()), desc);
    }

    #[test]
    fn test_table_record_load() {
        let table = DescriptorTable::new(16);
        let desc = ItemDescriptor {
            offset_blocks: 4,
            blocks: 2,
            sequence: 77,
        };
        table.record(3, desc);
        assert_eq!(table.load(3), desc);
        assert_eq!(table.load(4).blocks, 0); // untouched slot is default
    }

    #[test]
    fn test_set_and_is_set() {
        let bitmap = CompletionBitmap::new(100);
        assert!(!bitmap.is_set(70));
        bitmap.set(70);
        assert!(bitmap.is_set(70));
        assert!(!bitmap.is_set(71));
    }

    #[test]
    fn test_ready_run_basic() {
        let bitmap = CompletionBitmap::new(128);
        assert_eq!(bitmap.ready_run(0, 2), 0);
        bitmap.set(0);
        bitmap.set(1);
        bitmap.set(2);
        bitmap.set(4); // gap at 3
        assert_eq!(bitmap.ready_run(0, 2), 3);
        assert_eq!(bitmap.ready_run(3, 2), 0);
        assert_eq!(bitmap.ready_run(4, 2), 1);
    }

    #[test]
    fn test_ready_run_crosses_word_boundary() {
        let bitmap = CompletionBitmap::new(256);
        for slot in 60..70 {
            bitmap.set(slot);
        }
        assert_eq!(bitmap.ready_run(60, 2), 10);
        // A one-word window stops at the boundary.
        assert_eq!(bitmap.ready_run(60, 1), 4);
    }

    #[test]
    fn test_ready_run_window_cap() {
        let bitmap = CompletionBitmap::new(256);
        for slot in 0..200 {
            bitmap.set(slot);
        }
        // Two full words from slot 0.
        assert_eq!(bitmap.ready_run(0, 2), 128);
        assert_eq!(bitmap.ready_run(128, 2), 72);
    }

    #[test]
    fn test_ready_run_stops_at_capacity() {
        let bitmap = CompletionBitmap::new(10);
        for slot in 0..10 {
            bitmap.set(slot);
        }
        assert_eq!(bitmap.ready_run(0, 2), 10);
        assert_eq!(bitmap.ready_run(10, 2), 0);
    }

    #[test]
    fn test_clear_resets_all_bits() {
        let bitmap = CompletionBitmap::new(128);
        bitmap.set(0);
        bitmap.set(127);
        bitmap.clear();
        assert!(!bitmap.is_set(0));
        assert!(!bitmap.is_set(127));
        assert_eq!(bitmap.ready_run(0, 2), 0);
    }

    /// A scanner that observes a set bit must see the descriptor written
    /// before it, never the all-zero default.
    #[test]
    fn test_bit_implies_visible_descriptor() {
        let slots = 512u32;
        let bitmap = Arc::new(CompletionBitmap::new(slots));
        let table = Arc::new(DescriptorTable::new(slots));

        let writer = {
            let bitmap = Arc::clone(&bitmap);
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for slot in 0..slots {
                    table.record(
                        slot,
                        ItemDescriptor {
                            offset_blocks: slot as u16,
                            blocks: 1,
                            sequence: slot,
                        },
                    );
                    bitmap.set(slot);
                }
            })
        };

        let mut next = 0u32;
        while next < slots {
            let run = bitmap.ready_run(next, 8);
            for slot in next..next + run {
                let desc = table.load(slot);
                assert_ne!(desc.blocks, 0, "torn descriptor behind set bit {slot}");
                assert_eq!(desc.sequence, slot);
            }
            next += run;
        }
        writer.join().unwrap();
    }
}
