//! The packed buffer-descriptor word and its saturating atomic cell.
//!
//! The allocator's entire shared state is one 64-bit word holding the
//! current buffer's id, its next free payload offset, and its item count:
//!
//! ```text
//! bits  0..24  offset   next free payload offset, in blocks
//! bits 24..32  pad      saturation headroom (always zero in valid words)
//! bits 32..42  count    items allocated so far
//! bits 42..64  base     buffer id + 1; 0 means "no buffer installed"
//! ```
//!
//! An allocation is one atomic saturating add of `{offset: blocks, count: 1}`
//! against this word. Because the adds serialize, the pre-update value each
//! caller gets back is a consistent snapshot: no two callers ever receive
//! overlapping payload ranges or the same item index, with no lock anywhere.
//!
//! Saturation clamps each field at its all-ones value instead of wrapping.
//! Valid configurations keep every legitimate offset and count far below the
//! field maxima, so a clamped field is always distinguishable from a real
//! allocation and doubles as the overflow signal.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bit width of the packed offset field.
pub const OFFSET_BITS: u32 = 24;
/// Bit width of the saturation headroom between offset and count.
pub const PAD_BITS: u32 = 8;
/// Bit width of the packed count field.
pub const COUNT_BITS: u32 = 10;
/// Bit width of the packed base (buffer id) field.
pub const BASE_BITS: u32 = 22;

const COUNT_SHIFT: u32 = OFFSET_BITS + PAD_BITS;
const BASE_SHIFT: u32 = COUNT_SHIFT + COUNT_BITS;

/// Saturation value of the offset field.
pub const OFFSET_MAX: u32 = (1 << OFFSET_BITS) - 1;
/// Saturation value of the count field.
pub const COUNT_MAX: u32 = (1 << COUNT_BITS) - 1;
/// Largest encodable base value.
pub const BASE_MAX: u32 = (1 << BASE_BITS) - 1;

/// Decoded view of the packed descriptor word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedDesc {
    /// Next free payload offset, in blocks.
    pub offset: u32,
    /// Items allocated so far.
    pub count: u32,
    /// Buffer id + 1; 0 is the "unset" sentinel.
    pub base: u32,
}

impl PackedDesc {
    /// A fresh descriptor for buffer `base` with nothing allocated.
    pub fn empty(base: u32) -> Self {
        Self {
            offset: 0,
            count: 0,
            base,
        }
    }

    /// Encode into the packed word.
    pub fn encode(self) -> u64 {
        debug_assert!(self.offset <= OFFSET_MAX);
        debug_assert!(self.count <= COUNT_MAX);
        debug_assert!(self.base <= BASE_MAX);
        (self.offset as u64)
            | ((self.count as u64) << COUNT_SHIFT)
            | ((self.base as u64) << BASE_SHIFT)
    }

    /// Decode from the packed word.
    pub fn decode(raw: u64) -> Self {
        Self {
            offset: (raw & OFFSET_MAX as u64) as u32,
            count: ((raw >> COUNT_SHIFT) & COUNT_MAX as u64) as u32,
            base: ((raw >> BASE_SHIFT) & BASE_MAX as u64) as u32,
        }
    }

    /// True if no buffer is installed (startup state).
    pub fn is_unset(&self) -> bool {
        self.base == 0
    }
}

/// The shared atomic cell all allocator clients race on.
pub struct AllocSlot {
    raw: AtomicU64,
}

impl AllocSlot {
    /// Create an unset slot (`base == 0`, nothing allocated).
    pub fn new() -> Self {
        Self {
            raw: AtomicU64::new(0),
        }
    }

    /// Atomically add `blocks` to the offset and 1 to the count, saturating
    /// each field at its all-ones value, and return the pre-update view.
    ///
    /// Implemented as a CAS loop so the two fields move as one unit and
    /// neither can spill into its neighbor when it clamps.
    pub fn fetch_add_sat(&self, blocks: u32) -> PackedDesc {
        let mut current = self.raw.load(Ordering::Relaxed);
        loop {
            let desc = PackedDesc::decode(current);
            let next = PackedDesc {
                offset: desc.offset.saturating_add(blocks).min(OFFSET_MAX),
                count: (desc.count + 1).min(COUNT_MAX),
                base: desc.base,
            };
            match self.raw.compare_exchange_weak(
                current,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return desc,
                Err(actual) => current = actual,
            }
        }
    }

    /// Overwrite the whole word with a freshly initialized descriptor.
    ///
    /// Used only when publishing a new buffer. Racing adds against the old
    /// word are lost: their callers observed an invalid pre-update view and
    /// will re-run the add on the new word.
    pub fn publish(&self, desc: PackedDesc) {
        self.raw.store(desc.encode(), Ordering::Release);
    }

    /// Read the current descriptor without modifying it.
    pub fn load(&self) -> PackedDesc {
        PackedDesc::decode(self.raw.load(Ordering::Acquire))
    }
}

impl Default for AllocSlot {
    fn default() -> Self {
        Self::new()
    }
}
