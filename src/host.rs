//! Host-side buffer images and the completed-capture handle.

use crate::completion::ItemDescriptor;
use crate::layout::BufferLayout;
use crate::segment::Region;
use std::sync::Arc;

/// A host-memory image that one capture-buffer cycle drains into.
///
/// The engine fills the image incrementally: workers copy payload bytes and
/// descriptor words as batches complete, and the master writes the header
/// last, when the buffer retires. Until the owning [`CompletedCapture`]
/// arrives on the completion channel, partial reads may observe unfinished
/// regions; afterwards the whole image is stable.
pub struct HostBuffer {
    layout: BufferLayout,
    region: Region,
}

impl HostBuffer {
    /// Allocate a zeroed image for the given layout.
    pub fn new(layout: BufferLayout) -> Self {
        let region = Region::zeroed(layout.total_bytes());
        Self { layout, region }
    }

    /// The image layout.
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Returns true if the image has zero size.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Copy `bytes` into the image at `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Region::write`]: no concurrent access to the
    /// target range. The engine guarantees this by only issuing transfers
    /// for disjoint regions.
    pub(crate) unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        // SAFETY: forwarded contract.
        unsafe { self.region.write(offset, bytes) };
    }

    /// Buffer sequence number from the header.
    pub fn buffer_seq(&self) -> u64 {
        // SAFETY: header range is in bounds for any layout; the caller's
        // read-after-completion contract orders it after the final write.
        let bytes = unsafe { self.region.slice(0, 8) };
        u64::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Finalized item count from the header.
    pub fn total_items(&self) -> u32 {
        // SAFETY: as in buffer_seq.
        let bytes = unsafe { self.region.slice(8, 4) };
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Decode item `item`'s descriptor from the descriptor table.
    pub fn descriptor(&self, item: u32) -> ItemDescriptor {
        let offset = self.layout.descriptor_at(item);
        // SAFETY: descriptor_at bounds-checks the item index in debug and
        // the range is within the table region; completion ordering applies.
        let bytes = unsafe { self.region.slice(offset, 8) };
        ItemDescriptor::decode(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// The payload bytes a descriptor points at.
    pub fn item_payload(&self, desc: ItemDescriptor) -> &[u8] {
        let start = self.layout.payload_offset + desc.offset_blocks as usize * self.layout.block_size;
        let len = desc.blocks as usize * self.layout.block_size;
        // SAFETY: descriptors committed by the engine always stay within the
        // payload region; completion ordering applies.
        unsafe { self.region.slice(start, len) }
    }
}

/// A fully drained capture buffer cycle, delivered on the completion channel.
///
/// Holding this handle is the license to read every region of `host`.
#[derive(Clone)]
pub struct CompletedCapture {
    /// The filled host image.
    pub host: Arc<HostBuffer>,
    /// Sequence number of the cycle that produced it.
    pub buffer_seq: u64,
    /// Items the cycle committed, including reserved control slots.
    pub total_items: u32,
    /// Batches the master dispatched while draining.
    pub batches: u32,
}
