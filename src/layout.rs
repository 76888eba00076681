//! Host-buffer image layout.
//!
//! A completed capture buffer is mirrored into a host-provided region with a
//! fixed internal layout: a one-block header, the completion bitmap region,
//! the item descriptor table, and finally the payload area at a block-aligned
//! offset. Workers write the descriptor table and payload; the master writes
//! the header when the buffer retires. The bitmap region is reserved in the
//! image but never transferred (a set bit is only meaningful engine-side).

/// Bytes reserved for the header at the front of the image.
///
/// One block on the default configuration; holds the buffer sequence number
/// and the finalized item count, with room to spare.
pub const HEADER_BYTES: usize = 64;

/// Bytes of one encoded item descriptor (see
/// [`ItemDescriptor`](crate::completion::ItemDescriptor)).
pub const DESCRIPTOR_BYTES: usize = 8;

/// Named fixed offsets of the regions inside a host-buffer image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Allocation granule in bytes.
    pub block_size: usize,
    /// Payload capacity in blocks.
    pub buffer_blocks: u32,
    /// Item descriptor slots.
    pub max_items: u32,
    /// Byte offset of the completion bitmap region.
    pub bitmap_offset: usize,
    /// Bytes reserved for the bitmap region.
    pub bitmap_bytes: usize,
    /// Byte offset of the descriptor table.
    pub descriptor_offset: usize,
    /// Bytes of the descriptor table.
    pub descriptor_bytes: usize,
    /// Byte offset of the payload area (block aligned).
    pub payload_offset: usize,
    /// Bytes of the payload area.
    pub payload_bytes: usize,
}

impl BufferLayout {
    /// Compute the layout for the given geometry.
    pub fn new(block_size: usize, buffer_blocks: u32, max_items: u32) -> Self {
        let bitmap_offset = HEADER_BYTES;
        // One bit per item slot, rounded up to whole 64-bit words.
        let bitmap_bytes = (max_items as usize).div_ceil(64) * 8;
        let descriptor_offset = bitmap_offset + bitmap_bytes;
        let descriptor_bytes = max_items as usize * DESCRIPTOR_BYTES;
        let payload_offset = (descriptor_offset + descriptor_bytes).next_multiple_of(block_size);
        let payload_bytes = buffer_blocks as usize * block_size;
        Self {
            block_size,
            buffer_blocks,
            max_items,
            bitmap_offset,
            bitmap_bytes,
            descriptor_offset,
            descriptor_bytes,
            payload_offset,
            payload_bytes,
        }
    }

    /// Total bytes of the host image.
    pub fn total_bytes(&self) -> usize {
        self.payload_offset + self.payload_bytes
    }

    /// Byte offset of item `item`'s descriptor within the image.
    pub fn descriptor_at(&self, item: u32) -> usize {
        debug_assert!(item < self.max_items);
        self.descriptor_offset + item as usize * DESCRIPTOR_BYTES
    }
}
