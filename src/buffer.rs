//! Engine-side capture buffers and the fixed buffer registry.

use crate::completion::{CompletionBitmap, DescriptorTable};
use crate::config::EngineConfig;
use crate::host::HostBuffer;
use crate::segment::Region;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of a capture buffer, 1-based so that 0 stays free as the
/// "no buffer" sentinel in the packed allocator word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

impl BufferId {
    /// Zero-based index into the registry.
    pub fn index(self) -> usize {
        debug_assert!(self.0 >= 1);
        (self.0 - 1) as usize
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// One capture buffer: payload region plus the tracking state that lets
/// producers fill it and the transfer side drain it without locks.
///
/// Buffers are allocated once at engine startup and cycle through
/// filling, draining, and re-arming for their whole lifetime.
pub struct CaptureBuffer {
    id: BufferId,
    buffer_seq: AtomicU64,
    /// Finalized item count. 0 means "still filling"; a committed buffer
    /// always holds at least the reserved control items, so 0 is never a
    /// legitimate final count.
    total_items: AtomicU32,
    transfers_completed: AtomicU32,
    bitmap: CompletionBitmap,
    descriptors: DescriptorTable,
    payload: Region,
    host: ArcSwapOption<HostBuffer>,
    block_size: usize,
}

impl CaptureBuffer {
    /// Allocate an unpaired buffer for the given geometry.
    pub fn new(id: BufferId, config: &EngineConfig) -> Self {
        Self {
            id,
            buffer_seq: AtomicU64::new(0),
            total_items: AtomicU32::new(0),
            transfers_completed: AtomicU32::new(0),
            bitmap: CompletionBitmap::new(config.max_items),
            descriptors: DescriptorTable::new(config.max_items),
            payload: Region::zeroed(config.buffer_bytes()),
            host: ArcSwapOption::const_empty(),
            block_size: config.block_size,
        }
    }

    /// This buffer's id.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Allocation granule in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The completion bitmap.
    pub fn bitmap(&self) -> &CompletionBitmap {
        &self.bitmap
    }

    /// The descriptor table.
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// The payload region.
    pub fn payload(&self) -> &Region {
        &self.payload
    }

    /// Monotonic sequence number of the current fill cycle.
    pub fn buffer_seq(&self) -> u64 {
        self.buffer_seq.load(Ordering::Acquire)
    }

    /// The host image paired for the current cycle, if any.
    pub fn host(&self) -> Option<Arc<HostBuffer>> {
        self.host.load_full()
    }

    /// Record the final item count. Called exactly once per cycle, by the
    /// single overflow handler that closed this buffer.
    pub fn finalize(&self, total_items: u32) {
        debug_assert!(total_items > 0);
        let prev = self.total_items.swap(total_items, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "buffer finalized twice");
    }

    /// Final item count, or `None` while the buffer is still filling.
    pub fn final_items(&self) -> Option<u32> {
        match self.total_items.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Note one batch's transfers fully completed; returns the new total.
    pub fn note_transfer_complete(&self) -> u32 {
        self.transfers_completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Batches whose transfers have fully completed this cycle.
    pub fn transfers_completed(&self) -> u32 {
        self.transfers_completed.load(Ordering::Acquire)
    }

    /// Re-arm for a new fill cycle: clear tracking state and pair the host
    /// image the cycle will drain into.
    ///
    /// Descriptor table entries are left as-is; they are only read behind
    /// set completion bits, and every bit is cleared here.
    pub fn reset(&self, seq: u64, host: Arc<HostBuffer>) {
        self.bitmap.clear();
        self.total_items.store(0, Ordering::Release);
        self.transfers_completed.store(0, Ordering::Release);
        self.buffer_seq.store(seq, Ordering::Release);
        self.host.store(Some(host));
    }

    /// Drop the host pairing once the cycle's image has been handed back.
    pub fn unpair(&self) -> Option<Arc<HostBuffer>> {
        self.host.swap(None)
    }

    /// Encoded header written to the host image when the buffer retires:
    /// buffer sequence (u64 LE) then final item count (u32 LE) then reserved.
    pub fn header_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.buffer_seq().to_le_bytes());
        let total = self.total_items.load(Ordering::Acquire);
        out[8..12].copy_from_slice(&total.to_le_bytes());
        out
    }
}

/// Fixed set of capture buffers, indexed by [`BufferId`].
pub struct BufferRegistry {
    buffers: Vec<Arc<CaptureBuffer>>,
}

impl BufferRegistry {
    /// Allocate `config.num_buffers` buffers with ids `1..=num_buffers`.
    pub fn new(config: &EngineConfig) -> Self {
        // Lossless: validate() bounds num_buffers by the packed base field.
        let buffers = (1..=config.num_buffers as u32)
            .map(|n| Arc::new(CaptureBuffer::new(BufferId(n), config)))
            .collect();
        Self { buffers }
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if the registry holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Look up a buffer by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this registry.
    pub fn get(&self, id: BufferId) -> &Arc<CaptureBuffer> {
        &self.buffers[id.index()]
    }

    /// Iterate over all buffer ids.
    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers.iter().map(|b| b.id())
    }
}
