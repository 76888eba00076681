//! The lock-free payload allocator.
//!
//! Every producer thread holds a clone of [`AtomicAllocator`] and races on
//! one shared [`AllocSlot`]. An allocation is a single saturating atomic add;
//! the pre-update view it returns decides one of three outcomes:
//!
//! * the claim fits: the caller owns that payload range and item slot;
//! * the claim is the first to cross a buffer bound: the caller becomes the
//!   overflow handler, finalizes the old buffer, and installs a fresh one;
//! * someone else already crossed: sleep and retry against the new buffer.
//!
//! Because the adds serialize, exactly one caller per buffer cycle observes
//! the crossing view, so finalize and rotation happen exactly once with no
//! election protocol.

use crate::backoff::Backoff;
use crate::buffer::{BufferId, BufferRegistry, CaptureBuffer};
use crate::completion::ItemDescriptor;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::slot::{AllocSlot, PackedDesc};
use std::sync::Arc;

/// A claimed payload range and item slot, not yet committed.
///
/// The holder has exclusive write access to its payload blocks; nothing
/// reads them until [`commit`](Reservation::commit) publishes the item.
pub struct Reservation {
    buffer: Arc<CaptureBuffer>,
    item: u32,
    offset_blocks: u32,
    blocks: u32,
}

impl Reservation {
    /// The buffer the range lives in.
    pub fn buffer(&self) -> &Arc<CaptureBuffer> {
        &self.buffer
    }

    /// The item slot this reservation will commit to.
    pub fn item(&self) -> u32 {
        self.item
    }

    /// Payload offset in blocks.
    pub fn offset_blocks(&self) -> u32 {
        self.offset_blocks
    }

    /// Reserved length in blocks.
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// Copy `payload` into the reserved range.
    ///
    /// # Panics
    ///
    /// Panics if `payload` exceeds the reserved length.
    pub fn write(&self, payload: &[u8]) {
        let block_size = self.buffer.block_size();
        assert!(
            payload.len() <= self.blocks as usize * block_size,
            "payload exceeds reservation"
        );
        // SAFETY: the allocator handed this range to exactly one reservation
        // and the item is not yet committed, so no other thread touches it.
        unsafe {
            self.buffer
                .payload()
                .write(self.offset_blocks as usize * block_size, payload)
        };
    }

    /// Publish the item: record its descriptor, then set its completion bit.
    ///
    /// The descriptor store happens before the bit set, so any scanner that
    /// observes the bit sees the finished descriptor and payload.
    pub fn commit(self, sequence: u32) {
        self.buffer.descriptors().record(
            self.item,
            ItemDescriptor {
                offset_blocks: self.offset_blocks as u16,
                blocks: self.blocks as u16,
                sequence,
            },
        );
        self.buffer.bitmap().set(self.item);
    }
}

/// Per-producer handle onto the shared allocation state.
#[derive(Clone)]
pub struct AtomicAllocator {
    slot: Arc<AllocSlot>,
    registry: Arc<BufferRegistry>,
    alloc_ready: kanal::Receiver<BufferId>,
    in_use: kanal::Sender<BufferId>,
    backoff: Backoff,
    block_size: usize,
    buffer_blocks: u32,
    effective_max_items: u32,
    reserved_items: u32,
}

impl AtomicAllocator {
    /// Wire an allocator onto the shared slot, registry, and buffer queues.
    pub fn new(
        config: &EngineConfig,
        slot: Arc<AllocSlot>,
        registry: Arc<BufferRegistry>,
        alloc_ready: kanal::Receiver<BufferId>,
        in_use: kanal::Sender<BufferId>,
    ) -> Self {
        Self {
            slot,
            registry,
            alloc_ready,
            in_use,
            backoff: Backoff::with_optional_limit(config.poll_interval, config.stall_retry_limit),
            block_size: config.block_size,
            buffer_blocks: config.buffer_blocks,
            effective_max_items: config.effective_max_items(),
            reserved_items: config.reserved_items,
        }
    }

    /// Reserve `blocks` payload blocks and an item slot.
    ///
    /// Blocks (with backoff) while a rotation is in progress or no re-armed
    /// buffer is available yet. A claim larger than one buffer can never be
    /// satisfied and would wedge the rotation loop, so it is rejected before
    /// touching the shared word.
    pub fn reserve(&self, blocks: u32) -> Result<Reservation> {
        if blocks == 0 {
            return Err(Error::EmptyPayload);
        }
        if blocks > self.buffer_blocks {
            return Err(Error::PayloadTooLarge {
                len: blocks as usize * self.block_size,
                capacity: self.buffer_blocks as usize * self.block_size,
            });
        }
        let mut attempts = 0u64;
        loop {
            let pre = self.slot.fetch_add_sat(blocks);

            if pre.is_unset() {
                // First-ever claimant installs the first buffer; everyone
                // else who raced the unset word waits for it to appear.
                if pre.offset == 0 {
                    return self.install_next(blocks);
                }
                self.backoff.snooze_checked("first buffer install", &mut attempts)?;
                continue;
            }

            let starts_ok = pre.offset <= self.buffer_blocks;
            let ends_ok = pre.offset + blocks <= self.buffer_blocks;
            let count_ok = pre.count < self.effective_max_items;
            let count_at_max = pre.count == self.effective_max_items;

            if ends_ok && count_ok {
                let buffer = Arc::clone(self.registry.get(BufferId(pre.base)));
                return Ok(Reservation {
                    buffer,
                    item: self.reserved_items + pre.count,
                    offset_blocks: pre.offset,
                    blocks,
                });
            }

            // The crossing view is unique: offsets and counts only grow, so
            // at most one caller sees a still-valid start with an out-of-
            // bounds end (or the exact count limit).
            if starts_ok && (count_ok || count_at_max) {
                let total_items = self.reserved_items + pre.count;
                let buffer = self.registry.get(BufferId(pre.base));
                buffer.finalize(total_items);
                tracing::debug!(
                    buffer = %buffer.id(),
                    total_items,
                    "buffer full, rotating"
                );
                return self.install_next(blocks);
            }

            self.backoff.snooze_checked("buffer rotation", &mut attempts)?;
        }
    }

    /// Take the next re-armed buffer, announce it as in use, publish it as
    /// the current buffer, and claim its first item.
    ///
    /// The in-use announcement happens before the publish so the drain side
    /// learns about the buffer before any producer can commit into it.
    fn install_next(&self, blocks: u32) -> Result<Reservation> {
        let id = self.alloc_ready.recv().map_err(|_| Error::Shutdown)?;
        self.in_use.send(id).map_err(|_| Error::Shutdown)?;
        let buffer = Arc::clone(self.registry.get(id));
        tracing::debug!(buffer = %id, seq = buffer.buffer_seq(), "installing buffer");

        // The publisher claims item 0 of the new buffer as part of the
        // publish, so the word goes live already accounting for it.
        self.slot.publish(PackedDesc {
            offset: blocks,
            count: 1,
            base: id.0,
        });
        Ok(Reservation {
            buffer,
            item: self.reserved_items,
            offset_blocks: 0,
            blocks,
        })
    }
}
