//! The transfer seam: requests, completion tickets, and the engine trait.
//!
//! The master and workers never copy bytes themselves. They describe a
//! region to move and hand it to a [`TransferEngine`] together with a
//! [`TransferTicket`]; the engine moves the bytes whenever it likes and
//! punches the ticket when the data is durably in the host image. Credit
//! accounting and batch-drain detection both hang off ticket completion,
//! so a ticket must be punched exactly once. Dropping an unpunched ticket
//! completes it anyway, with an error log, so an engine bug degrades into
//! noise instead of a stall.

use crate::buffer::{BufferId, CaptureBuffer};
use crate::credit::CreditGate;
use crate::host::HostBuffer;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A contiguous run of completed items the master hands to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBatch {
    /// The buffer being drained.
    pub buffer: BufferId,
    /// First item slot of the run.
    pub first_item: u32,
    /// Items in the run (always nonzero).
    pub count: u32,
}

/// Which part of the buffer a transfer covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRegion {
    /// Payload bytes, addressed relative to the payload area.
    Payload {
        /// Start offset within the payload area, in bytes.
        byte_offset: usize,
        /// Bytes to move.
        len: usize,
    },
    /// A run of descriptor table entries.
    Descriptors {
        /// First item slot.
        first_item: u32,
        /// Entries to move.
        count: u32,
    },
    /// The retirement header.
    Header,
}

impl TransferRegion {
    /// Bytes the region covers in the host image.
    pub fn byte_len(&self) -> usize {
        match *self {
            TransferRegion::Payload { len, .. } => len,
            TransferRegion::Descriptors { count, .. } => count as usize * 8,
            TransferRegion::Header => 16,
        }
    }
}

/// One region move from a capture buffer into its paired host image.
pub struct TransferRequest {
    /// Source buffer.
    pub buffer: Arc<CaptureBuffer>,
    /// Destination image.
    pub host: Arc<HostBuffer>,
    /// Region to move.
    pub region: TransferRegion,
}

impl TransferRequest {
    /// Perform the move synchronously on the calling thread.
    ///
    /// Engines that model asynchronous hardware call this from wherever
    /// their completion context runs.
    pub fn copy_to_host(&self) {
        let layout = *self.host.layout();
        match self.region {
            TransferRegion::Payload { byte_offset, len } => {
                // SAFETY: the region covers only committed items, whose
                // producers finished writing before setting their completion
                // bits; nothing writes those payload bytes again this cycle,
                // and the host range is exclusively this transfer's.
                let src = unsafe { self.buffer.payload().slice(byte_offset, len) };
                unsafe { self.host.write(layout.payload_offset + byte_offset, src) };
            }
            TransferRegion::Descriptors { first_item, count } => {
                for item in first_item..first_item + count {
                    let raw = self.buffer.descriptors().load_raw(item);
                    // SAFETY: each descriptor slot is written by exactly one
                    // transfer per cycle.
                    unsafe {
                        self.host
                            .write(layout.descriptor_at(item), &raw.to_le_bytes())
                    };
                }
            }
            TransferRegion::Header => {
                // SAFETY: the header is written once, after every other
                // transfer of the cycle has completed.
                unsafe { self.host.write(0, &self.buffer.header_bytes()) };
            }
        }
    }
}

/// Counts the unfinished transfers of one batch (or one header flush).
pub struct TransferSignal {
    outstanding: AtomicU32,
}

impl TransferSignal {
    /// A signal with no outstanding transfers.
    pub fn new() -> Self {
        Self {
            outstanding: AtomicU32::new(0),
        }
    }

    /// True once every issued ticket has been punched.
    pub fn is_drained(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }

    fn arm(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn punch(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "transfer signal punched below zero");
    }
}

impl Default for TransferSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion token for one transfer request.
///
/// Punching the ticket releases the credit it carries (if any) and then
/// decrements the batch signal, in that order, so credit headroom reopens
/// no later than drain detection.
pub struct TransferTicket {
    signal: Arc<TransferSignal>,
    credit: Option<Arc<CreditGate>>,
    punched: bool,
}

impl TransferTicket {
    /// Issue a ticket against `signal`, optionally carrying a claimed credit.
    pub fn new(signal: Arc<TransferSignal>, credit: Option<Arc<CreditGate>>) -> Self {
        signal.arm();
        Self {
            signal,
            credit,
            punched: false,
        }
    }

    /// Mark the transfer complete.
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.punched {
            return;
        }
        self.punched = true;
        if let Some(credit) = self.credit.take() {
            credit.release();
        }
        self.signal.punch();
    }
}

impl Drop for TransferTicket {
    fn drop(&mut self) {
        if !self.punched {
            tracing::error!("transfer ticket dropped without completion");
            self.finish();
        }
    }
}

/// Moves transfer regions into host memory.
///
/// `transfer_async` must eventually punch the ticket; it may do so before
/// returning (synchronous engines) or from another thread.
pub trait TransferEngine: Send + Sync {
    /// Start moving `request` and punch `ticket` when the bytes are durable.
    fn transfer_async(&self, request: TransferRequest, ticket: TransferTicket);
}

/// Memcpy-backed engine.
///
/// With no delay it copies inline and completes before returning. With a
/// delay it hands the copy to a short-lived thread, which models transfer
/// hardware that completes out of band.
pub struct CopyEngine {
    delay: Option<Duration>,
}

impl CopyEngine {
    /// An inline, synchronous engine.
    pub fn new() -> Self {
        Self { delay: None }
    }

    /// An engine that sleeps `delay` before each copy completes.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

impl Default for CopyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine for CopyEngine {
    fn transfer_async(&self, request: TransferRequest, ticket: TransferTicket) {
        match self.delay {
            None => {
                request.copy_to_host();
                ticket.complete();
            }
            Some(delay) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    request.copy_to_host();
                    ticket.complete();
                });
            }
        }
    }
}
