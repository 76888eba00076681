//! The recycler loop: marries freed buffers to fresh host images.
//!
//! A buffer becomes free once the master has fully drained it; a host image
//! arrives whenever the consumer submits one. The recycler blocks on both,
//! stamps the pair with the next buffer sequence number, and hands the
//! re-armed buffer to the allocation queue. Throughput therefore degrades
//! gracefully to whichever side is scarcer, with no spinning.

use crate::buffer::{BufferId, BufferRegistry};
use crate::host::HostBuffer;
use std::sync::Arc;

/// Re-arms drained buffers with submitted host images.
pub struct BufferRecycler {
    registry: Arc<BufferRegistry>,
    host_rx: kanal::Receiver<Arc<HostBuffer>>,
    free_rx: kanal::Receiver<BufferId>,
    alloc_tx: kanal::Sender<BufferId>,
    next_seq: u64,
}

impl BufferRecycler {
    /// Wire a recycler between the host, free, and allocation queues.
    pub fn new(
        registry: Arc<BufferRegistry>,
        host_rx: kanal::Receiver<Arc<HostBuffer>>,
        free_rx: kanal::Receiver<BufferId>,
        alloc_tx: kanal::Sender<BufferId>,
    ) -> Self {
        Self {
            registry,
            host_rx,
            free_rx,
            alloc_tx,
            next_seq: 1,
        }
    }

    /// Pair host images with free buffers until any queue closes.
    pub fn run(mut self) {
        loop {
            let Ok(host) = self.host_rx.recv() else {
                tracing::debug!("host queue closed, recycler exiting");
                return;
            };
            let Ok(id) = self.free_rx.recv() else {
                tracing::debug!("free queue closed, recycler exiting");
                return;
            };
            let seq = self.next_seq;
            self.next_seq += 1;
            self.registry.get(id).reset(seq, host);
            tracing::debug!(buffer = %id, seq, "buffer re-armed");
            crate::metrics::record_buffer_recycled();
            if self.alloc_tx.send(id).is_err() {
                tracing::debug!("allocation queue closed, recycler exiting");
                return;
            }
        }
    }
}
