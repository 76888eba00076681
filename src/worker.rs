//! Transfer workers: turn batches into credit-gated engine requests.
//!
//! A contiguous item run occupies a contiguous payload range (items are
//! numbered in allocation order and the allocator hands out ascending
//! offsets), so a batch becomes one payload span split into bursts, plus
//! one descriptor-table request. Every request claims a credit before it
//! is issued, which caps the engine's outstanding work globally.

use crate::backoff::Backoff;
use crate::buffer::BufferRegistry;
use crate::config::EngineConfig;
use crate::credit::CreditGate;
use crate::error::{Error, Result};
use crate::transfer::{
    TransferBatch, TransferEngine, TransferRegion, TransferRequest, TransferSignal, TransferTicket,
};
use std::sync::Arc;

/// Executes batches from the master, one at a time.
pub struct TransferWorker {
    registry: Arc<BufferRegistry>,
    batch_rx: kanal::Receiver<TransferBatch>,
    credit: Arc<CreditGate>,
    engine: Arc<dyn TransferEngine>,
    backoff: Backoff,
    max_burst_bytes: usize,
    block_size: usize,
}

impl TransferWorker {
    /// Wire a worker onto the batch queue and the shared credit gate.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<BufferRegistry>,
        batch_rx: kanal::Receiver<TransferBatch>,
        credit: Arc<CreditGate>,
        engine: Arc<dyn TransferEngine>,
    ) -> Self {
        Self {
            registry,
            batch_rx,
            credit,
            engine,
            backoff: Backoff::with_optional_limit(config.poll_interval, config.stall_retry_limit),
            max_burst_bytes: config.max_burst_bytes,
            block_size: config.block_size,
        }
    }

    /// Execute batches until the batch queue closes.
    pub fn run(&self) -> Result<()> {
        while let Ok(batch) = self.batch_rx.recv() {
            self.execute(batch)?;
        }
        tracing::debug!("batch queue closed, worker exiting");
        Ok(())
    }

    fn execute(&self, batch: TransferBatch) -> Result<()> {
        debug_assert!(batch.count > 0);
        let buffer = Arc::clone(self.registry.get(batch.buffer));
        let host = buffer.host().ok_or(Error::UnpairedBuffer {
            buffer: batch.buffer.0,
        })?;

        // The batch's payload span runs from the first item's start to the
        // last item's end.
        let first = buffer.descriptors().load(batch.first_item);
        let last = buffer.descriptors().load(batch.first_item + batch.count - 1);
        let start = first.offset_blocks as usize * self.block_size;
        let end = (last.offset_blocks as usize + last.blocks as usize) * self.block_size;
        debug_assert!(start < end);

        let signal = Arc::new(TransferSignal::new());
        let mut offset = start;
        while offset < end {
            let len = (end - offset).min(self.max_burst_bytes);
            self.credit.claim(&self.backoff);
            let ticket = TransferTicket::new(Arc::clone(&signal), Some(Arc::clone(&self.credit)));
            self.engine.transfer_async(
                TransferRequest {
                    buffer: Arc::clone(&buffer),
                    host: Arc::clone(&host),
                    region: TransferRegion::Payload {
                        byte_offset: offset,
                        len,
                    },
                },
                ticket,
            );
            crate::metrics::record_transfer_issued(len);
            offset += len;
        }

        let descriptors = TransferRegion::Descriptors {
            first_item: batch.first_item,
            count: batch.count,
        };
        self.credit.claim(&self.backoff);
        let ticket = TransferTicket::new(Arc::clone(&signal), Some(Arc::clone(&self.credit)));
        self.engine.transfer_async(
            TransferRequest {
                buffer: Arc::clone(&buffer),
                host,
                region: descriptors,
            },
            ticket,
        );
        crate::metrics::record_transfer_issued(descriptors.byte_len());

        self.backoff
            .wait_for("batch drain", || signal.is_drained().then_some(()))?;
        buffer.note_transfer_complete();
        tracing::debug!(
            buffer = %batch.buffer,
            first_item = batch.first_item,
            count = batch.count,
            "batch transferred"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferId;
    use crate::completion::ItemDescriptor;
    use crate::host::HostBuffer;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every region it is asked to move and completes immediately.
    struct RecordingEngine {
        regions: Mutex<Vec<TransferRegion>>,
    }

    impl RecordingEngine {
        fn new() -> Self {
            Self {
                regions: Mutex::new(Vec::new()),
            }
        }
    }

    impl TransferEngine for RecordingEngine {
        fn transfer_async(&self, request: TransferRequest, ticket: TransferTicket) {
            self.regions.lock().unwrap().push(request.region);
            request.copy_to_host();
            ticket.complete();
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            num_buffers: 1,
            buffer_blocks: 64,
            max_items: 32,
            reserved_items: 4,
            max_burst_bytes: 256,
            poll_interval: Duration::from_micros(20),
            stall_retry_limit: Some(500_000),
            ..EngineConfig::default()
        }
    }

    fn worker_rig(
        pair_host: bool,
    ) -> (
        Arc<BufferRegistry>,
        Arc<RecordingEngine>,
        TransferWorker,
        kanal::Sender<TransferBatch>,
    ) {
        let config = config();
        let registry = Arc::new(BufferRegistry::new(&config));
        if pair_host {
            let host = Arc::new(HostBuffer::new(config.layout()));
            registry.get(BufferId(1)).reset(1, host);
        }
        let engine = Arc::new(RecordingEngine::new());
        let (batch_tx, batch_rx) = kanal::bounded(4);
        let worker = TransferWorker::new(
            &config,
            Arc::clone(&registry),
            batch_rx,
            Arc::new(CreditGate::new(4)),
            Arc::clone(&engine) as Arc<dyn TransferEngine>,
        );
        (registry, engine, worker, batch_tx)
    }

    #[test]
    fn test_batch_splits_payload_into_bursts() {
        let (registry, engine, worker, batch_tx) = worker_rig(true);
        let buffer = registry.get(BufferId(1));
        // Ten one-block items starting at block 8: 640 payload bytes.
        for n in 0..10u32 {
            buffer.descriptors().record(
                4 + n,
                ItemDescriptor {
                    offset_blocks: (8 + n) as u16,
                    blocks: 1,
                    sequence: n,
                },
            );
            buffer.bitmap().set(4 + n);
        }

        batch_tx
            .send(TransferBatch {
                buffer: BufferId(1),
                first_item: 4,
                count: 10,
            })
            .unwrap();
        drop(batch_tx);
        worker.run().unwrap();

        let regions = engine.regions.lock().unwrap();
        let mut covered = 0;
        let mut expected_offset = 8 * 64;
        let mut saw_descriptors = false;
        for region in regions.iter() {
            match *region {
                TransferRegion::Payload { byte_offset, len } => {
                    assert_eq!(byte_offset, expected_offset);
                    assert!(len <= 256);
                    expected_offset += len;
                    covered += len;
                }
                TransferRegion::Descriptors { first_item, count } => {
                    assert_eq!((first_item, count), (4, 10));
                    saw_descriptors = true;
                }
                TransferRegion::Header => panic!("worker must not flush headers"),
            }
        }
        assert_eq!(covered, 640);
        assert!(saw_descriptors);
        assert_eq!(buffer.transfers_completed(), 1);
    }

    #[test]
    fn test_unpaired_buffer_is_an_error() {
        let (registry, _engine, worker, batch_tx) = worker_rig(false);
        registry.get(BufferId(1)).descriptors().record(
            4,
            ItemDescriptor {
                offset_blocks: 0,
                blocks: 1,
                sequence: 0,
            },
        );
        batch_tx
            .send(TransferBatch {
                buffer: BufferId(1),
                first_item: 4,
                count: 1,
            })
            .unwrap();
        match worker.run() {
            Err(Error::UnpairedBuffer { buffer: 1 }) => {}
            other => panic!("expected unpaired buffer, got {other:?}"),
        }
    }
}
