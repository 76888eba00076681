//! The transfer master: turns completion bits into worker batches and
//! retires drained buffers.
//!
//! One master thread owns the drain side of every buffer, strictly in the
//! order buffers entered use. For the current buffer it scans the completion
//! bitmap for a contiguous run of ready items, emits the run as one batch,
//! and repeats until the finalized item count is fully covered. It then
//! waits for the workers to finish every batch, flushes the retirement
//! header, publishes the completed capture, and only then releases the
//! buffer for recycling. That ordering is the recycle-safety guarantee: a
//! buffer can never be re-armed while a transfer against it is in flight.

use crate::backoff::Backoff;
use crate::buffer::{BufferId, BufferRegistry, CaptureBuffer};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::host::CompletedCapture;
use crate::transfer::{
    TransferBatch, TransferEngine, TransferRegion, TransferRequest, TransferSignal, TransferTicket,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scans, batches, and retires in-use buffers.
pub struct TransferMaster {
    registry: Arc<BufferRegistry>,
    in_use_rx: kanal::Receiver<BufferId>,
    batch_tx: kanal::Sender<TransferBatch>,
    free_tx: kanal::Sender<BufferId>,
    completed_tx: kanal::Sender<CompletedCapture>,
    engine: Arc<dyn TransferEngine>,
    backoff: Backoff,
    scan_window_words: usize,
    reserved_items: u32,
    shutdown: Arc<AtomicBool>,
}

impl TransferMaster {
    /// Wire a master onto the drain-side queues.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EngineConfig,
        registry: Arc<BufferRegistry>,
        in_use_rx: kanal::Receiver<BufferId>,
        batch_tx: kanal::Sender<TransferBatch>,
        free_tx: kanal::Sender<BufferId>,
        completed_tx: kanal::Sender<CompletedCapture>,
        engine: Arc<dyn TransferEngine>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            in_use_rx,
            batch_tx,
            free_tx,
            completed_tx,
            engine,
            backoff: Backoff::with_optional_limit(config.poll_interval, config.stall_retry_limit),
            scan_window_words: config.scan_window_words,
            reserved_items: config.reserved_items,
            shutdown,
        }
    }

    /// Drain buffers in use order until the in-use queue closes or shutdown
    /// is requested.
    pub fn run(&self) -> Result<()> {
        while let Ok(id) = self.in_use_rx.recv() {
            self.drain(id)?;
        }
        tracing::debug!("in-use queue closed, master exiting");
        Ok(())
    }

    /// Poll `cond` with backoff, bailing out on shutdown.
    fn wait_until(&self, what: &'static str, mut cond: impl FnMut() -> bool) -> Result<()> {
        let mut attempts = 0u64;
        while !cond() {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            self.backoff.snooze_checked(what, &mut attempts)?;
        }
        Ok(())
    }

    fn drain(&self, id: BufferId) -> Result<()> {
        let buffer = Arc::clone(self.registry.get(id));
        tracing::debug!(buffer = %id, seq = buffer.buffer_seq(), "draining buffer");

        let mut next = self.reserved_items;
        let mut batches = 0u32;
        let mut attempts = 0u64;
        loop {
            let run = buffer.bitmap().ready_run(next, self.scan_window_words);
            if run > 0 {
                let batch = TransferBatch {
                    buffer: id,
                    first_item: next,
                    count: run,
                };
                self.batch_tx.send(batch).map_err(|_| Error::Shutdown)?;
                crate::metrics::record_batch_emitted(run);
                next += run;
                batches += 1;
                attempts = 0;
                continue;
            }
            if let Some(total) = buffer.final_items() {
                if next >= total {
                    debug_assert_eq!(next, total);
                    break;
                }
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            self.backoff.snooze_checked("item completion", &mut attempts)?;
        }

        // Every batch's transfers must land before the header goes out and
        // before the buffer can be re-armed.
        self.wait_until("batch transfers", || buffer.transfers_completed() >= batches)?;
        self.flush_header(&buffer)?;

        let total_items = buffer.final_items().unwrap_or(self.reserved_items);
        let buffer_seq = buffer.buffer_seq();
        let host = buffer.unpair().ok_or(Error::UnpairedBuffer { buffer: id.0 })?;
        // The consumer may have gone away; retiring proceeds regardless.
        let _ = self.completed_tx.send(CompletedCapture {
            host,
            buffer_seq,
            total_items,
            batches,
        });
        crate::metrics::record_buffer_retired();
        tracing::debug!(buffer = %id, seq = buffer_seq, total_items, batches, "buffer retired");

        self.free_tx.send(id).map_err(|_| Error::Shutdown)
    }

    fn flush_header(&self, buffer: &Arc<CaptureBuffer>) -> Result<()> {
        let host = buffer
            .host()
            .ok_or(Error::UnpairedBuffer { buffer: buffer.id().0 })?;
        let signal = Arc::new(TransferSignal::new());
        let ticket = TransferTicket::new(Arc::clone(&signal), None);
        self.engine.transfer_async(
            TransferRequest {
                buffer: Arc::clone(buffer),
                host,
                region: TransferRegion::Header,
            },
            ticket,
        );
        crate::metrics::record_transfer_issued(TransferRegion::Header.byte_len());
        self.wait_until("header flush", || signal.is_drained())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBuffer;
    use crate::transfer::CopyEngine;
    use std::thread;
    use std::time::Duration;

    struct Rig {
        config: EngineConfig,
        registry: Arc<BufferRegistry>,
        in_use_tx: kanal::Sender<BufferId>,
        batch_rx: kanal::Receiver<TransferBatch>,
        free_rx: kanal::Receiver<BufferId>,
        completed_rx: kanal::Receiver<CompletedCapture>,
        shutdown: Arc<AtomicBool>,
        handle: thread::JoinHandle<Result<()>>,
    }

    fn rig() -> Rig {
        let config = EngineConfig {
            num_buffers: 2,
            buffer_blocks: 64,
            max_items: 32,
            reserved_items: 4,
            poll_interval: Duration::from_micros(20),
            stall_retry_limit: Some(500_000),
            ..EngineConfig::default()
        };
        let registry = Arc::new(BufferRegistry::new(&config));
        for (seq, id) in registry.ids().enumerate() {
            let host = Arc::new(HostBuffer::new(config.layout()));
            registry.get(id).reset(seq as u64 + 1, host);
        }
        let (in_use_tx, in_use_rx) = kanal::bounded(4);
        let (batch_tx, batch_rx) = kanal::bounded(16);
        let (free_tx, free_rx) = kanal::bounded(4);
        let (completed_tx, completed_rx) = kanal::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let master = TransferMaster::new(
            &config,
            Arc::clone(&registry),
            in_use_rx,
            batch_tx,
            free_tx,
            completed_tx,
            Arc::new(CopyEngine::new()),
            Arc::clone(&shutdown),
        );
        let handle = thread::spawn(move || master.run());
        Rig {
            config,
            registry,
            in_use_tx,
            batch_rx,
            free_rx,
            completed_rx,
            shutdown,
            handle,
        }
    }

    fn commit_item(registry: &BufferRegistry, id: BufferId, item: u32) {
        let buffer = registry.get(id);
        buffer.descriptors().record(
            item,
            crate::completion::ItemDescriptor {
                offset_blocks: item as u16,
                blocks: 1,
                sequence: item,
            },
        );
        buffer.bitmap().set(item);
    }

    #[test]
    fn test_batches_cover_items_contiguously_in_order() {
        let rig = rig();
        let id = BufferId(1);
        let first = rig.config.reserved_items;

        rig.in_use_tx.send(id).unwrap();
        for item in first..first + 6 {
            commit_item(&rig.registry, id, item);
        }
        rig.registry.get(id).finalize(first + 6);

        let mut next = first;
        let mut batches = 0;
        while next < first + 6 {
            let batch = rig.batch_rx.recv().unwrap();
            assert_eq!(batch.buffer, id);
            assert_eq!(batch.first_item, next);
            assert!(batch.count > 0);
            next += batch.count;
            batches += 1;
            rig.registry.get(id).note_transfer_complete();
        }
        assert_eq!(next, first + 6);

        let completed = rig.completed_rx.recv().unwrap();
        assert_eq!(completed.total_items, first + 6);
        assert_eq!(completed.batches, batches);
        assert_eq!(completed.buffer_seq, 1);
        assert_eq!(rig.free_rx.recv().unwrap(), id);

        drop(rig.in_use_tx);
        rig.handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_buffer_not_freed_until_transfers_complete() {
        let rig = rig();
        let id = BufferId(1);
        let first = rig.config.reserved_items;

        rig.in_use_tx.send(id).unwrap();
        commit_item(&rig.registry, id, first);
        rig.registry.get(id).finalize(first + 1);

        let batch = rig.batch_rx.recv().unwrap();
        assert_eq!(batch.count, 1);

        // Transfers still outstanding: the free queue must stay empty.
        thread::sleep(Duration::from_millis(10));
        assert!(rig.free_rx.try_recv().unwrap().is_none());

        rig.registry.get(id).note_transfer_complete();
        assert_eq!(rig.free_rx.recv().unwrap(), id);

        drop(rig.in_use_tx);
        rig.handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_header_flushed_at_retirement() {
        let rig = rig();
        let id = BufferId(2);
        let first = rig.config.reserved_items;
        let host_probe = rig.registry.get(id).host().unwrap();

        rig.in_use_tx.send(id).unwrap();
        commit_item(&rig.registry, id, first);
        rig.registry.get(id).finalize(first + 1);

        let _ = rig.batch_rx.recv().unwrap();
        rig.registry.get(id).note_transfer_complete();
        let completed = rig.completed_rx.recv().unwrap();

        assert_eq!(host_probe.buffer_seq(), 2);
        assert_eq!(host_probe.total_items(), first + 1);
        assert!(Arc::ptr_eq(&completed.host, &host_probe));
        // Retirement dropped the pairing.
        assert!(rig.registry.get(id).host().is_none());

        drop(rig.in_use_tx);
        rig.handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_interrupts_waiting_master() {
        let rig = rig();
        rig.in_use_tx.send(BufferId(1)).unwrap();
        // No items ever complete; the master is stuck scanning.
        thread::sleep(Duration::from_millis(5));
        rig.shutdown.store(true, Ordering::Release);
        match rig.handle.join().unwrap() {
            Err(Error::Shutdown) => {}
            other => panic!("expected shutdown, got {other:?}"),
        }
    }
}
