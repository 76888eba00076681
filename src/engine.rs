//! Engine assembly: threads, queues, and the public producer/consumer API.
//!
//! [`CaptureEngine::start`] wires the whole machine together: the shared
//! allocation slot, the buffer registry, the recycler, the master, and the
//! worker pool, connected by bounded queues. Producers are cheap cloneable
//! handles; the consumer side is a pair of methods for submitting host
//! images and receiving completed captures.
//!
//! Queue closure is the lifetime signal throughout: each stage exits when
//! its upstream queue closes, so teardown is a cascade started by dropping
//! the engine-held endpoints. The shutdown flag additionally interrupts the
//! master's in-buffer waits, which block on state rather than on a queue.

use crate::alloc::AtomicAllocator;
use crate::buffer::{BufferId, BufferRegistry};
use crate::config::EngineConfig;
use crate::credit::CreditGate;
use crate::error::{Error, Result};
use crate::host::{CompletedCapture, HostBuffer};
use crate::master::TransferMaster;
use crate::recycle::BufferRecycler;
use crate::slot::AllocSlot;
use crate::transfer::{TransferBatch, TransferEngine};
use crate::worker::TransferWorker;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

/// A running capture engine.
///
/// Dropping the engine without calling [`shutdown`](Self::shutdown) detaches
/// the service threads; they exit on their own once every producer handle is
/// gone. `shutdown` is the orderly path: it interrupts waits and joins every
/// thread.
pub struct CaptureEngine {
    config: EngineConfig,
    allocator: AtomicAllocator,
    sequence: Arc<AtomicU32>,
    host_tx: kanal::Sender<Arc<HostBuffer>>,
    completed_rx: kanal::Receiver<CompletedCapture>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl CaptureEngine {
    /// Validate `config`, build the machine, and start its threads.
    pub fn start(config: EngineConfig, engine: Arc<dyn TransferEngine>) -> Result<Self> {
        config.validate()?;
        crate::metrics::init_metrics();

        let registry = Arc::new(BufferRegistry::new(&config));
        let slot = Arc::new(AllocSlot::new());
        let credit = Arc::new(CreditGate::new(config.max_in_flight));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (host_tx, host_rx) = kanal::bounded::<Arc<HostBuffer>>(config.queue_depth);
        let (free_tx, free_rx) = kanal::bounded::<BufferId>(config.num_buffers);
        let (alloc_tx, alloc_rx) = kanal::bounded::<BufferId>(config.num_buffers);
        let (in_use_tx, in_use_rx) = kanal::bounded::<BufferId>(config.num_buffers);
        let (batch_tx, batch_rx) = kanal::bounded::<TransferBatch>(config.queue_depth);
        let (completed_tx, completed_rx) = kanal::unbounded::<CompletedCapture>();

        // Every buffer starts free; the recycler arms each one as host
        // images arrive.
        for id in registry.ids() {
            free_tx
                .send(id)
                .map_err(|_| Error::Config("free queue closed during startup".into()))?;
        }

        let mut threads = Vec::with_capacity(config.num_workers + 2);

        let recycler = BufferRecycler::new(Arc::clone(&registry), host_rx, free_rx, alloc_tx);
        threads.push(spawn_named("capflow-recycler", move || recycler.run())?);

        let master = TransferMaster::new(
            &config,
            Arc::clone(&registry),
            in_use_rx,
            batch_tx,
            free_tx,
            completed_tx,
            Arc::clone(&engine),
            Arc::clone(&shutdown),
        );
        threads.push(spawn_named("capflow-master", move || {
            if let Err(error) = master.run() {
                tracing::error!(%error, "master exited with error");
            }
        })?);

        for n in 0..config.num_workers {
            let worker = TransferWorker::new(
                &config,
                Arc::clone(&registry),
                batch_rx.clone(),
                Arc::clone(&credit),
                Arc::clone(&engine),
            );
            threads.push(spawn_named(&format!("capflow-worker-{n}"), move || {
                if let Err(error) = worker.run() {
                    tracing::error!(%error, "worker exited with error");
                }
            })?);
        }

        let allocator = AtomicAllocator::new(&config, slot, registry, alloc_rx, in_use_tx);
        tracing::info!(
            num_buffers = config.num_buffers,
            num_workers = config.num_workers,
            max_in_flight = config.max_in_flight,
            "capture engine started"
        );

        Ok(Self {
            config,
            allocator,
            sequence: Arc::new(AtomicU32::new(0)),
            host_tx,
            completed_rx,
            shutdown,
            threads,
        })
    }

    /// The configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a producer handle. Handles are cheap and clonable; drop them
    /// all before calling [`shutdown`](Self::shutdown).
    pub fn producer(&self) -> Producer {
        Producer {
            allocator: self.allocator.clone(),
            sequence: Arc::clone(&self.sequence),
            block_size: self.config.block_size,
            capacity: self.config.buffer_bytes(),
        }
    }

    /// Allocate a host image sized for this engine's layout.
    pub fn new_host_buffer(&self) -> Arc<HostBuffer> {
        Arc::new(HostBuffer::new(self.config.layout()))
    }

    /// Hand a host image to the engine for the next buffer cycle.
    pub fn submit_host_buffer(&self, host: Arc<HostBuffer>) -> Result<()> {
        if *host.layout() != self.config.layout() {
            return Err(Error::Config(
                "host buffer layout does not match engine configuration".into(),
            ));
        }
        self.host_tx.send(host).map_err(|_| Error::Shutdown)
    }

    /// The stream of completed captures.
    pub fn completed(&self) -> kanal::Receiver<CompletedCapture> {
        self.completed_rx.clone()
    }

    /// Stop the engine and join its threads.
    ///
    /// In-flight buffers are abandoned, not flushed; consume the completed
    /// stream before calling this if partial results matter.
    pub fn shutdown(self) {
        let Self {
            allocator,
            host_tx,
            completed_rx,
            shutdown,
            threads,
            ..
        } = self;
        shutdown.store(true, Ordering::Release);
        // Closing the engine-held endpoints starts the teardown cascade.
        drop(allocator);
        drop(host_tx);
        drop(completed_rx);
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("engine thread panicked during shutdown");
            }
        }
        tracing::info!("capture engine stopped");
    }
}

fn spawn_named(name: &str, f: impl FnOnce() + Send + 'static) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| Error::Config(format!("failed to spawn {name}: {e}")))
}

/// Handle for committing payloads into the engine.
#[derive(Clone)]
pub struct Producer {
    allocator: AtomicAllocator,
    sequence: Arc<AtomicU32>,
    block_size: usize,
    capacity: usize,
}

impl Producer {
    /// Capture one payload: reserve space, copy it in, and publish it.
    ///
    /// Returns the capture's sequence number. Blocks (with backoff) while
    /// the engine has no armed buffer to allocate from.
    pub fn capture(&self, payload: &[u8]) -> Result<u32> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if payload.len() > self.capacity {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                capacity: self.capacity,
            });
        }
        let blocks = payload.len().div_ceil(self.block_size) as u32;
        let reservation = self.allocator.reserve(blocks)?;
        reservation.write(payload);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        reservation.commit(sequence);
        crate::metrics::record_capture_committed(payload.len());
        Ok(sequence)
    }
}
