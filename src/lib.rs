//! # Capflow
//!
//! A lock-free, credit-gated capture pipeline: many producer threads commit
//! variable-size payloads into shared buffers, and a transfer stage streams
//! the filled buffers into host-provided memory images.
//!
//! ## How it works
//!
//! - **Lock-free allocation**: one saturating atomic add per claim carves a
//!   payload range and item slot out of the current buffer
//! - **Exactly-once rotation**: the first claim to cross a buffer bound
//!   finalizes it and installs the next buffer, with no election protocol
//! - **Ordered draining**: a master scans completion bits into contiguous
//!   batches; workers move them host-side under a global credit cap
//! - **Recycling**: drained buffers are re-armed with fresh host images and
//!   fed back to the allocator
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capflow::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> capflow::Result<()> {
//! let engine = CaptureEngine::start(EngineConfig::default(), Arc::new(CopyEngine::new()))?;
//! engine.submit_host_buffer(engine.new_host_buffer())?;
//!
//! let producer = engine.producer();
//! producer.capture(b"payload bytes")?;
//!
//! let completed = engine.completed();
//! // ... captures arrive as buffers fill and retire ...
//! drop(producer);
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod alloc;
pub mod backoff;
pub mod buffer;
pub mod completion;
pub mod config;
pub mod credit;
pub mod engine;
pub mod error;
pub mod host;
pub mod layout;
pub mod metrics;
pub mod segment;
pub mod slot;
pub mod transfer;

mod master;
mod recycle;
mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::BufferId;
    pub use crate::config::EngineConfig;
    pub use crate::engine::{CaptureEngine, Producer};
    pub use crate::error::{Error, Result};
    pub use crate::host::{CompletedCapture, HostBuffer};
    pub use crate::transfer::{CopyEngine, TransferEngine};
}

pub use error::{Error, Result};
