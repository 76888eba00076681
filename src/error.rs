//! Error types for capflow.

use thiserror::Error;

/// Result type alias using capflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for capflow operations.
///
/// Routine contention (allocator races, credit exhaustion, a buffer filling
/// up) is never an error; it is resolved by retry inside the engine. Only
/// invariant violations and teardown conditions surface here.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A poll loop exceeded its configured retry ceiling.
    ///
    /// This means a collaborator stopped making progress (a buffer was never
    /// initialized, a transfer never completed). There is no recovery path;
    /// continuing would risk silent data corruption.
    #[error("stalled while {what} (gave up after {retries} retries)")]
    Stalled {
        /// What the loop was waiting for.
        what: &'static str,
        /// Number of retries performed before giving up.
        retries: u64,
    },

    /// A work queue closed because the engine is shutting down.
    #[error("engine is shut down")]
    Shutdown,

    /// A buffer reached the transfer stage without a paired host buffer.
    #[error("buffer {buffer} has no paired host buffer")]
    UnpairedBuffer {
        /// Internal buffer id.
        buffer: u32,
    },

    /// Captures must carry at least one byte of payload.
    #[error("payload is empty")]
    EmptyPayload,

    /// Payload cannot fit in a buffer of the configured size.
    #[error("payload of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
        /// Usable bytes in one buffer.
        capacity: usize,
    },
}
