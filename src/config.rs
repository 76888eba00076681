//! Engine configuration.

use crate::error::{Error, Result};
use crate::layout::BufferLayout;
use crate::slot;
use std::time::Duration;

/// Configuration for a [`CaptureEngine`](crate::engine::CaptureEngine).
///
/// The defaults mirror the hardware generation the engine was originally
/// sized for: 64-byte blocks, 256 KiB buffers (4096 blocks), 1024 item slots
/// per buffer with a 4-slot reserved margin, 16 concurrent transfers, and
/// 1 KiB transfer bursts. All of them are tunable; [`validate`] enforces the
/// packing and layout invariants at construction time.
///
/// [`validate`]: EngineConfig::validate
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Allocation granule in bytes. Payload offsets and sizes are tracked in
    /// blocks, not bytes.
    pub block_size: usize,
    /// Payload capacity of one buffer, in blocks.
    pub buffer_blocks: u32,
    /// Item slots per buffer (completion bitmap width).
    pub max_items: u32,
    /// Reserved slot margin; allocation overflows once
    /// `max_items - reserved_items` items exist.
    pub reserved_items: u32,
    /// Number of internal buffers circulating through the engine.
    pub num_buffers: usize,
    /// Number of transfer worker threads.
    pub num_workers: usize,
    /// Maximum concurrent outstanding transfers (credit pool size).
    pub max_in_flight: u32,
    /// Largest single transfer issued by a worker, in bytes.
    pub max_burst_bytes: usize,
    /// Sleep interval for every poll-with-backoff loop.
    pub poll_interval: Duration,
    /// Bitmap words examined per completion scan.
    pub scan_window_words: usize,
    /// Retry ceiling for poll loops; `None` polls forever (service mode),
    /// `Some(n)` turns the n-th fruitless retry into [`Error::Stalled`].
    pub stall_retry_limit: Option<u64>,
    /// Capacity of the host-buffer and transfer-batch queues.
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            buffer_blocks: 4096,
            max_items: 1024,
            reserved_items: 4,
            num_buffers: 8,
            num_workers: 4,
            max_in_flight: 16,
            max_burst_bytes: 1024,
            poll_interval: Duration::from_micros(50),
            scan_window_words: 2,
            stall_retry_limit: None,
            queue_depth: 64,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration against the packing and layout invariants.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::Config(
                "block_size must be a nonzero power of two".into(),
            ));
        }
        if self.buffer_blocks == 0 {
            return Err(Error::Config("buffer_blocks must be > 0".into()));
        }
        // Descriptor entries track offsets in 16 bits of blocks.
        if self.buffer_blocks > u16::MAX as u32 {
            return Err(Error::Config(format!(
                "buffer_blocks ({}) exceeds the 16-bit descriptor offset field",
                self.buffer_blocks
            )));
        }
        // A racing add can push the packed offset to at most twice the
        // buffer size before anyone reacts; that must stay clear of the
        // saturation value so a clamped word is always distinguishable.
        if self.buffer_blocks > slot::OFFSET_MAX / 2 {
            return Err(Error::Config(format!(
                "buffer_blocks ({}) too large for the 24-bit packed offset field",
                self.buffer_blocks
            )));
        }
        if self.max_items == 0 || self.reserved_items >= self.max_items {
            return Err(Error::Config(
                "reserved_items must be smaller than max_items, and max_items nonzero".into(),
            ));
        }
        // Strictly below the saturation value, so a clamped count can never
        // masquerade as the unique "count reached the limit" observation.
        if self.effective_max_items() >= slot::COUNT_MAX {
            return Err(Error::Config(format!(
                "max_items - reserved_items ({}) exceeds the 10-bit packed count field",
                self.effective_max_items()
            )));
        }
        if self.num_buffers == 0 || self.num_buffers as u32 > slot::BASE_MAX - 1 {
            return Err(Error::Config(format!(
                "num_buffers ({}) out of range for the packed base field",
                self.num_buffers
            )));
        }
        if self.num_workers == 0 {
            return Err(Error::Config("num_workers must be > 0".into()));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be > 0".into()));
        }
        if self.max_burst_bytes < self.block_size || self.max_burst_bytes % self.block_size != 0 {
            return Err(Error::Config(
                "max_burst_bytes must be a nonzero multiple of block_size".into(),
            ));
        }
        if self.scan_window_words == 0 {
            return Err(Error::Config("scan_window_words must be > 0".into()));
        }
        if self.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be > 0".into()));
        }
        Ok(())
    }

    /// Item count at which a buffer overflows (`max_items` minus the
    /// reserved margin).
    pub fn effective_max_items(&self) -> u32 {
        self.max_items - self.reserved_items
    }

    /// Usable payload bytes in one buffer.
    pub fn buffer_bytes(&self) -> usize {
        self.block_size * self.buffer_blocks as usize
    }

    /// The host-buffer image layout implied by this configuration.
    ///
    /// Sized for all `max_items` slots; the reserved margin occupies real
    /// descriptor table entries even though it never carries payload.
    pub fn layout(&self) -> BufferLayout {
        BufferLayout::new(self.block_size, self.buffer_blocks, self.max_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_block_size() {
        let config = EngineConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_power_of_two_block_size() {
        let config = EngineConfig {
            block_size: 48,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_buffer() {
        let config = EngineConfig {
            buffer_blocks: 1 << 17,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_reserved_margin_consuming_all_items() {
        let config = EngineConfig {
            max_items: 4,
            reserved_items: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_burst() {
        let config = EngineConfig {
            max_burst_bytes: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_max_items() {
        let config = EngineConfig::default();
        assert_eq!(config.effective_max_items(), 1020);
        assert_eq!(config.buffer_bytes(), 256 * 1024);
    }
}
