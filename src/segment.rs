//! Heap-backed raw memory regions.
//!
//! Payload areas are written concurrently by many threads at disjoint byte
//! ranges; range disjointness is guaranteed by the allocator, not by the
//! type system, so access goes through unsafe accessors with that contract
//! spelled out.

use std::cell::UnsafeCell;

/// A fixed-size, zero-initialized region of heap memory that permits
/// concurrent writes to disjoint ranges.
pub struct Region {
    cells: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all access goes through the unsafe range accessors below, whose
// contract requires callers to keep concurrently accessed ranges disjoint
// (or properly ordered via the completion bitmap).
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate a zeroed region of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        let cells = (0..len).map(|_| UnsafeCell::new(0u8)).collect();
        Self { cells }
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true if the region has zero size.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn base_ptr(&self) -> *mut u8 {
        self.cells.as_ptr() as *mut u8
    }

    /// Copy `bytes` into the region starting at `offset`.
    ///
    /// # Safety
    ///
    /// No other thread may concurrently read or write any byte of
    /// `[offset, offset + bytes.len())`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset.checked_add(bytes.len()).is_some_and(|end| end <= self.len()),
            "write of {} bytes at {} out of bounds for region of {}",
            bytes.len(),
            offset,
            self.len()
        );
        // SAFETY: bounds checked above; caller guarantees disjointness.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base_ptr().add(offset), bytes.len());
        }
    }

    /// View `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// No other thread may concurrently write any byte of the range, and all
    /// prior writes to it must be ordered before this read (e.g. via an
    /// acquire load of the completion bit published after the write).
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "slice of {} bytes at {} out of bounds for region of {}",
            len,
            offset,
            self.len()
        );
        // SAFETY: bounds checked above; caller guarantees no concurrent writers.
        unsafe { std::slice::from_raw_parts(self.base_ptr().add(offset), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_region_starts_zeroed() {
        let region = Region::zeroed(256);
        assert_eq!(region.len(), 256);
        let bytes = unsafe { region.slice(0, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_then_read() {
        let region = Region::zeroed(64);
        unsafe {
            region.write(8, b"hello");
            assert_eq!(region.slice(8, 5), b"hello");
            assert_eq!(region.slice(0, 8), &[0u8; 8]);
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_write_out_of_bounds_panics() {
        let region = Region::zeroed(16);
        unsafe { region.write(12, b"too long") };
    }

    #[test]
    fn test_disjoint_concurrent_writes() {
        let region = Arc::new(Region::zeroed(4096));
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let region = Arc::clone(&region);
                thread::spawn(move || {
                    let chunk = [i; 512];
                    unsafe { region.write(i as usize * 512, &chunk) };
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8u8 {
            let bytes = unsafe { region.slice(i as usize * 512, 512) };
            assert!(bytes.iter().all(|&b| b == i));
        }
    }
}
