use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Number of distinct IPv4 addresses, `0 ..= u32::MAX`.
pub(crate) const IPV4_ADDRESS_SPACE: u64 = 1 << 32;

const WORD_BITS: u64 = u32::BITS as u64;

// The zeroed allocation below reinterprets `u32` storage as `AtomicU32`.
const _: () = assert!(mem::align_of::<AtomicU32>() == mem::align_of::<u32>());
const _: () = assert!(mem::size_of::<AtomicU32>() == mem::size_of::<u32>());

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum BitmapError {
    #[error("bit {index} is outside the bitmap capacity of {capacity}")]
    OutOfRange { index: u32, capacity: u64 },
    #[error("bitmap capacity of {0} bits cannot be addressed on this platform")]
    TooLarge(u64),
}

/// Fixed-capacity bit-set that many threads can mark concurrently.
///
/// Bit `i` lives in word `i / 32` at position `i % 32`, least significant bit
/// first. Bits only ever go from 0 to 1.
///
/// Indexes at or above the capacity are rejected with
/// [`BitmapError::OutOfRange`]. The word count is rounded up, so a bitmap of
/// [`IPV4_ADDRESS_SPACE`] bits accepts every `u32`.
pub(crate) struct AtomicBitmap {
    words: Box<[AtomicU32]>,
    capacity: u64,
}

impl AtomicBitmap {
    pub(crate) fn new(capacity: u64) -> Result<Self, BitmapError> {
        let word_count = usize::try_from(capacity.div_ceil(WORD_BITS))
            .map_err(|_| BitmapError::TooLarge(capacity))?;

        Ok(Self {
            words: zeroed_words(word_count),
            capacity,
        })
    }

    /// A bitmap covering the whole IPv4 address space (512 MiB).
    pub(crate) fn ipv4() -> Result<Self, BitmapError> {
        Self::new(IPV4_ADDRESS_SPACE)
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Marks `index` as seen.
    ///
    /// Returns `Ok(true)` to exactly one caller per index: the one whose
    /// compare-and-swap flipped the bit. Every other caller, racing or late,
    /// gets `Ok(false)`.
    pub(crate) fn set(&self, index: u32) -> Result<bool, BitmapError> {
        let (word, mask) = self.locate(index)?;

        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & mask != 0 {
                return Ok(false);
            }
            // A failed exchange may only mean a neighbouring bit changed, so
            // retry against the fresh value instead of giving up.
            match word.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn is_set(&self, index: u32) -> Result<bool, BitmapError> {
        let (word, mask) = self.locate(index)?;
        Ok(word.load(Ordering::Acquire) & mask != 0)
    }

    /// Population count over all words.
    #[cfg(test)]
    pub(crate) fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }

    fn locate(&self, index: u32) -> Result<(&AtomicU32, u32), BitmapError> {
        if u64::from(index) >= self.capacity {
            return Err(BitmapError::OutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        let word = &self.words[(u64::from(index) / WORD_BITS) as usize];
        let mask = 1u32 << (u64::from(index) % WORD_BITS);
        Ok((word, mask))
    }
}

/// Allocates `len` zeroed words in one calloc-backed allocation, leaving
/// untouched pages uncommitted.
fn zeroed_words(len: usize) -> Box<[AtomicU32]> {
    let words = vec![0u32; len].into_boxed_slice();
    let raw = Box::into_raw(words) as *mut [AtomicU32];
    // SAFETY: `AtomicU32` has the same size, alignment (asserted above) and
    // bit validity as `u32`, and zero is a valid value for both.
    unsafe { Box::from_raw(raw) }
}
