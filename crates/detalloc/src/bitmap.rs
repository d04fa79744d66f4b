//! Occupancy bitmap living in the allocator's buffer header.
//!
//! One bit per block; a set bit means the block is owned by the caller. The
//! bitmap is only consulted to detect double frees and by the validator.

use core::ptr::NonNull;

const WORD_BITS: u32 = u64::BITS;

#[derive(Debug)]
pub(crate) struct Bitmap {
    words: NonNull<u64>,
    bits: u32,
}

impl Bitmap {
    /// Creates a bitmap of `bits` clear bits over the words at `words`.
    ///
    /// # Safety
    ///
    /// `words` must be aligned for `u64`, valid for reads and writes of
    /// `bits.div_ceil(64)` words, and used by nothing else for as long as the
    /// bitmap exists.
    pub(crate) unsafe fn new(words: NonNull<u64>, bits: u32) -> Self {
        let this = Self { words, bits };
        unsafe {
            words.write_bytes(0, this.word_count());
        }
        this
    }

    fn word_count(&self) -> usize {
        self.bits.div_ceil(WORD_BITS) as usize
    }

    fn locate(&self, bit: u32) -> (NonNull<u64>, u64) {
        assert!(bit < self.bits, "bit {bit} out of range {}", self.bits);
        let word = unsafe { self.words.add((bit / WORD_BITS) as usize) };
        (word, 1 << (bit % WORD_BITS))
    }

    pub(crate) fn is_set(&self, bit: u32) -> bool {
        let (word, mask) = self.locate(bit);
        unsafe { word.read() & mask != 0 }
    }

    pub(crate) fn set(&mut self, bit: u32) {
        let (word, mask) = self.locate(bit);
        unsafe { word.write(word.read() | mask) }
    }

    pub(crate) fn clear(&mut self, bit: u32) {
        let (word, mask) = self.locate(bit);
        unsafe { word.write(word.read() & !mask) }
    }

    #[cfg(test)]
    pub(crate) fn words(&self) -> NonNull<u64> {
        self.words
    }

    /// Number of set bits, including any stray bits past `bits` in the last
    /// word.
    pub(crate) fn count_set(&self) -> u32 {
        (0..self.word_count())
            .map(|i| unsafe { self.words.add(i).read() }.count_ones())
            .sum()
    }
}
