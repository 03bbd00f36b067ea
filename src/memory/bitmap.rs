//! Block occupancy bitmap with first-fit contiguous run search.

const WORD_BITS: usize = u64::BITS as usize;

/// A bitmap tracking block occupancy for one pool.
///
/// Each bit represents one block: 0 = free, 1 = allocated. Bit `i` lives in
/// word `i / 64` at position `i % 64`, so scan order matches physical block
/// order. Bits past `num_blocks` in the last word are always clear.
///
/// The bitmap itself is not synchronized; [`BlockPool`](super::BlockPool)
/// keeps it behind a mutex.
///
/// # Performance
///
/// - `find_first_fit`: O(n/64) word visits plus one visit per set bit that
///   terminates a candidate run, where n is the number of blocks
/// - `set_run` / `clear_run`: O(run/64)
#[derive(Debug, Clone)]
pub struct BlockBitmap {
    words: Box<[u64]>,
    num_blocks: usize,
    free: usize,
}

impl BlockBitmap {
    /// Create a new bitmap with all blocks free.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            words: vec![0u64; num_blocks.div_ceil(WORD_BITS)].into_boxed_slice(),
            num_blocks,
            free: num_blocks,
        }
    }

    /// Find the first run of `run` contiguous free blocks.
    ///
    /// Returns the index of the first block of the run, or `None` when no
    /// such run exists. Nothing is modified.
    pub fn find_first_fit(&self, run: usize) -> Option<usize> {
        if run == 0 || run > self.num_blocks {
            return None;
        }

        let mut cursor = 0;
        loop {
            let start = self.next_clear(cursor)?;
            let end = start.checked_add(run)?;
            if end > self.num_blocks {
                return None;
            }

            match self.next_set(start, end) {
                None => return Some(start),
                // Every start position up to `set` would contain `set`.
                Some(set) => cursor = set + 1,
            }
        }
    }

    /// Mark `len` blocks starting at `start` as allocated.
    ///
    /// # Panics
    ///
    /// Panics if the run extends past the end of the bitmap.
    pub fn set_run(&mut self, start: usize, len: usize) {
        self.check_run(start, len);
        for (word_idx, mask) in run_masks(start, len) {
            debug_assert_eq!(self.words[word_idx] & mask, 0, "run overlaps allocated blocks");
            self.words[word_idx] |= mask;
        }
        self.free -= len;
    }

    /// Mark `len` blocks starting at `start` as free.
    ///
    /// Blocks that were already free are left free and their indices are
    /// returned, in ascending order. The rest of the run is cleared regardless.
    ///
    /// # Panics
    ///
    /// Panics if the run extends past the end of the bitmap.
    pub fn clear_run(&mut self, start: usize, len: usize) -> Vec<usize> {
        self.check_run(start, len);
        let mut already_free = Vec::new();
        for (word_idx, mask) in run_masks(start, len) {
            let word = self.words[word_idx];
            let mut stray = mask & !word;
            while stray != 0 {
                already_free.push(word_idx * WORD_BITS + stray.trailing_zeros() as usize);
                stray &= stray - 1;
            }
            self.words[word_idx] = word & !mask;
        }
        self.free += len - already_free.len();
        already_free
    }

    /// Check if a block is currently allocated.
    pub fn is_allocated(&self, block: usize) -> bool {
        if block >= self.num_blocks {
            return false;
        }
        self.words[block / WORD_BITS] & (1u64 << (block % WORD_BITS)) != 0
    }

    /// Count the number of free blocks.
    pub fn count_free(&self) -> usize {
        self.free
    }

    /// Get the total number of blocks.
    pub fn capacity(&self) -> usize {
        self.num_blocks
    }

    /// Index of the first clear bit at or after `from`, skipping full words.
    fn next_clear(&self, from: usize) -> Option<usize> {
        if from >= self.num_blocks {
            return None;
        }
        let mut word_idx = from / WORD_BITS;
        let mut free = !self.words[word_idx] & (u64::MAX << (from % WORD_BITS));
        loop {
            if free != 0 {
                let block = word_idx * WORD_BITS + free.trailing_zeros() as usize;
                return (block < self.num_blocks).then_some(block);
            }
            word_idx += 1;
            if word_idx == self.words.len() {
                return None;
            }
            free = !self.words[word_idx];
        }
    }

    /// Index of the first set bit in `[from, to)`.
    fn next_set(&self, from: usize, to: usize) -> Option<usize> {
        run_masks(from, to - from).find_map(|(word_idx, mask)| {
            let hits = self.words[word_idx] & mask;
            (hits != 0).then(|| word_idx * WORD_BITS + hits.trailing_zeros() as usize)
        })
    }

    fn check_run(&self, start: usize, len: usize) {
        assert!(
            start
                .checked_add(len)
                .is_some_and(|end| end <= self.num_blocks),
            "block run out of bounds"
        );
    }
}

/// Split the bit range `[start, start + len)` into per-word masks.
fn run_masks(start: usize, len: usize) -> impl Iterator<Item = (usize, u64)> {
    let end = start + len;
    let mut pos = start;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let word_idx = pos / WORD_BITS;
        let lo = pos % WORD_BITS;
        let hi = (end - word_idx * WORD_BITS).min(WORD_BITS);
        let width = hi - lo;
        let mask = if width == WORD_BITS {
            u64::MAX
        } else {
            ((1u64 << width) - 1) << lo
        };
        pos = (word_idx + 1) * WORD_BITS;
        Some((word_idx, mask))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_with(pattern: &[bool]) -> BlockBitmap {
        let mut bitmap = BlockBitmap::new(pattern.len());
        for (i, used) in pattern.iter().enumerate() {
            if *used {
                bitmap.set_run(i, 1);
            }
        }
        bitmap
    }

    #[test]
    fn test_bitmap_basic() {
        let mut bitmap = BlockBitmap::new(10);
        assert_eq!(bitmap.capacity(), 10);
        assert_eq!(bitmap.count_free(), 10);

        assert_eq!(bitmap.find_first_fit(3), Some(0));
        bitmap.set_run(0, 3);
        assert_eq!(bitmap.count_free(), 7);
        assert!(bitmap.is_allocated(2));
        assert!(!bitmap.is_allocated(3));

        assert_eq!(bitmap.find_first_fit(2), Some(3));
    }

    #[test]
    fn test_first_fit_prefers_lowest_run() {
        // [free, free, used, free, free]
        let bitmap = bitmap_with(&[false, false, true, false, false]);
        assert_eq!(bitmap.find_first_fit(2), Some(0));
    }

    #[test]
    fn test_first_fit_skips_past_blocking_bit() {
        let bitmap = bitmap_with(&[false, true, false, false, true, false, false, false]);
        assert_eq!(bitmap.find_first_fit(2), Some(2));
        assert_eq!(bitmap.find_first_fit(3), Some(5));
        assert_eq!(bitmap.find_first_fit(4), None);
    }

    #[test]
    fn test_run_across_word_boundary() {
        let mut bitmap = BlockBitmap::new(200);
        bitmap.set_run(0, 60);
        // 60..64 is too short for 10, but the run may continue into word 1.
        assert_eq!(bitmap.find_first_fit(10), Some(60));
        bitmap.set_run(60, 10);
        assert!(bitmap.is_allocated(63));
        assert!(bitmap.is_allocated(64));
        assert!(bitmap.is_allocated(69));
        assert!(!bitmap.is_allocated(70));
    }

    #[test]
    fn test_full_words_are_skipped() {
        let mut bitmap = BlockBitmap::new(256);
        bitmap.set_run(0, 192);
        assert_eq!(bitmap.find_first_fit(1), Some(192));
        assert_eq!(bitmap.find_first_fit(64), Some(192));
        assert_eq!(bitmap.find_first_fit(65), None);
    }

    #[test]
    fn test_run_longer_than_word() {
        let mut bitmap = BlockBitmap::new(300);
        bitmap.set_run(5, 1);
        assert_eq!(bitmap.find_first_fit(150), Some(6));
        bitmap.set_run(6, 150);
        assert_eq!(bitmap.count_free(), 300 - 151);
    }

    #[test]
    fn test_no_fit_at_tail() {
        // Free tail shorter than the request.
        let mut bitmap = BlockBitmap::new(100);
        bitmap.set_run(0, 97);
        assert_eq!(bitmap.find_first_fit(3), Some(97));
        assert_eq!(bitmap.find_first_fit(4), None);
    }

    #[test]
    fn test_zero_and_oversized_runs() {
        let bitmap = BlockBitmap::new(8);
        assert_eq!(bitmap.find_first_fit(0), None);
        assert_eq!(bitmap.find_first_fit(9), None);
        assert_eq!(bitmap.find_first_fit(8), Some(0));
    }

    #[test]
    fn test_clear_run_reports_already_free() {
        let mut bitmap = BlockBitmap::new(130);
        bitmap.set_run(60, 10);
        bitmap.set_run(128, 2);

        // 58, 59 and 70 were never allocated.
        let stray = bitmap.clear_run(58, 13);
        assert_eq!(stray, vec![58, 59, 70]);
        assert_eq!(bitmap.count_free(), 128);
        assert!(bitmap.is_allocated(128));
        assert!(bitmap.is_allocated(129));
    }

    #[test]
    fn test_clear_run_leaves_neighbours() {
        let mut bitmap = BlockBitmap::new(16);
        bitmap.set_run(0, 16);
        assert!(bitmap.clear_run(4, 4).is_empty());
        assert_eq!(bitmap.clear_run(4, 4), vec![4, 5, 6, 7]);
        assert!(bitmap.is_allocated(3));
        assert!(bitmap.is_allocated(8));
        assert_eq!(bitmap.count_free(), 4);
    }

    #[test]
    fn test_non_aligned_size() {
        let mut bitmap = BlockBitmap::new(100);
        for i in 0..100 {
            let block = bitmap.find_first_fit(1);
            assert_eq!(block, Some(i), "failed at block {}", i);
            bitmap.set_run(i, 1);
        }
        assert_eq!(bitmap.find_first_fit(1), None);
        assert_eq!(bitmap.count_free(), 0);
        assert!(!bitmap.is_allocated(100));
    }

    #[test]
    #[should_panic(expected = "block run out of bounds")]
    fn test_set_run_out_of_bounds() {
        let mut bitmap = BlockBitmap::new(10);
        bitmap.set_run(8, 3);
    }

    #[test]
    fn test_run_masks_split() {
        let masks: Vec<_> = run_masks(62, 68).collect();
        assert_eq!(masks, vec![(0, 0b11 << 62), (1, u64::MAX), (2, 0b11)]);
    }
}
