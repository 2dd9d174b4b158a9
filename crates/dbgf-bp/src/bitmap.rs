use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-size bitmap whose bits are claimed and released atomically.
///
/// Used as the allocation map of every chunked table.
pub(crate) struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            len,
        }
    }

    /// Returns the index of the first clear bit.
    pub fn first_clear(&self) -> Option<usize> {
        for (word_index, word) in self.words.iter().enumerate() {
            let value = word.load(Ordering::Relaxed);
            if value == u64::MAX {
                continue;
            }

            let index = word_index * 64 + (!value).trailing_zeros() as usize;
            return (index < self.len).then_some(index);
        }

        None
    }

    /// Sets bit `index` and returns `true` if it was clear before.
    pub fn try_set(&self, index: usize) -> bool {
        let mask = 1 << (index % 64);
        self.words[index / 64].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Claims the first clear bit.
    ///
    /// A failed test-and-set means another thread claimed the bit first, so
    /// the scan restarts. Every failure consumes a bit, which bounds the loop.
    pub fn claim(&self) -> Option<usize> {
        loop {
            let index = self.first_clear()?;
            if self.try_set(index) {
                return Some(index);
            }
        }
    }

    pub fn clear(&self, index: usize) {
        let mask = 1 << (index % 64);
        self.words[index / 64].fetch_and(!mask, Ordering::Release);
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }

        let mask = 1 << (index % 64);
        self.words[index / 64].load(Ordering::Acquire) & mask != 0
    }

    /// Iterates over the set bits.
    ///
    /// Each word is sampled once, so bits changing during the iteration may
    /// or may not be observed.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, word)| {
                let mut value = word.load(Ordering::Acquire);
                std::iter::from_fn(move || {
                    if value == 0 {
                        return None;
                    }

                    let bit = value.trailing_zeros() as usize;
                    value &= value - 1;
                    Some(word_index * 64 + bit)
                })
            })
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}
