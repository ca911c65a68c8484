//! Fixed-size batching of incoming records.

use std::mem;

/// Collects items into batches of at most `batch_size`.
///
/// A full batch is handed back from the same [`push`](Self::push) call that
/// filled it, so the accumulator never holds more than `batch_size` items.
/// The caller owns the returned batch and must finish with it before pushing
/// again; the feed loop enforces this by awaiting each flush.
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    buf: Vec<T>,
    batch_size: usize,
    emitted: u64,
}

impl<T> BatchAccumulator<T> {
    /// `batch_size` of zero is treated as one.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buf: Vec::with_capacity(batch_size),
            batch_size,
            emitted: 0,
        }
    }

    /// Append one item; returns the frozen batch when it reaches capacity.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.buf.push(item);
        if self.buf.len() >= self.batch_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Hand off the remainder. An empty remainder is a no-op.
    pub fn finalize(&mut self) -> Option<Vec<T>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> Vec<T> {
        self.emitted += 1;
        mem::replace(&mut self.buf, Vec::with_capacity(self.batch_size))
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches handed off so far.
    pub fn batches_emitted(&self) -> u64 {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flushes_full_batch_then_remainder() {
        let mut acc = BatchAccumulator::new(2);
        let mut flushed = Vec::new();

        for i in [1, 2, 3] {
            if let Some(batch) = acc.push(i) {
                flushed.push(batch);
            }
        }
        flushed.extend(acc.finalize());

        assert_eq!(flushed, vec![vec![1, 2], vec![3]]);
        assert_eq!(acc.batches_emitted(), 2);
        assert!(acc.is_empty());
    }

    #[test]
    fn exact_multiple_leaves_nothing_to_finalize() {
        let mut acc = BatchAccumulator::new(3);
        let flushed: Vec<_> = (0..3).filter_map(|i| acc.push(i)).collect();
        assert_eq!(flushed, vec![vec![0, 1, 2]]);
        assert_eq!(acc.finalize(), None);
        assert_eq!(acc.finalize(), None);
        assert_eq!(acc.batches_emitted(), 1);
    }

    #[test]
    fn zero_batch_size_degrades_to_one() {
        let mut acc = BatchAccumulator::new(0);
        assert_eq!(acc.batch_size(), 1);
        assert_eq!(acc.push('a'), Some(vec!['a']));
    }

    proptest! {
        #[test]
        fn never_buffers_more_than_batch_size(batch_size in 1usize..64, total in 0usize..2_000) {
            let mut acc = BatchAccumulator::new(batch_size);
            let mut seen = Vec::with_capacity(total);

            for i in 0..total {
                if let Some(batch) = acc.push(i) {
                    prop_assert_eq!(batch.len(), batch_size);
                    seen.extend(batch);
                }
                prop_assert!(acc.len() < batch_size);
            }
            if let Some(rest) = acc.finalize() {
                prop_assert!(!rest.is_empty() && rest.len() < batch_size);
                seen.extend(rest);
            }

            prop_assert_eq!(seen, (0..total).collect::<Vec<_>>());
            prop_assert_eq!(acc.batches_emitted() as usize, total.div_ceil(batch_size));
        }
    }
}
