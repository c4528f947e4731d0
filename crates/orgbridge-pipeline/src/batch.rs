//! Fixed-size batching of id sets and payloads.

/// Lazy iterator of chunks over another iterator.
///
/// Yields `Vec`s of at most `size` items, in input order, covering the input
/// exactly once. An empty input yields no chunks.
#[derive(Debug, Clone)]
pub struct ChunkedBatcher<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for ChunkedBatcher<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if chunk.is_empty() { None } else { Some(chunk) }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (low, high) = self.inner.size_hint();
        (low.div_ceil(self.size), high.map(|h| h.div_ceil(self.size)))
    }
}

/// Split `items` into chunks of at most `size`.
///
/// # Panics
///
/// Panics if `size` is zero. Configured sizes are validated on load.
pub fn chunked<I: IntoIterator>(items: I, size: usize) -> ChunkedBatcher<I::IntoIter> {
    assert!(size > 0, "chunk size must be positive");
    ChunkedBatcher {
        inner: items.into_iter(),
        size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exact_multiple() {
        let chunks: Vec<Vec<u32>> = chunked(1..=6, 3).collect();
        assert_eq!(chunks, vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn test_remainder_chunk() {
        let chunks: Vec<Vec<u32>> = chunked(1..=5, 2).collect();
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let mut chunks = chunked(Vec::<u32>::new(), 200);
        assert!(chunks.next().is_none());
    }

    #[test]
    fn test_size_hint() {
        let chunks = chunked(0..401, 200);
        assert_eq!(chunks.size_hint(), (3, Some(3)));
    }

    #[test]
    #[should_panic(expected = "chunk size must be positive")]
    fn test_zero_size_panics() {
        let _ = chunked(0..1, 0);
    }
}
