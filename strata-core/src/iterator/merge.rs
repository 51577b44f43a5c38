//! K-way merge over iterators of one kind

use super::StorageIterator;
use crate::Result;
use std::cmp::Ordering;
use std::collections::binary_heap::{BinaryHeap, PeekMut};

/// A source and its registration index
///
/// Ordered so that the heap's maximum is the smallest `(key, index)`.
struct HeapWrapper<I: StorageIterator>(usize, Box<I>);

impl<I: StorageIterator> PartialEq for HeapWrapper<I> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<I: StorageIterator> Eq for HeapWrapper<I> {}

impl<I: StorageIterator> PartialOrd for HeapWrapper<I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<I: StorageIterator> Ord for HeapWrapper<I> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.1
            .key()
            .cmp(other.1.key())
            .then(self.0.cmp(&other.0))
            .reverse()
    }
}

/// Merges sorted sources into one sorted, duplicate-free stream
///
/// Sources must be passed newest first: when several sources hold the same
/// key, the one registered earliest is returned and the others are skipped.
pub struct MergeIterator<I: StorageIterator> {
    iters: BinaryHeap<HeapWrapper<I>>,
    current: Option<HeapWrapper<I>>,
}

impl<I: StorageIterator> MergeIterator<I> {
    pub fn create(iters: Vec<Box<I>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(iters.len());
        for (idx, iter) in iters.into_iter().enumerate() {
            if iter.is_valid() {
                heap.push(HeapWrapper(idx, iter));
            }
        }
        let current = heap.pop();
        Self {
            iters: heap,
            current,
        }
    }
}

impl<I: StorageIterator> StorageIterator for MergeIterator<I> {
    fn key(&self) -> &[u8] {
        self.current.as_ref().expect("invalid merge iterator").1.key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().expect("invalid merge iterator").1.value()
    }

    fn is_valid(&self) -> bool {
        self.current
            .as_ref()
            .map(|wrapper| wrapper.1.is_valid())
            .unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };

        // Older sources holding the same key are shadowed: step past it
        while let Some(mut inner) = self.iters.peek_mut() {
            if inner.1.key() != current.1.key() {
                break;
            }
            if let Err(e) = inner.1.next() {
                PeekMut::pop(inner);
                return Err(e);
            }
            if !inner.1.is_valid() {
                PeekMut::pop(inner);
            }
        }

        current.1.next()?;

        if !current.1.is_valid() {
            self.current = self.iters.pop();
            return Ok(());
        }

        if let Some(mut inner) = self.iters.peek_mut() {
            if *current < *inner {
                std::mem::swap(&mut *inner, current);
            }
        }
        Ok(())
    }

    fn num_active_iterators(&self) -> usize {
        self.iters
            .iter()
            .map(|wrapper| wrapper.1.num_active_iterators())
            .sum::<usize>()
            + self
                .current
                .as_ref()
                .map(|wrapper| wrapper.1.num_active_iterators())
                .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::tests::{collect, VecIterator};

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_newest_source_wins() {
        // newest immutable, older immutable, oldest table
        let mut iter = MergeIterator::create(vec![
            Box::new(VecIterator::new(&[("a", "3")])),
            Box::new(VecIterator::new(&[("b", "4")])),
            Box::new(VecIterator::new(&[("a", "1"), ("b", "2")])),
        ]);
        assert_eq!(collect(&mut iter), pairs(&[("a", "3"), ("b", "4")]));
    }

    #[test]
    fn test_interleaved_sources() {
        let mut iter = MergeIterator::create(vec![
            Box::new(VecIterator::new(&[("a", "1.0"), ("e", "1.1"), ("f", "")])),
            Box::new(VecIterator::new(&[("b", "2.0"), ("e", "2.1"), ("g", "2.2")])),
            Box::new(VecIterator::new(&[("c", "3.0"), ("d", "3.1"), ("f", "3.2")])),
        ]);
        assert_eq!(iter.num_active_iterators(), 3);
        assert_eq!(
            collect(&mut iter),
            pairs(&[
                ("a", "1.0"),
                ("b", "2.0"),
                ("c", "3.0"),
                ("d", "3.1"),
                ("e", "1.1"),
                ("f", ""),
                ("g", "2.2"),
            ])
        );
        assert_eq!(iter.num_active_iterators(), 0);
    }

    #[test]
    fn test_empty_sources() {
        let mut iter = MergeIterator::<VecIterator>::create(vec![]);
        assert!(!iter.is_valid());
        iter.next().unwrap();

        let mut iter = MergeIterator::create(vec![
            Box::new(VecIterator::new(&[])),
            Box::new(VecIterator::new(&[("x", "1")])),
        ]);
        assert_eq!(collect(&mut iter), pairs(&[("x", "1")]));
    }

    #[test]
    fn test_error_propagates() {
        let mut iter = MergeIterator::create(vec![
            Box::new(VecIterator::new(&[("a", "1"), ("b", "1")])),
            Box::new(VecIterator::new(&[("a", "2"), ("c", "2")]).failing_at(0)),
        ]);
        assert_eq!(iter.key(), b"a");
        assert!(iter.next().is_err());
    }
}
