use std::cmp::Ordering;

use double_ended_peekable::{DoubleEndedPeekable, DoubleEndedPeekableExt};

/// Merges staged changes (`i1`, where `None` is a tombstone) over a base
/// iterator (`i2`). Both inputs must be sorted by key; on equal keys the
/// staged entry wins and tombstones hide the base entry.
pub struct MergeIter<I1, I2, K, V>
where
    K: Ord,
    I1: Iterator<Item = (K, Option<V>)>,
    I2: Iterator<Item = (K, V)>,
{
    i1: DoubleEndedPeekable<I1>,
    i2: DoubleEndedPeekable<I2>,
}

impl<I1, I2, K, V> MergeIter<I1, I2, K, V>
where
    K: Ord,
    I1: Iterator<Item = (K, Option<V>)>,
    I2: Iterator<Item = (K, V)>,
{
    pub fn new(i1: I1, i2: I2) -> Self {
        MergeIter {
            i1: i1.double_ended_peekable(),
            i2: i2.double_ended_peekable(),
        }
    }
}

impl<I1, I2, K, V> Iterator for MergeIter<I1, I2, K, V>
where
    K: Ord,
    I1: Iterator<Item = (K, Option<V>)>,
    I2: Iterator<Item = (K, V)>,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let staged = match (self.i1.peek(), self.i2.peek()) {
                (Some((k1, _)), Some((k2, _))) => match k1.cmp(k2) {
                    Ordering::Less => self.i1.next(),
                    Ordering::Equal => {
                        self.i2.next();
                        self.i1.next()
                    }
                    Ordering::Greater => return self.i2.next(),
                },
                (Some(_), None) => self.i1.next(),
                (None, Some(_)) => return self.i2.next(),
                (None, None) => return None,
            };
            // skip tombstones
            if let Some((k, Some(v))) = staged {
                return Some((k, v));
            }
        }
    }
}

impl<I1, I2, K, V> DoubleEndedIterator for MergeIter<I1, I2, K, V>
where
    K: Ord,
    I1: DoubleEndedIterator<Item = (K, Option<V>)>,
    I2: DoubleEndedIterator<Item = (K, V)>,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        loop {
            let staged = match (self.i1.peek_back(), self.i2.peek_back()) {
                (Some((k1, _)), Some((k2, _))) => match k1.cmp(k2) {
                    Ordering::Greater => self.i1.next_back(),
                    Ordering::Equal => {
                        self.i2.next_back();
                        self.i1.next_back()
                    }
                    Ordering::Less => return self.i2.next_back(),
                },
                (Some(_), None) => self.i1.next_back(),
                (None, Some(_)) => return self.i2.next_back(),
                (None, None) => return None,
            };
            if let Some((k, Some(v))) = staged {
                return Some((k, v));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_iter() {
        // tombstones at both ends, one shadowing a base key and one not
        let staged: [(&[u8], Option<&[u8]>); 5] = [
            (b"", None),
            (b"a", Some(&b"staged"[..])),
            (b"ab", None),
            (b"c", Some(&b"new"[..])),
            (b"\xff", None),
        ];
        let base: [(&[u8], &[u8]); 4] = [
            (b"", b"root"),
            (b"a", b"base"),
            (b"ab", b"base"),
            (b"b", b"base"),
        ];
        let expected: Vec<(&[u8], &[u8])> = vec![
            (b"a", b"staged"),
            (b"b", b"base"),
            (b"c", b"new"),
        ];

        let merged = MergeIter::new(staged.iter().copied(), base.iter().copied());
        assert_eq!(merged.collect::<Vec<_>>(), expected);

        let merged = MergeIter::new(staged.iter().copied(), base.iter().copied());
        assert_eq!(
            merged.rev().collect::<Vec<_>>(),
            expected.into_iter().rev().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_long_tombstone_run() {
        let i1 = (0..100_000).map(|i| (i, None::<i32>));
        let i2 = (0..100_000).map(|i| (i, i));

        assert_eq!(MergeIter::new(i1.clone(), i2.clone()).count(), 0);
        assert_eq!(MergeIter::new(i1, i2).rev().count(), 0);
    }
}
