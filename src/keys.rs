//! Prefix helpers for ordered key scans.

use std::ops::Bound;

use crate::types::KeyValues;

/// Smallest key greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists, i.e. the prefix is empty or made
/// only of `0xFF` bytes.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Range bounds covering exactly the keys that start with `prefix`.
pub fn prefix_range(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    if prefix.is_empty() {
        return (Bound::Unbounded, Bound::Unbounded);
    }
    let end = match prefix_successor(prefix) {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    (Bound::Included(prefix.to_vec()), end)
}

fn to_owned_pair((key, value): (&[u8], &[u8])) -> (Vec<u8>, Vec<u8>) {
    (key.to_vec(), value.to_vec())
}

// collect an ascending iterator into parallel key/value vectors in the requested direction.
pub(crate) fn unzip_ordered<'a, I>(iter: I, descending: bool) -> KeyValues
where
    I: DoubleEndedIterator<Item = (&'a [u8], &'a [u8])>,
{
    if descending {
        iter.rev().map(to_owned_pair).unzip()
    } else {
        iter.map(to_owned_pair).unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn test_prefix_range() {
        let mut tree = BTreeMap::new();
        let fixtures: [&[u8]; 6] = [b"a", b"ab", b"abc", b"b", &[0xff], &[0xff, 0x00]];
        for key in fixtures {
            tree.insert(key.to_vec(), ());
        }

        let keys = |prefix: &[u8]| {
            tree.range(prefix_range(prefix))
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(keys(b"ab"), vec![b"ab".to_vec(), b"abc".to_vec()]);
        assert_eq!(keys(&[0xff]), vec![vec![0xff], vec![0xff, 0x00]]);
        assert_eq!(keys(b"c"), Vec::<Vec<u8>>::new());
        assert_eq!(keys(b"").len(), 6);
    }

    #[test]
    fn test_unzip_ordered() {
        let pairs = [(&b"a"[..], &b"1"[..]), (&b"b"[..], &b"2"[..])];

        let (keys, values) = unzip_ordered(pairs.iter().copied(), true);
        assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(values, vec![b"2".to_vec(), b"1".to_vec()]);
    }
}
