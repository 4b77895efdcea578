//! Change tracking for incremental backups.
//!
//! Nothing is recorded until the first successful backup; from then on the
//! tracker holds the keys touched since the last successful backup.

use std::collections::BTreeSet;
use std::mem;

use crate::types::ChangeItem;

#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    has_base: bool,
    cleared: bool,
    dirty: BTreeSet<Vec<u8>>,
}

/// Changes handed to an in-flight backup.
#[derive(Debug)]
pub(crate) enum Delta {
    /// No usable base: the backup must be a full snapshot.
    Full,
    Changes {
        cleared: bool,
        keys: BTreeSet<Vec<u8>>,
    },
}

/// Tracker state taken by `begin`, given back by `abort` if the backup fails.
#[derive(Debug)]
pub(crate) struct Pending {
    cleared: bool,
    dirty: BTreeSet<Vec<u8>>,
}

impl ChangeTracker {
    pub fn record(&mut self, item: &ChangeItem) {
        if !self.has_base {
            return;
        }
        match item {
            ChangeItem::Set { key, .. } | ChangeItem::Delete { key } => {
                self.dirty.insert(key.clone());
            }
            ChangeItem::Clear => {
                self.cleared = true;
                self.dirty.clear();
            }
        }
    }

    /// Starts a backup. The recorded changes move into the returned delta;
    /// writes made afterwards count towards the next backup.
    pub fn begin(&mut self, incremental: bool) -> (Delta, Pending) {
        let cleared = mem::take(&mut self.cleared);
        let dirty = mem::take(&mut self.dirty);
        let delta = if incremental && self.has_base {
            Delta::Changes {
                cleared,
                keys: dirty.clone(),
            }
        } else {
            Delta::Full
        };
        (delta, Pending { cleared, dirty })
    }

    pub fn commit(&mut self) {
        self.has_base = true;
    }

    pub fn abort(&mut self, pending: Pending) {
        if pending.cleared && !self.cleared {
            // a clear recorded before the failed backup still has to reach the next one
            self.cleared = true;
        }
        self.dirty.extend(pending.dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(delta: Delta) -> (bool, Vec<Vec<u8>>) {
        match delta {
            Delta::Full => panic!("expected changes"),
            Delta::Changes { cleared, keys } => (cleared, keys.into_iter().collect()),
        }
    }

    #[test]
    fn test_no_base_means_full() {
        let mut tracker = ChangeTracker::default();
        tracker.record(&ChangeItem::set(b"a".to_vec(), b"1".to_vec()));

        let (delta, _) = tracker.begin(true);
        assert!(matches!(delta, Delta::Full));
        tracker.commit();

        tracker.record(&ChangeItem::set(b"b".to_vec(), b"2".to_vec()));
        tracker.record(&ChangeItem::delete(b"a".to_vec()));
        let (delta, _) = tracker.begin(true);
        assert_eq!(keys(delta), (false, vec![b"a".to_vec(), b"b".to_vec()]));
    }

    #[test]
    fn test_clear_resets_dirty() {
        let mut tracker = ChangeTracker::default();
        tracker.commit();
        tracker.record(&ChangeItem::set(b"a".to_vec(), b"1".to_vec()));
        tracker.record(&ChangeItem::Clear);
        tracker.record(&ChangeItem::set(b"b".to_vec(), b"2".to_vec()));

        let (delta, _) = tracker.begin(true);
        assert_eq!(keys(delta), (true, vec![b"b".to_vec()]));
    }

    #[test]
    fn test_abort_keeps_changes() {
        let mut tracker = ChangeTracker::default();
        tracker.commit();
        tracker.record(&ChangeItem::Clear);
        tracker.record(&ChangeItem::set(b"a".to_vec(), b"1".to_vec()));

        let (_, pending) = tracker.begin(true);
        tracker.abort(pending);

        let (delta, _) = tracker.begin(true);
        assert_eq!(keys(delta), (true, vec![b"a".to_vec()]));
    }
}
