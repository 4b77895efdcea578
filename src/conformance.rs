//! Conformance suite shared by every [`KVStore`] backend.
//!
//! Each check takes a freshly constructed, empty store and panics on the
//! first violated property, so it can be called straight from a `#[test]`.
//!
//! ```
//! use smt_kvstore::{conformance, MemStore};
//!
//! conformance::run_all(MemStore::new);
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::error::{KVStoreError, Result};
use crate::types::{ChangeItem, KVStore, KeyValues};

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

/// Runs every check, building a new store with `new_store` for each.
pub fn run_all<S, F>(mut new_store: F)
where
    S: KVStore,
    F: FnMut() -> S,
{
    missing_key_is_not_found(&mut new_store());
    set_then_get(&mut new_store());
    overwrite_replaces(&mut new_store());
    delete_is_idempotent(&mut new_store());
    len_tracks_churn(&mut new_store());
    get_all_ordering(&mut new_store());
    prefix_scenario(&mut new_store());
    clear_all_empties(&mut new_store());
    write_batch_in_order(&mut new_store());
    backup_round_trip(&mut new_store(), &mut new_store());
    incremental_backup_chain(&mut new_store(), &mut new_store());
    corrupt_restore_preserves_state(&mut new_store());
    version_mismatch_detected(&mut new_store());
    stop_is_terminal(&mut new_store());
}

fn ok<T, E: Debug>(result: std::result::Result<T, E>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{} failed: {:?}", what, e),
    }
}

fn dump<S: KVStore + ?Sized>(store: &S) -> KeyValues {
    ok(store.get_all(b"", false), "get_all")
}

fn model_pairs<'a>(model: impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>) -> KeyValues {
    model.map(|(k, v)| (k.clone(), v.clone())).unzip()
}

fn assert_not_found<T: Debug>(result: Result<T>, key: &[u8]) {
    match result {
        Err(KVStoreError::NotFound) => {}
        other => panic!("get({:?}) should be NotFound, got {:?}", key, other),
    }
}

pub fn missing_key_is_not_found<S: KVStore + ?Sized>(store: &mut S) {
    assert_not_found(store.get(b"missing"), b"missing");
    assert_not_found(store.get(b""), b"");
    assert!(!ok(store.exists(b"missing"), "exists"));
    assert_eq!(store.len(), 0);
    assert!(store.is_empty());
}

pub fn set_then_get<S: KVStore + ?Sized>(store: &mut S) {
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (b"key".to_vec(), b"value".to_vec()),
        (Vec::new(), b"empty key".to_vec()),
        (b"empty value".to_vec(), Vec::new()),
        (vec![0x00], vec![0x00, 0xff]),
        (vec![0xff, 0xff], (0..=255).collect()),
        (b"large".to_vec(), vec![0xab; 4096]),
    ];
    for (key, value) in &pairs {
        ok(store.set(key.clone(), value.clone()), "set");
    }
    for (key, value) in &pairs {
        assert_eq!(&ok(store.get(key), "get"), value, "value of {:?}", key);
        assert!(ok(store.exists(key), "exists"), "{:?} should exist", key);
    }
    assert_eq!(store.len(), pairs.len());
}

pub fn overwrite_replaces<S: KVStore + ?Sized>(store: &mut S) {
    ok(store.set(b"k".to_vec(), b"first".to_vec()), "set");
    ok(store.set(b"k".to_vec(), b"second".to_vec()), "set");
    assert_eq!(ok(store.get(b"k"), "get"), b"second");
    ok(store.set(b"k".to_vec(), Vec::new()), "set");
    assert_eq!(ok(store.get(b"k"), "get"), b"");
    assert_eq!(store.len(), 1);
}

pub fn delete_is_idempotent<S: KVStore + ?Sized>(store: &mut S) {
    ok(store.set(b"a".to_vec(), b"1".to_vec()), "set");
    ok(store.set(b"b".to_vec(), b"2".to_vec()), "set");

    ok(store.delete(b"a"), "delete");
    let after_first = dump(store);
    ok(store.delete(b"a"), "second delete");
    assert_eq!(dump(store), after_first);

    assert_not_found(store.get(b"a"), b"a");
    assert!(!ok(store.exists(b"a"), "exists"));
    ok(store.delete(b"never set"), "delete of absent key");
    assert_eq!(store.len(), 1);
}

pub fn len_tracks_churn<S: KVStore + ?Sized>(store: &mut S) {
    let mut model = Model::new();
    // fixed LCG so every backend sees the same sequence
    let mut state: u32 = 0x2545_f491;
    for step in 0..400u32 {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let key = vec![b'k', (state >> 24) as u8 % 24];
        if (state >> 8) % 3 == 0 {
            ok(store.delete(&key), "delete");
            model.remove(&key);
        } else {
            let value = step.to_be_bytes().to_vec();
            ok(store.set(key.clone(), value.clone()), "set");
            model.insert(key, value);
        }

        if step % 50 == 0 {
            let present = (0..24u8)
                .filter(|i| ok(store.exists(&[b'k', *i]), "exists"))
                .count();
            assert_eq!(store.len(), present);
        }
        assert_eq!(store.len(), model.len(), "len after step {}", step);
    }
    assert_eq!(dump(store), model_pairs(model.iter()));
}

pub fn get_all_ordering<S: KVStore + ?Sized>(store: &mut S) {
    let keys: [&[u8]; 10] = [
        b"",
        b"a",
        b"a\x00",
        b"ab",
        b"abc",
        b"b",
        b"\x7f",
        b"\xff",
        b"\xff\xff",
        b"\xff\xff\x01",
    ];
    let mut model = Model::new();
    // insert out of order
    for (i, key) in keys.iter().enumerate().rev() {
        let value = vec![i as u8; i];
        ok(store.set(key.to_vec(), value.clone()), "set");
        model.insert(key.to_vec(), value);
    }

    let prefixes: [&[u8]; 7] = [b"", b"a", b"ab", b"\xff", b"\xff\xff", b"c", b"abcd"];
    for prefix in prefixes {
        let expected = model_pairs(model.iter().filter(|(k, _)| k.starts_with(prefix)));

        let (keys, values) = ok(store.get_all(prefix, false), "get_all");
        assert_eq!(keys.len(), values.len());
        assert!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "keys for prefix {:?} not strictly ascending",
            prefix
        );
        assert_eq!((keys.clone(), values.clone()), expected, "prefix {:?}", prefix);

        let (rev_keys, rev_values) = ok(store.get_all(prefix, true), "get_all descending");
        assert_eq!(rev_keys, keys.iter().rev().cloned().collect::<Vec<_>>());
        assert_eq!(rev_values, values.iter().rev().cloned().collect::<Vec<_>>());
    }
}

/// The `a` / `ab` / `b` walkthrough.
pub fn prefix_scenario<S: KVStore + ?Sized>(store: &mut S) {
    ok(store.set(b"a".to_vec(), b"".to_vec()), "set");
    ok(store.set(b"ab".to_vec(), b"1".to_vec()), "set");
    ok(store.set(b"b".to_vec(), b"2".to_vec()), "set");

    assert_eq!(
        ok(store.get_all(b"a", false), "get_all"),
        (vec![b"a".to_vec(), b"ab".to_vec()], vec![b"".to_vec(), b"1".to_vec()])
    );
    assert_eq!(store.len(), 3);

    ok(store.delete(b"ab"), "delete");
    assert_eq!(store.len(), 2);
    assert_eq!(
        ok(store.get_all(b"a", false), "get_all"),
        (vec![b"a".to_vec()], vec![b"".to_vec()])
    );
}

pub fn clear_all_empties<S: KVStore + ?Sized>(store: &mut S) {
    for i in 0u8..32 {
        ok(store.set(vec![i], vec![i]), "set");
    }
    ok(store.clear_all(), "clear_all");
    assert_eq!(store.len(), 0);
    assert_eq!(dump(store), (Vec::new(), Vec::new()));
    assert_not_found(store.get(&[1]), &[1]);

    // still usable afterwards
    ok(store.set(b"after".to_vec(), b"1".to_vec()), "set");
    assert_eq!(store.len(), 1);
    ok(store.clear_all(), "clear_all");
    ok(store.clear_all(), "clear_all of empty store");
    assert!(store.is_empty());
}

pub fn write_batch_in_order<S: KVStore + ?Sized>(store: &mut S) {
    ok(store.set(b"old".to_vec(), b"1".to_vec()), "set");
    ok(
        store.write_batch(vec![
            ChangeItem::set(b"a".to_vec(), b"1".to_vec()),
            ChangeItem::set(b"a".to_vec(), b"2".to_vec()),
            ChangeItem::delete(b"old".to_vec()),
            ChangeItem::set(b"b".to_vec(), b"1".to_vec()),
            ChangeItem::delete(b"b".to_vec()),
        ]),
        "write_batch",
    );
    assert_eq!(dump(store), (vec![b"a".to_vec()], vec![b"2".to_vec()]));

    ok(
        store.write_batch(vec![
            ChangeItem::Clear,
            ChangeItem::set(b"c".to_vec(), b"3".to_vec()),
        ]),
        "write_batch",
    );
    assert_eq!(dump(store), (vec![b"c".to_vec()], vec![b"3".to_vec()]));
    ok(store.write_batch(Vec::new()), "empty write_batch");
    assert_eq!(store.len(), 1);
}

fn fill_scenario<S: KVStore + ?Sized>(store: &mut S) {
    ok(store.set(b"a".to_vec(), b"".to_vec()), "set");
    ok(store.set(b"ab".to_vec(), b"1".to_vec()), "set");
    ok(store.set(b"b".to_vec(), b"2".to_vec()), "set");
}

fn backup_bytes<S: KVStore + ?Sized>(store: &S, incremental: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    store.backup(&mut out, incremental)?;
    Ok(out)
}

pub fn backup_round_trip<S, T>(source: &mut S, target: &mut T)
where
    S: KVStore + ?Sized,
    T: KVStore + ?Sized,
{
    fill_scenario(source);
    ok(source.set(vec![0xff; 3], vec![0x00; 3]), "set");
    ok(source.set(Vec::new(), b"root".to_vec()), "set");

    let stream = ok(backup_bytes(source, false), "backup");
    // the source stays usable and unchanged
    assert_eq!(source.len(), 5);

    ok(target.set(b"stale".to_vec(), b"x".to_vec()), "set");
    ok(target.restore(&mut stream.as_slice()), "restore");
    assert_eq!(dump(target), dump(source));
    assert_eq!(target.len(), source.len());
    assert!(!ok(target.exists(b"stale"), "exists"));
}

pub fn incremental_backup_chain<S, T>(source: &mut S, target: &mut T)
where
    S: KVStore + ?Sized,
    T: KVStore + ?Sized,
{
    fill_scenario(source);
    let full = ok(backup_bytes(source, false), "full backup");

    ok(source.set(b"c".to_vec(), b"3".to_vec()), "set");
    ok(source.delete(b"a"), "delete");
    ok(source.set(b"b".to_vec(), b"22".to_vec()), "set");
    let first = match backup_bytes(source, true) {
        Ok(stream) => stream,
        Err(KVStoreError::UnsupportedOperation(_)) => return,
        Err(e) => panic!("incremental backup failed: {:?}", e),
    };
    let state_at_first = dump(source);

    ok(source.clear_all(), "clear_all");
    ok(source.set(b"x".to_vec(), b"9".to_vec()), "set");
    let second = ok(backup_bytes(source, true), "second incremental backup");

    ok(target.restore(&mut full.as_slice()), "restore full");
    ok(target.restore(&mut first.as_slice()), "restore first delta");
    assert_eq!(dump(target), state_at_first);
    ok(target.restore(&mut second.as_slice()), "restore second delta");
    assert_eq!(dump(target), dump(source));
    assert_eq!(target.len(), source.len());

    // nothing changed since the last backup
    let empty = ok(backup_bytes(source, true), "empty incremental backup");
    ok(target.restore(&mut empty.as_slice()), "restore empty delta");
    assert_eq!(dump(target), dump(source));
}

pub fn corrupt_restore_preserves_state<S: KVStore + ?Sized>(store: &mut S) {
    fill_scenario(store);
    let before = dump(store);
    let stream = ok(backup_bytes(store, false), "backup");

    let mut flipped = stream.clone();
    let middle = flipped.len() / 2;
    flipped[middle] ^= 0x40;

    let bad_streams: Vec<(&str, Vec<u8>)> = vec![
        ("empty", Vec::new()),
        ("truncated", stream[..stream.len() / 2].to_vec()),
        ("missing last byte", stream[..stream.len() - 1].to_vec()),
        ("garbage", b"definitely not a backup stream".to_vec()),
        ("flipped bit", flipped),
    ];
    for (what, bad) in bad_streams {
        match store.restore(&mut bad.as_slice()) {
            Err(KVStoreError::CorruptData(_)) => {}
            other => panic!("restore of {} stream should be CorruptData, got {:?}", what, other),
        }
        assert_eq!(dump(store), before, "state changed by {} stream", what);
        assert_eq!(store.len(), 3);
        assert_eq!(ok(store.get(b"ab"), "get"), b"1");
    }
}

pub fn version_mismatch_detected<S: KVStore + ?Sized>(store: &mut S) {
    fill_scenario(store);
    let before = dump(store);
    let mut stream = ok(backup_bytes(store, false), "backup");
    // format version follows the 8-byte magic
    stream[8..10].copy_from_slice(&u16::MAX.to_be_bytes());

    match store.restore(&mut stream.as_slice()) {
        Err(KVStoreError::VersionMismatch { found, .. }) => assert_eq!(found, u16::MAX),
        other => panic!("restore should be VersionMismatch, got {:?}", other),
    }
    assert_eq!(dump(store), before);
}

fn assert_stopped<T: Debug>(result: Result<T>, what: &str) {
    match result {
        Err(KVStoreError::Stopped) => {}
        other => panic!("{} after stop should be Stopped, got {:?}", what, other),
    }
}

pub fn stop_is_terminal<S: KVStore + ?Sized>(store: &mut S) {
    ok(store.set(b"k".to_vec(), b"v".to_vec()), "set");
    let stream = ok(backup_bytes(store, false), "backup");
    ok(store.stop(), "stop");
    ok(store.stop(), "second stop");

    assert_stopped(store.get(b"k"), "get");
    assert_stopped(store.set(b"k".to_vec(), b"w".to_vec()), "set");
    assert_stopped(store.delete(b"k"), "delete");
    assert_stopped(store.exists(b"k"), "exists");
    assert_stopped(store.get_all(b"", false), "get_all");
    assert_stopped(store.clear_all(), "clear_all");
    assert_stopped(store.backup(&mut Vec::new(), false), "backup");
    assert_stopped(store.restore(&mut stream.as_slice()), "restore");
    assert_stopped(
        store.write_batch(vec![ChangeItem::set(b"k".to_vec(), b"w".to_vec())]),
        "write_batch",
    );
    ok(store.stop(), "stop after stop");
}
