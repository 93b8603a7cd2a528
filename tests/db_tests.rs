//! End-to-end behavior of the public API against a live database.

use std::sync::Arc;

use emberdb::{Iter, Options, ReadOptions, WriteBatch, WriteOptions, DB};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> DB {
    DB::open(
        Options::new().create_if_missing(true),
        dir.path().join("db"),
    )
    .expect("open")
}

fn put(db: &DB, key: &[u8], value: &[u8]) {
    db.put(WriteOptions::new(), key, value).expect("put");
}

fn get(db: &DB, key: &[u8]) -> Option<Vec<u8>> {
    db.get(&ReadOptions::new(), key).expect("get")
}

#[test]
fn test_basic_reads_and_writes() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    put(&db, b"a", b"1");
    put(&db, b"b", b"2");
    assert_eq!(get(&db, b"a"), Some(b"1".to_vec()));
    assert_eq!(get(&db, b"b"), Some(b"2".to_vec()));
    assert_eq!(get(&db, b"c"), None);
}

#[test]
fn test_overwrite_and_delete() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    put(&db, b"k", b"v1");
    put(&db, b"k", b"v2");
    assert_eq!(get(&db, b"k"), Some(b"v2".to_vec()));

    db.delete(WriteOptions::new(), b"k").unwrap();
    assert_eq!(get(&db, b"k"), None);

    put(&db, b"k", b"v3");
    assert_eq!(get(&db, b"k"), Some(b"v3".to_vec()));
}

#[test]
fn test_snapshots_see_frozen_history() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    put(&db, b"k", b"v1");
    let s1 = db.get_snapshot();
    put(&db, b"k", b"v2");
    let s2 = db.get_snapshot();
    db.delete(WriteOptions::new(), b"k").unwrap();
    let s3 = db.get_snapshot();
    put(&db, b"k", b"v3");
    let s4 = db.get_snapshot();

    let at = |s: &Arc<emberdb::Snapshot>| {
        db.get(&ReadOptions::new().snapshot(Arc::clone(s)), b"k")
            .unwrap()
    };
    assert_eq!(at(&s1), Some(b"v1".to_vec()));
    assert_eq!(at(&s2), Some(b"v2".to_vec()));
    assert_eq!(at(&s3), None);
    assert_eq!(at(&s4), Some(b"v3".to_vec()));
    assert_eq!(get(&db, b"k"), Some(b"v3".to_vec()));

    db.release_snapshot(s1);
    db.release_snapshot(s2);
    db.release_snapshot(s3);
    db.release_snapshot(s4);
}

#[test]
fn test_boundary_keys_and_values() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    // Empty key, empty value.
    put(&db, b"", b"empty-key");
    put(&db, b"empty-value", b"");
    assert_eq!(get(&db, b""), Some(b"empty-key".to_vec()));
    assert_eq!(get(&db, b"empty-value"), Some(vec![]));

    // Keys containing NUL bytes are ordinary bytes.
    put(&db, b"a\x00b", b"nul");
    assert_eq!(get(&db, b"a\x00b"), Some(b"nul".to_vec()));
    assert_eq!(get(&db, b"a"), None);

    // A multi-megabyte value survives the round trip.
    let big = vec![0x5au8; 3 * 1024 * 1024];
    put(&db, b"big", &big);
    assert_eq!(get(&db, b"big"), Some(big));
}

#[test]
fn test_batch_is_atomic_and_ordered() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    put(&db, b"doomed", b"x");
    let mut batch = WriteBatch::new();
    batch.put(b"x", b"1");
    batch.put(b"y", b"2");
    batch.delete(b"doomed");
    batch.put(b"x", b"1b");
    db.write(WriteOptions::new(), batch).unwrap();

    assert_eq!(get(&db, b"x"), Some(b"1b".to_vec()));
    assert_eq!(get(&db, b"y"), Some(b"2".to_vec()));
    assert_eq!(get(&db, b"doomed"), None);
}

#[test]
fn test_empty_batch_waits_only() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    put(&db, b"k", b"v");
    db.write(WriteOptions::new(), WriteBatch::new()).unwrap();
    assert_eq!(get(&db, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_iterator_scans_in_order() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let keys: Vec<String> = (0..500).map(|i| format!("key{i:05}")).collect();
    // Insert in reverse to prove ordering comes from the comparator.
    for (i, key) in keys.iter().enumerate().rev() {
        put(&db, key.as_bytes(), format!("v{i}").as_bytes());
    }
    db.delete(WriteOptions::new(), b"key00250").unwrap();

    let mut it = db.new_iterator(&ReadOptions::new());
    it.seek_to_first();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push(String::from_utf8(it.key().to_vec()).unwrap());
        it.next();
    }
    it.status().unwrap();

    let mut expected = keys.clone();
    expected.remove(250);
    assert_eq!(seen, expected);
}

#[test]
fn test_iterator_seek_and_prev() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    for i in (0..100).step_by(2) {
        put(&db, format!("k{i:04}").as_bytes(), b"v");
    }

    let mut it = db.new_iterator(&ReadOptions::new());
    it.seek(b"k0013");
    assert!(it.valid());
    assert_eq!(it.key(), b"k0014");

    it.prev();
    assert_eq!(it.key(), b"k0012");
    it.prev();
    assert_eq!(it.key(), b"k0010");

    it.seek_to_last();
    assert_eq!(it.key(), b"k0098");

    it.seek_to_first();
    assert_eq!(it.key(), b"k0000");
    it.prev();
    assert!(!it.valid());
}

#[test]
fn test_iterator_hides_newer_writes() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    put(&db, b"a", b"1");
    put(&db, b"b", b"2");

    let mut it = db.new_iterator(&ReadOptions::new());
    // Mutate after iterator creation: invisible through it.
    put(&db, b"c", b"3");
    db.delete(WriteOptions::new(), b"a").unwrap();

    it.seek_to_first();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push((it.key().to_vec(), it.value().to_vec()));
        it.next();
    }
    assert_eq!(
        seen,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ]
    );
}

#[test]
fn test_iterator_collapses_versions() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    for round in 0..5 {
        for i in 0..50 {
            put(
                &db,
                format!("key{i:03}").as_bytes(),
                format!("round{round}").as_bytes(),
            );
        }
    }

    let mut it = db.new_iterator(&ReadOptions::new());
    it.seek_to_first();
    let mut count = 0;
    while it.valid() {
        assert_eq!(it.value(), b"round4");
        count += 1;
        it.next();
    }
    assert_eq!(count, 50);

    // Backwards too.
    it.seek_to_last();
    let mut count = 0;
    while it.valid() {
        assert_eq!(it.value(), b"round4");
        count += 1;
        it.prev();
    }
    assert_eq!(count, 50);
}

#[test]
fn test_properties() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    put(&db, b"k", b"v");

    assert!(db.get_property("num-files-at-level0").is_some());
    assert!(db.get_property("num-files-at-level99").is_none());
    assert!(db.get_property("stats").is_some());
    assert!(db.get_property("sstables").is_some());
    let usage: usize = db
        .get_property("approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    assert!(usage > 0);
    assert!(db.get_property("no-such-property").is_none());
}

#[test]
fn test_approximate_sizes_grow_with_data() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(
        Options::new()
            .create_if_missing(true)
            .write_buffer_size(64 << 10),
        dir.path().join("db"),
    )
    .unwrap();

    let value = vec![7u8; 1000];
    for i in 0..2000 {
        put(&db, format!("key{i:06}").as_bytes(), &value);
    }
    // Force what is memory-resident onto disk so offsets are measurable.
    db.compact_range(None, None).unwrap();

    let sizes = db.get_approximate_sizes(&[
        (b"key000000", b"key001000"),
        (b"key001000", b"key002000"),
        (b"zz", b"zzz"),
    ]);
    assert!(sizes[0] > 100_000, "low range too small: {}", sizes[0]);
    assert!(sizes[1] > 100_000, "high range too small: {}", sizes[1]);
    assert!(sizes[2] < 10_000, "empty range too large: {}", sizes[2]);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(open_db(&dir));

    let writer = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || {
            for i in 0..2000u32 {
                db.put(
                    WriteOptions::new(),
                    format!("key{:06}", i).as_bytes(),
                    format!("value{i}").as_bytes(),
                )
                .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    // Any key that is visible must have its final value.
                    if let Some(v) = db.get(&ReadOptions::new(), b"key000123").unwrap() {
                        assert_eq!(v, b"value123");
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(get(&db, b"key001999"), Some(b"value1999".to_vec()));
}
