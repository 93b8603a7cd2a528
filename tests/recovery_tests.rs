//! Crash recovery, reopen, and database lifecycle behavior.

use emberdb::{Error, Iter, Options, ReadOptions, WriteBatch, WriteOptions, DB};
use tempfile::TempDir;

fn options() -> Options {
    Options::new().create_if_missing(true)
}

#[test]
fn test_open_missing_db_requires_create_flag() {
    let dir = TempDir::new().unwrap();
    let err = DB::open(Options::new(), dir.path().join("nope")).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}

#[test]
fn test_error_if_exists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    drop(DB::open(options(), &path).unwrap());
    let err = DB::open(options().error_if_exists(true), &path).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
}

#[test]
fn test_lock_excludes_second_instance() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let db = DB::open(options(), &path).unwrap();
    assert!(DB::open(options(), &path).is_err());
    drop(db);
    DB::open(options(), &path).expect("reopen after close");
}

#[test]
fn test_synced_writes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = DB::open(options(), &path).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"x", b"1");
        batch.put(b"y", b"2");
        db.write(WriteOptions::new().sync(true), batch).unwrap();
    }

    let db = DB::open(options(), &path).unwrap();
    let mut it = db.new_iterator(&ReadOptions::new());
    it.seek_to_first();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push((it.key().to_vec(), it.value().to_vec()));
        it.next();
    }
    assert_eq!(
        seen,
        vec![
            (b"x".to_vec(), b"1".to_vec()),
            (b"y".to_vec(), b"2".to_vec()),
        ]
    );
}

#[test]
fn test_reopen_preserves_overwrites_and_deletes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = DB::open(options(), &path).unwrap();
        db.put(WriteOptions::new(), b"keep", b"v1").unwrap();
        db.put(WriteOptions::new(), b"keep", b"v2").unwrap();
        db.put(WriteOptions::new(), b"gone", b"v").unwrap();
        db.delete(WriteOptions::new(), b"gone").unwrap();
    }
    let db = DB::open(options(), &path).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), b"keep").unwrap(),
        Some(b"v2".to_vec())
    );
    assert_eq!(db.get(&ReadOptions::new(), b"gone").unwrap(), None);
}

#[test]
fn test_sequence_monotonic_across_reopens() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = DB::open(options(), &path).unwrap();
        db.put(WriteOptions::new(), b"a", b"old").unwrap();
    }
    {
        // Mutations after reopen must shadow the recovered ones.
        let db = DB::open(options(), &path).unwrap();
        db.put(WriteOptions::new(), b"a", b"new").unwrap();
        assert_eq!(
            db.get(&ReadOptions::new(), b"a").unwrap(),
            Some(b"new".to_vec())
        );
    }
    let db = DB::open(options(), &path).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), b"a").unwrap(),
        Some(b"new".to_vec())
    );
}

#[test]
fn test_recovery_flushes_large_logs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let value = vec![3u8; 1000];
    {
        let db = DB::open(options(), &path).unwrap();
        for i in 0..500 {
            db.put(WriteOptions::new(), format!("key{i:05}").as_bytes(), &value)
                .unwrap();
        }
    }
    // A small write buffer forces recovery itself to spill level-0 files.
    let db = DB::open(options().write_buffer_size(64 << 10), &path).unwrap();
    for i in (0..500).step_by(97) {
        assert_eq!(
            db.get(&ReadOptions::new(), format!("key{i:05}").as_bytes())
                .unwrap()
                .as_deref(),
            Some(value.as_slice()),
            "key{i:05}"
        );
    }
    let total_files: usize = (0..7)
        .map(|l| {
            db.get_property(&format!("num-files-at-level{l}"))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert!(total_files > 0, "recovery should have flushed at least one table");
}

#[test]
fn test_reuse_logs_appends_to_previous_wal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = DB::open(options().reuse_logs(true), &path).unwrap();
        db.put(WriteOptions::new(), b"first", b"1").unwrap();
    }
    {
        let db = DB::open(options().reuse_logs(true), &path).unwrap();
        db.put(WriteOptions::new(), b"second", b"2").unwrap();
        assert_eq!(
            db.get(&ReadOptions::new(), b"first").unwrap(),
            Some(b"1".to_vec())
        );
    }
    let db = DB::open(options().reuse_logs(true), &path).unwrap();
    assert_eq!(
        db.get(&ReadOptions::new(), b"first").unwrap(),
        Some(b"1".to_vec())
    );
    assert_eq!(
        db.get(&ReadOptions::new(), b"second").unwrap(),
        Some(b"2".to_vec())
    );
}

#[test]
fn test_recovery_after_flushes_and_compactions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let value = vec![9u8; 500];
    {
        let db = DB::open(options().write_buffer_size(64 << 10), &path).unwrap();
        for i in 0..3000 {
            db.put(WriteOptions::new(), format!("key{i:06}").as_bytes(), &value)
                .unwrap();
        }
        db.compact_range(None, None).unwrap();
        for i in 0..3000 {
            if i % 3 == 0 {
                db.delete(WriteOptions::new(), format!("key{i:06}").as_bytes())
                    .unwrap();
            }
        }
    }

    let db = DB::open(options(), &path).unwrap();
    for i in 0..3000 {
        let got = db
            .get(&ReadOptions::new(), format!("key{i:06}").as_bytes())
            .unwrap();
        if i % 3 == 0 {
            assert_eq!(got, None, "key{i:06} should be deleted");
        } else {
            assert_eq!(got.as_deref(), Some(value.as_slice()), "key{i:06}");
        }
    }
}

#[test]
fn test_destroy_db() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let db = DB::open(options(), &path).unwrap();
        db.put(WriteOptions::new(), b"k", b"v").unwrap();
    }
    DB::destroy_db(&path, Options::new()).unwrap();
    assert!(!path.exists());

    // Destroying a missing directory is fine.
    DB::destroy_db(dir.path().join("never-existed"), Options::new()).unwrap();
}
