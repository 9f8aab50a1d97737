//! Boundary-call behaviour, driven the way a foreign runtime would

use std::fs;

use tempfile::TempDir;
use tidedb_native::NativeInterface;

struct Fixture {
    ni: NativeInterface,
    dir: TempDir,
    options: u64,
    read_options: u64,
    write_options: u64,
}

impl Fixture {
    fn new() -> Self {
        let ni = NativeInterface::new();
        let options = ni.options_create();
        ni.options_set_create_if_missing(options, true).unwrap();
        let read_options = ni.readoptions_create();
        let write_options = ni.writeoptions_create();
        Self {
            ni,
            dir: TempDir::new().unwrap(),
            options,
            read_options,
            write_options,
        }
    }

    fn name(&self) -> String {
        self.dir.path().join("testfile.tidedb").to_string_lossy().into_owned()
    }

    fn open(&self) -> u64 {
        self.ni.open(self.options, Some(&self.name())).unwrap()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.ni.options_destroy(self.options);
        let _ = self.ni.readoptions_destroy(self.read_options);
        let _ = self.ni.writeoptions_destroy(self.write_options);
    }
}

#[test]
fn test_basics() {
    let f = Fixture::new();
    let ni = &f.ni;

    let err = ni.open(f.options, None).unwrap_err();
    assert!(err.contains("must not be null"), "{}", err);

    let db = f.open();
    ni.put(db, f.write_options, b"key", b"value").unwrap();
    assert_eq!(ni.get(db, f.read_options, b"key").unwrap(), Some(b"value".to_vec()));
    assert_eq!(ni.get(db, f.read_options, b"missing").unwrap(), None);
    ni.close(db).unwrap();

    ni.destroy_db(f.options, Some(&f.name())).unwrap();
    assert!(!f.dir.path().join("testfile.tidedb").exists());
}

#[test]
fn test_inserts_updates_deletes_and_iters() {
    let f = Fixture::new();
    let ni = &f.ni;
    let db = f.open();

    for i in 0..1000 {
        let value = format!("the number {}", i);
        ni.put(db, f.write_options, i.to_string().as_bytes(), value.as_bytes()).unwrap();
    }
    for i in (1..1000).step_by(2) {
        let key = i.to_string();
        let value = ni.get(db, f.read_options, key.as_bytes()).unwrap().unwrap();
        let updated = format!("{} odd", String::from_utf8(value).unwrap());
        ni.put(db, f.write_options, key.as_bytes(), updated.as_bytes()).unwrap();
    }
    for i in (0..1000).step_by(5) {
        ni.delete(db, f.write_options, i.to_string().as_bytes()).unwrap();
    }

    for i in (0..1000).step_by(3) {
        let value = ni.get(db, f.read_options, i.to_string().as_bytes()).unwrap();
        match value {
            None => assert_eq!(i % 5, 0),
            Some(value) => assert_eq!(i % 2 == 1, String::from_utf8(value).unwrap().ends_with("odd")),
        }
    }

    let iter = ni.create_iterator(db, f.read_options).unwrap();
    assert!(!ni.iter_valid(iter).unwrap());
    ni.iter_seek_to_first(iter).unwrap();
    let mut count = 0;
    let mut last: Option<Vec<u8>> = None;
    while ni.iter_valid(iter).unwrap() {
        let key = ni.iter_key(iter).unwrap();
        let number: u32 = String::from_utf8(key.clone()).unwrap().parse().unwrap();
        let value = String::from_utf8(ni.iter_value(iter).unwrap()).unwrap();
        assert_eq!(number % 2 == 1, value.ends_with("odd"));
        assert_ne!(number % 5, 0);
        if let Some(last) = &last {
            assert!(last < &key);
        }
        last = Some(key);
        count += 1;
        ni.iter_next(iter).unwrap();
    }
    assert_eq!(count, 800);
    assert_eq!(ni.iter_get_error(iter).unwrap(), None);
    assert!(ni.iter_key(iter).unwrap_err().contains("not valid"));
    ni.iter_destroy(iter).unwrap();

    ni.close(db).unwrap();
    ni.destroy_db(f.options, Some(&f.name())).unwrap();
}

#[test]
fn test_iterator_navigation() {
    let f = Fixture::new();
    let ni = &f.ni;
    let db = f.open();
    for key in ["a", "c", "e"] {
        ni.put(db, f.write_options, key.as_bytes(), b"v").unwrap();
    }

    let iter = ni.create_iterator(db, f.read_options).unwrap();
    ni.iter_seek(iter, b"b").unwrap();
    assert_eq!(ni.iter_key(iter).unwrap(), b"c");
    ni.iter_prev(iter).unwrap();
    assert_eq!(ni.iter_key(iter).unwrap(), b"a");
    ni.iter_seek_to_last(iter).unwrap();
    assert_eq!(ni.iter_key(iter).unwrap(), b"e");
    ni.iter_next(iter).unwrap();
    assert!(!ni.iter_valid(iter).unwrap());
    ni.iter_destroy(iter).unwrap();
}

#[test]
fn test_write_batch() {
    let f = Fixture::new();
    let ni = &f.ni;
    let db = f.open();
    ni.put(db, f.write_options, b"old", b"x").unwrap();

    let batch = ni.writebatch_create();
    ni.writebatch_put(batch, b"k1", b"v1").unwrap();
    ni.writebatch_put(batch, b"k2", b"v2").unwrap();
    ni.writebatch_delete(batch, b"old").unwrap();
    ni.write(db, f.write_options, batch).unwrap();

    assert_eq!(ni.get(db, f.read_options, b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(ni.get(db, f.read_options, b"old").unwrap(), None);

    ni.writebatch_clear(batch).unwrap();
    ni.writebatch_put(batch, b"k3", b"v3").unwrap();
    ni.write(db, f.write_options, batch).unwrap();
    assert_eq!(ni.get(db, f.read_options, b"k3").unwrap(), Some(b"v3".to_vec()));
    assert_eq!(ni.property_value(db, Some("tidedb.last-sequence")).unwrap().as_deref(), Some("5"));

    ni.writebatch_destroy(batch).unwrap();
    assert!(ni.writebatch_put(batch, b"k", b"v").is_err());
}

#[test]
fn test_snapshot_through_read_options() {
    let f = Fixture::new();
    let ni = &f.ni;
    let db = f.open();
    ni.put(db, f.write_options, b"k", b"before").unwrap();

    let snapshot = ni.create_snapshot(db).unwrap();
    ni.put(db, f.write_options, b"k", b"after").unwrap();

    let at_snapshot = ni.readoptions_create();
    ni.readoptions_set_snapshot(at_snapshot, snapshot).unwrap();
    assert_eq!(ni.get(db, at_snapshot, b"k").unwrap(), Some(b"before".to_vec()));
    assert_eq!(ni.get(db, f.read_options, b"k").unwrap(), Some(b"after".to_vec()));

    ni.readoptions_set_snapshot(at_snapshot, 0).unwrap();
    assert_eq!(ni.get(db, at_snapshot, b"k").unwrap(), Some(b"after".to_vec()));

    ni.release_snapshot(db, snapshot).unwrap();
    assert!(ni.readoptions_set_snapshot(at_snapshot, snapshot).is_err());
    assert!(ni.release_snapshot(db, snapshot).is_err());
    ni.readoptions_destroy(at_snapshot).unwrap();
}

#[test]
fn test_snapshot_released_only_through_its_database() {
    let f = Fixture::new();
    let ni = &f.ni;
    let first = f.open();
    let other_name = f.dir.path().join("other.tidedb").to_string_lossy().into_owned();
    let second = ni.open(f.options, Some(&other_name)).unwrap();

    ni.put(first, f.write_options, b"k", b"v").unwrap();
    let snapshot = ni.create_snapshot(first).unwrap();
    let err = ni.release_snapshot(second, snapshot).unwrap_err();
    assert!(err.contains("belongs to database"), "{}", err);

    // Still registered, so the owner can release it
    ni.release_snapshot(first, snapshot).unwrap();
    assert!(ni.release_snapshot(first, snapshot).is_err());

    ni.close(second).unwrap();
    ni.close(first).unwrap();
}

#[test]
fn test_use_after_close_is_an_error() {
    let f = Fixture::new();
    let ni = &f.ni;
    let db = f.open();
    ni.put(db, f.write_options, b"k", b"v").unwrap();
    let iter = ni.create_iterator(db, f.read_options).unwrap();
    assert_eq!(ni.open_databases(), 1);

    ni.close(db).unwrap();
    assert_eq!(ni.open_databases(), 0);

    let err = ni.put(db, f.write_options, b"k", b"v").unwrap_err();
    assert!(err.contains("invalid database handle"), "{}", err);
    assert!(ni.get(db, f.read_options, b"k").is_err());
    assert!(ni.close(db).is_err());
    assert!(ni.property_value(db, Some("tidedb.stats")).is_err());

    // Iterators outlive the database handle
    ni.iter_seek_to_first(iter).unwrap();
    assert_eq!(ni.iter_key(iter).unwrap(), b"k");
    ni.iter_destroy(iter).unwrap();
    assert!(ni.iter_valid(iter).is_err());

    // The directory lock was released
    let db = f.open();
    assert_eq!(ni.get(db, f.read_options, b"k").unwrap(), Some(b"v".to_vec()));
    ni.close(db).unwrap();
}

#[test]
fn test_forged_and_mismatched_handles() {
    let f = Fixture::new();
    let ni = &f.ni;
    assert!(ni.get(0, f.read_options, b"k").is_err());
    assert!(ni.iter_next(0xdead_beef).is_err());

    // A handle of the wrong kind is not found in the other table
    let db = f.open();
    assert!(ni.get(db, f.write_options + (1 << 40), b"k").is_err());
    ni.close(db).unwrap();
}

#[test]
fn test_open_errors_follow_options() {
    let f = Fixture::new();
    let ni = &f.ni;

    let strict = ni.options_create();
    let err = ni.open(strict, Some(&f.name())).unwrap_err();
    assert!(err.contains("Not found"), "{}", err);
    assert!(!f.dir.path().join("testfile.tidedb").exists());

    let db = f.open();
    ni.close(db).unwrap();
    ni.options_set_error_if_exists(strict, true).unwrap();
    let err = ni.open(strict, Some(&f.name())).unwrap_err();
    assert!(err.contains("Already exists"), "{}", err);
    ni.options_destroy(strict).unwrap();
}

#[test]
fn test_option_setters() {
    let f = Fixture::new();
    let ni = &f.ni;
    let options = f.options;

    assert!(ni.options_set_write_buffer_size(options, 0).is_err());
    assert!(ni.options_set_block_size(options, -1).is_err());
    assert!(ni.options_set_compression(options, 7).is_err());

    ni.options_set_write_buffer_size(options, 64 * 1024).unwrap();
    ni.options_set_max_open_files(options, 50).unwrap();
    ni.options_set_block_size(options, 1024).unwrap();
    ni.options_set_block_restart_interval(options, 8).unwrap();
    ni.options_set_compression(options, 1).unwrap();
    ni.options_set_paranoid_checks(options, true).unwrap();
    ni.readoptions_set_verify_checksums(f.read_options, true).unwrap();
    ni.readoptions_set_fill_cache(f.read_options, false).unwrap();
    ni.writeoptions_set_sync(f.write_options, true).unwrap();

    let cache = ni.cache_create_lru(1 << 20).unwrap();
    let env = ni.create_default_env();
    ni.options_set_cache(options, cache).unwrap();
    ni.options_set_env(options, env).unwrap();
    // The options keep their own references
    ni.cache_destroy(cache).unwrap();
    ni.env_destroy(env).unwrap();
    assert!(ni.options_set_cache(options, cache).is_err());

    let db = f.open();
    for i in 0..500 {
        ni.put(db, f.write_options, format!("{:04}", i).as_bytes(), &[b'x'; 200]).unwrap();
    }
    assert_eq!(ni.get(db, f.read_options, b"0123").unwrap(), Some(vec![b'x'; 200]));
    assert!(ni.property_value(db, Some("tidedb.nope")).unwrap().is_none());
    ni.close(db).unwrap();
}

#[test]
fn test_info_log_receives_engine_messages() {
    let f = Fixture::new();
    let ni = &f.ni;
    let log_path = f.dir.path().join("info.log");

    let logger = ni.logger_create(Some(&log_path.to_string_lossy())).unwrap();
    ni.options_set_info_log(f.options, logger).unwrap();
    let db = f.open();
    ni.put(db, f.write_options, b"k", b"v").unwrap();
    ni.close(db).unwrap();
    ni.logger_destroy(logger).unwrap();

    let contents = fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("Opened"), "{}", contents);
    assert!(contents.contains("Closed"), "{}", contents);
}

#[test]
fn test_repair_through_boundary() {
    let f = Fixture::new();
    let ni = &f.ni;
    let db = f.open();
    ni.put(db, f.write_options, b"survivor", b"yes").unwrap();
    ni.close(db).unwrap();

    for entry in fs::read_dir(f.dir.path().join("testfile.tidedb")).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if name.starts_with("MANIFEST") || name == "CURRENT" {
            fs::remove_file(path).unwrap();
        }
    }
    let strict = ni.options_create();
    assert!(ni.open(strict, Some(&f.name())).is_err());
    ni.options_destroy(strict).unwrap();

    ni.repair_db(f.options, Some(&f.name())).unwrap();
    let db = f.open();
    assert_eq!(ni.get(db, f.read_options, b"survivor").unwrap(), Some(b"yes".to_vec()));
    ni.close(db).unwrap();
}
