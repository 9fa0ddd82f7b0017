use obelisk::{Config, DirError, DirectoryDB, Entry, Scope};
use tempfile::tempdir;

fn open(dir: &tempfile::TempDir) -> DirectoryDB {
    DirectoryDB::open(Config::new(dir.path())).expect("open")
}

#[test]
fn uncommitted_insert_is_invisible_until_commit() {
    let dir = tempdir().expect("tmpdir");
    let db = open(&dir);

    // A begins and inserts X without committing.
    let mut tx_a = db.begin().expect("begin a");
    db.put(&mut tx_a, &Entry::new("uid=x,dc=t").with_str("cn", "X"))
        .expect("put");

    // B begins later and must not see the dirty write.
    let tx_b = db.begin().expect("begin b");
    assert!(matches!(
        db.get(&tx_b, "uid=x,dc=t"),
        Err(DirError::NotFound(_))
    ));

    // A sees its own uncommitted write.
    let own = db.get(&tx_a, "uid=x,dc=t").expect("read own write");
    assert_eq!(own.values("cn").unwrap(), &[b"X".to_vec()]);

    db.commit(&mut tx_a).expect("commit a");

    // B's snapshot predates the commit: still invisible.
    assert!(matches!(
        db.get(&tx_b, "uid=x,dc=t"),
        Err(DirError::NotFound(_))
    ));

    // C begins after the commit and sees it.
    let tx_c = db.begin().expect("begin c");
    assert!(db.get(&tx_c, "uid=x,dc=t").is_ok());
}

#[test]
fn repeated_get_in_one_snapshot_is_stable() {
    let dir = tempdir().expect("tmpdir");
    let db = open(&dir);

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("uid=s,dc=t").with_str("v", "1")).expect("put");
    db.commit(&mut tx).expect("commit");

    let reader = db.begin().expect("begin reader");
    let first = db.get(&reader, "uid=s,dc=t").expect("first read");

    // A concurrent writer updates and commits.
    let mut writer = db.begin().expect("begin writer");
    db.put(&mut writer, &Entry::new("uid=s,dc=t").with_str("v", "2")).expect("put");
    db.commit(&mut writer).expect("commit");

    let second = db.get(&reader, "uid=s,dc=t").expect("second read");
    assert_eq!(first, second, "non-repeatable reads are impossible");
    assert_eq!(second.values("v").unwrap(), &[b"1".to_vec()]);

    // A fresh snapshot observes the new value.
    let fresh = db.begin().expect("begin fresh");
    let entry = db.get(&fresh, "uid=s,dc=t").expect("fresh read");
    assert_eq!(entry.values("v").unwrap(), &[b"2".to_vec()]);
}

#[test]
fn repeated_scoped_search_is_phantom_free() {
    let dir = tempdir().expect("tmpdir");
    let db = open(&dir);

    let mut tx = db.begin().expect("begin");
    for i in 0..5u32 {
        db.put(&mut tx, &Entry::new(&format!("uid=p{i},dc=t")).with_str("n", "x"))
            .expect("put");
    }
    db.commit(&mut tx).expect("commit");

    let reader = db.begin().expect("begin reader");
    let scan = |tx: &obelisk::Transaction| -> Vec<String> {
        db.search_by_dn(tx, "dc=t", Scope::Subtree)
            .expect("search")
            .map(|e| e.expect("entry").dn)
            .collect()
    };
    let first = scan(&reader);

    // Concurrent insert and delete commit mid-snapshot.
    let mut writer = db.begin().expect("begin writer");
    db.put(&mut writer, &Entry::new("uid=p9,dc=t").with_str("n", "x")).expect("put");
    db.delete(&mut writer, "uid=p0,dc=t").expect("delete");
    db.commit(&mut writer).expect("commit");

    let second = scan(&reader);
    assert_eq!(first, second, "snapshot scans yield an identical multiset");

    let fresh = db.begin().expect("begin fresh");
    let third = scan(&fresh);
    assert_eq!(third.len(), 5);
    assert!(third.contains(&"uid=p9,dc=t".to_string()));
    assert!(!third.contains(&"uid=p0,dc=t".to_string()));
}

#[test]
fn delete_remains_visible_to_older_snapshot() {
    let dir = tempdir().expect("tmpdir");
    let db = open(&dir);

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("uid=d,dc=t").with_str("cn", "D")).expect("put");
    db.commit(&mut tx).expect("commit");

    let old_reader = db.begin().expect("begin old reader");

    let mut deleter = db.begin().expect("begin deleter");
    db.delete(&mut deleter, "uid=d,dc=t").expect("delete");
    db.commit(&mut deleter).expect("commit delete");

    // The old snapshot still reads the pre-delete value.
    let entry = db.get(&old_reader, "uid=d,dc=t").expect("old snapshot read");
    assert_eq!(entry.values("cn").unwrap(), &[b"D".to_vec()]);

    let fresh = db.begin().expect("begin fresh");
    assert!(matches!(
        db.get(&fresh, "uid=d,dc=t"),
        Err(DirError::NotFound(_))
    ));
}

#[test]
fn rollback_erases_all_traces() {
    let dir = tempdir().expect("tmpdir");
    let db = open(&dir);

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("uid=keep,dc=t").with_str("cn", "K")).expect("put");
    db.commit(&mut tx).expect("commit");

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("uid=gone,dc=t").with_str("cn", "G")).expect("put");
    db.put(&mut tx, &Entry::new("uid=keep,dc=t").with_str("cn", "K2")).expect("overwrite");
    db.rollback(&mut tx).expect("rollback");

    let tx = db.begin().expect("begin");
    assert!(matches!(
        db.get(&tx, "uid=gone,dc=t"),
        Err(DirError::NotFound(_))
    ));
    let kept = db.get(&tx, "uid=keep,dc=t").expect("kept entry");
    assert_eq!(kept.values("cn").unwrap(), &[b"K".to_vec()]);

    // Aborted DNs never surface in scoped enumeration.
    let dns: Vec<String> = db
        .search_by_dn(&tx, "dc=t", Scope::Subtree)
        .expect("search")
        .map(|e| e.expect("entry").dn)
        .collect();
    assert_eq!(dns, vec!["uid=keep,dc=t"]);
}

#[test]
fn serialized_writers_proceed_one_at_a_time() {
    use std::sync::Arc;

    let dir = tempdir().expect("tmpdir");
    let db = Arc::new(open(&dir));

    let mut handles = Vec::new();
    for worker in 0..4u32 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for i in 0..10u32 {
                let mut tx = db.begin().expect("begin");
                let entry = Entry::new(&format!("uid=w{worker}-{i},dc=t")).with_str("n", "1");
                db.put(&mut tx, &entry).expect("put");
                db.commit(&mut tx).expect("commit");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker");
    }

    let tx = db.begin().expect("begin");
    let count = db
        .search_by_dn(&tx, "dc=t", Scope::Subtree)
        .expect("search")
        .count();
    assert_eq!(count, 40);
}

#[test]
fn gc_prunes_old_versions_but_respects_live_snapshots() {
    let dir = tempdir().expect("tmpdir");
    let db = open(&dir);

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("uid=g,dc=t").with_str("v", "old")).expect("put");
    db.commit(&mut tx).expect("commit");

    let pinned = db.begin().expect("pinned snapshot");

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("uid=g,dc=t").with_str("v", "new")).expect("put");
    db.commit(&mut tx).expect("commit");

    db.gc().expect("gc with live snapshot");
    let entry = db.get(&pinned, "uid=g,dc=t").expect("pinned read survives gc");
    assert_eq!(entry.values("v").unwrap(), &[b"old".to_vec()]);
}
