use obelisk::{Config, DirError, DirectoryDB, Entry, Scope};
use tempfile::tempdir;

/// Simulates a crash: the engine is leaked so no close/checkpoint runs and
/// the WAL tail is left exactly as the "dying" process wrote it.
fn crash(db: DirectoryDB) {
    std::mem::forget(db);
}

#[test]
fn committed_transaction_survives_crash_before_page_flush() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=durable,dc=t").with_str("cn", "D"))
            .expect("put");
        db.commit(&mut tx).expect("commit");
        // Crash right after the commit record was fsynced; dirty pages were
        // never flushed.
        crash(db);
    }

    let db = DirectoryDB::open(Config::new(dir.path())).expect("reopen");
    let tx = db.begin().expect("begin");
    let entry = db.get(&tx, "uid=durable,dc=t").expect("redo recovered the commit");
    assert_eq!(entry.values("cn").unwrap(), &[b"D".to_vec()]);
}

#[test]
fn uncommitted_transaction_is_undone_after_crash() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=base,dc=t").with_str("cn", "B"))
            .expect("put");
        db.commit(&mut tx).expect("commit");

        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=phantom,dc=t").with_str("cn", "P"))
            .expect("put without commit");
        crash(db);
    }

    let db = DirectoryDB::open(Config::new(dir.path())).expect("reopen");
    let tx = db.begin().expect("begin");
    assert!(db.get(&tx, "uid=base,dc=t").is_ok(), "committed data survives");
    assert!(
        matches!(db.get(&tx, "uid=phantom,dc=t"), Err(DirError::NotFound(_))),
        "uncommitted write was undone"
    );
    let dns: Vec<String> = db
        .search_by_dn(&tx, "dc=t", Scope::Subtree)
        .expect("search")
        .map(|e| e.expect("entry").dn)
        .collect();
    assert_eq!(dns, vec!["uid=base,dc=t"], "no phantom DN in enumeration");
}

#[test]
fn crash_mid_update_keeps_previous_value() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=v,dc=t").with_str("rev", "1")).expect("put");
        db.commit(&mut tx).expect("commit");

        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=v,dc=t").with_str("rev", "2")).expect("update");
        crash(db);
    }

    let db = DirectoryDB::open(Config::new(dir.path())).expect("reopen");
    let tx = db.begin().expect("begin");
    let entry = db.get(&tx, "uid=v,dc=t").expect("entry survives");
    assert_eq!(entry.values("rev").unwrap(), &[b"1".to_vec()]);
}

#[test]
fn torn_wal_tail_preserves_durable_prefix() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=safe,dc=t").with_str("cn", "S")).expect("put");
        db.commit(&mut tx).expect("commit");

        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=torn,dc=t").with_str("cn", "T")).expect("put");
        crash(db);
    }

    // Chop bytes off the WAL to simulate a write torn mid-record.
    let wal_path = dir.path().join("directory.oba.wal");
    let len = std::fs::metadata(&wal_path).expect("wal metadata").len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&wal_path)
        .expect("open wal");
    file.set_len(len - 5).expect("tear the tail");

    let db = DirectoryDB::open(Config::new(dir.path())).expect("reopen past torn tail");
    let tx = db.begin().expect("begin");
    assert!(db.get(&tx, "uid=safe,dc=t").is_ok());
    assert!(matches!(
        db.get(&tx, "uid=torn,dc=t"),
        Err(DirError::NotFound(_))
    ));
}

#[test]
fn clean_close_and_reopen_preserves_counters() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=one,dc=t").with_str("n", "1")).expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }
    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("reopen 1");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=two,dc=t").with_str("n", "2")).expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }

    let db = DirectoryDB::open(Config::new(dir.path())).expect("reopen 2");
    let tx = db.begin().expect("begin");
    assert!(db.get(&tx, "uid=one,dc=t").is_ok());
    assert!(db.get(&tx, "uid=two,dc=t").is_ok());
    let report = db.verify_integrity().expect("verify");
    assert!(report.is_healthy(), "store is healthy after restarts: {report:?}");
}

#[test]
fn repeated_crashes_converge() {
    let dir = tempdir().expect("tmpdir");

    for round in 0..3u32 {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(
            &mut tx,
            &Entry::new(&format!("uid=r{round},dc=t")).with_str("n", &round.to_string()),
        )
        .expect("put");
        db.commit(&mut tx).expect("commit");

        // Leave an uncommitted straggler behind every crash.
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=straggler,dc=t").with_str("n", "x"))
            .expect("put");
        crash(db);
    }

    let db = DirectoryDB::open(Config::new(dir.path())).expect("final open");
    let tx = db.begin().expect("begin");
    for round in 0..3u32 {
        assert!(db.get(&tx, &format!("uid=r{round},dc=t")).is_ok());
    }
    assert!(matches!(
        db.get(&tx, "uid=straggler,dc=t"),
        Err(DirError::NotFound(_))
    ));
}
