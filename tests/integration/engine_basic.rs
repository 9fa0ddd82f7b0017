use obelisk::{Config, DirError, DirectoryDB, Entry, IndexKind, Scope};
use tempfile::tempdir;

fn alice() -> Entry {
    Entry::new("uid=alice,ou=users,dc=example,dc=com").with_str("cn", "Alice Smith")
}

#[test]
fn put_commit_reopen_get_with_case_folding() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &alice()).expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }

    let db = DirectoryDB::open(Config::new(dir.path())).expect("reopen");
    let tx = db.begin().expect("begin");
    let entry = db
        .get(&tx, "UID=Alice,OU=Users,DC=Example,DC=Com")
        .expect("get after reopen");
    assert_eq!(entry.dn, "uid=alice,ou=users,dc=example,dc=com");
    assert_eq!(entry.values("cn").unwrap(), &[b"Alice Smith".to_vec()]);
}

#[test]
fn get_missing_entry_is_not_found() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    let tx = db.begin().expect("begin");
    assert!(matches!(
        db.get(&tx, "uid=nobody,dc=example"),
        Err(DirError::NotFound(_))
    ));
}

#[test]
fn update_replaces_attributes() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &alice()).expect("put");
    db.commit(&mut tx).expect("commit");

    let mut tx = db.begin().expect("begin");
    let updated = Entry::new("uid=alice,ou=users,dc=example,dc=com")
        .with_str("cn", "Alice A. Smith")
        .with_str("mail", "alice@example.com");
    db.put(&mut tx, &updated).expect("update");
    db.commit(&mut tx).expect("commit");

    let tx = db.begin().expect("begin");
    let entry = db.get(&tx, "uid=alice,ou=users,dc=example,dc=com").expect("get");
    assert_eq!(entry.values("cn").unwrap(), &[b"Alice A. Smith".to_vec()]);
    assert!(entry.has_attribute("mail"));
}

#[test]
fn delete_then_get_reports_not_found() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &alice()).expect("put");
    db.commit(&mut tx).expect("commit");

    let mut tx = db.begin().expect("begin");
    db.delete(&mut tx, "uid=alice,ou=users,dc=example,dc=com").expect("delete");
    db.commit(&mut tx).expect("commit");

    let tx = db.begin().expect("begin");
    assert!(matches!(
        db.get(&tx, "uid=alice,ou=users,dc=example,dc=com"),
        Err(DirError::NotFound(_))
    ));

    let mut tx = db.begin().expect("begin");
    assert!(matches!(
        db.delete(&mut tx, "uid=alice,ou=users,dc=example,dc=com"),
        Err(DirError::NotFound(_))
    ));
}

#[test]
fn duplicate_dn_put_acts_as_replace() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    for generation in 0..3 {
        let mut tx = db.begin().expect("begin");
        let entry = Entry::new("cn=config,dc=t").with_str("rev", &generation.to_string());
        db.put(&mut tx, &entry).expect("put");
        db.commit(&mut tx).expect("commit");
    }
    let tx = db.begin().expect("begin");
    let entry = db.get(&tx, "cn=config,dc=t").expect("get");
    assert_eq!(entry.values("rev").unwrap(), &[b"2".to_vec()]);
}

#[test]
fn closed_transaction_rejects_operations() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &alice()).expect("put");
    db.commit(&mut tx).expect("commit");
    assert!(matches!(db.get(&tx, "uid=x,dc=t"), Err(DirError::TxClosed)));
    assert!(matches!(db.commit(&mut tx), Err(DirError::TxClosed)));
    assert!(matches!(db.rollback(&mut tx), Err(DirError::TxClosed)));
}

#[test]
fn attribute_index_lifecycle_and_candidates() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    let mut tx = db.begin().expect("begin");
    for (uid, name) in [("alice", "Alice Smith"), ("bob", "Bob Smith"), ("carol", "Carol Jones")] {
        let entry = Entry::new(&format!("uid={uid},dc=t")).with_str("cn", name);
        db.put(&mut tx, &entry).expect("put");
    }
    db.commit(&mut tx).expect("commit");

    // Backfill existing entries at creation time.
    db.create_index("cn", IndexKind::Equality).expect("create equality");
    db.create_index("cn", IndexKind::Substring).expect("create substring");
    assert!(matches!(
        db.create_index("cn", IndexKind::Equality),
        Err(DirError::AlreadyExists(_))
    ));

    let tx = db.begin().expect("begin");
    let hits = db
        .index_candidates(&tx, "cn", IndexKind::Equality, b"alice smith")
        .expect("equality candidates");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].dn, "uid=alice,dc=t");

    let candidates = db
        .index_candidates(&tx, "cn", IndexKind::Substring, b"*smith*")
        .expect("substring candidates");
    let mut dns: Vec<&str> = candidates.iter().map(|e| e.dn.as_str()).collect();
    dns.sort();
    assert_eq!(dns, vec!["uid=alice,dc=t", "uid=bob,dc=t"]);

    // New writes flow into the index through the diff path.
    drop(tx);
    let mut tx = db.begin().expect("begin");
    let entry = Entry::new("uid=dave,dc=t").with_str("cn", "Dave Smith");
    db.put(&mut tx, &entry).expect("put");
    db.commit(&mut tx).expect("commit");
    let tx = db.begin().expect("begin");
    let candidates = db
        .index_candidates(&tx, "cn", IndexKind::Substring, b"*smith*")
        .expect("substring candidates");
    assert_eq!(candidates.len(), 3);

    db.drop_index("cn", IndexKind::Substring).expect("drop");
    assert!(matches!(
        db.index_candidates(&tx, "cn", IndexKind::Substring, b"*smith*"),
        Err(DirError::NotFound(_))
    ));
}

#[test]
fn compact_preserves_live_entries_and_reclaims_space() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    for i in 0..100u32 {
        let mut tx = db.begin().expect("begin");
        let entry = Entry::new(&format!("uid=u{i:03},dc=t")).with_str("n", &i.to_string());
        db.put(&mut tx, &entry).expect("put");
        db.commit(&mut tx).expect("commit");
    }
    // Churn: rewrite and delete half.
    for i in 0..50u32 {
        let mut tx = db.begin().expect("begin");
        db.delete(&mut tx, &format!("uid=u{i:03},dc=t")).expect("delete");
        db.commit(&mut tx).expect("commit");
    }

    let before = db.stats().expect("stats").pager.total_pages;
    db.compact().expect("compact");
    let after = db.stats().expect("stats").pager.total_pages;
    assert!(after <= before, "compaction must not grow the file");

    let tx = db.begin().expect("begin");
    for i in 50..100u32 {
        let entry = db.get(&tx, &format!("uid=u{i:03},dc=t")).expect("survivor");
        assert_eq!(entry.values("n").unwrap(), &[i.to_string().into_bytes()]);
    }
    for i in 0..50u32 {
        assert!(db.get(&tx, &format!("uid=u{i:03},dc=t")).is_err());
    }

    let report = db.verify_integrity().expect("verify");
    assert!(report.is_healthy(), "post-compaction store is healthy: {report:?}");
}

#[test]
fn stats_reflect_entries_and_transactions() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &alice()).expect("put");
    let stats = db.stats().expect("stats");
    assert_eq!(stats.active_transactions, 1);
    db.commit(&mut tx).expect("commit");
    let stats = db.stats().expect("stats");
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.active_transactions, 0);
    assert!(stats.pager.total_pages > 1);
}

#[test]
fn read_only_open_rejects_writers() {
    let dir = tempdir().expect("tmpdir");
    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &alice()).expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }
    let config = Config {
        read_only: true,
        ..Config::new(dir.path())
    };
    let db = DirectoryDB::open(config).expect("open read-only");
    let mut tx = db.begin().expect("begin");
    assert!(db.get(&tx, "uid=alice,ou=users,dc=example,dc=com").is_ok());
    assert!(matches!(db.put(&mut tx, &alice()), Err(DirError::ReadOnly)));
    assert!(matches!(db.compact(), Err(DirError::ReadOnly)));
}

#[test]
fn operations_after_close_report_closed() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    db.close().expect("close");
    assert!(matches!(db.begin(), Err(DirError::Closed)));
    assert!(matches!(db.stats(), Err(DirError::Closed)));
    db.close().expect("close is idempotent");
}
