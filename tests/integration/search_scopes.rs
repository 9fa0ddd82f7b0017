use obelisk::{Config, DirectoryDB, Entry, Scope};
use tempfile::tempdir;

fn populate_flat(db: &DirectoryDB, count: u32) {
    let mut tx = db.begin().expect("begin");
    for i in 0..count {
        let entry = Entry::new(&format!("uid=u{i:04},dc=t")).with_str("n", &i.to_string());
        db.put(&mut tx, &entry).expect("put");
    }
    db.commit(&mut tx).expect("commit");
}

#[test]
fn subtree_search_returns_all_children_in_order() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    populate_flat(&db, 1024);

    let tx = db.begin().expect("begin");
    let mut dns = Vec::new();
    for entry in db.search_by_dn(&tx, "dc=t", Scope::Subtree).expect("search") {
        dns.push(entry.expect("entry").dn);
    }
    assert_eq!(dns.len(), 1024);
    let mut sorted = dns.clone();
    sorted.sort();
    assert_eq!(dns, sorted, "subtree yields ascending DN order");
    assert_eq!(dns[0], "uid=u0000,dc=t");
    assert_eq!(dns[1023], "uid=u1023,dc=t");
}

#[test]
fn one_level_search_counts_direct_children() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    populate_flat(&db, 1024);

    let tx = db.begin().expect("begin");
    let count = db
        .search_by_dn(&tx, "dc=t", Scope::OneLevel)
        .expect("search")
        .count();
    assert_eq!(count, 1024, "all entries are direct children of dc=t");
    assert!(db.has_children(&tx, "dc=t").expect("has_children"));
}

#[test]
fn base_scope_yields_the_entry_itself() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("ou=users,dc=t").with_str("ou", "users"))
        .expect("put");
    db.put(&mut tx, &Entry::new("uid=a,ou=users,dc=t").with_str("cn", "A"))
        .expect("put");
    db.commit(&mut tx).expect("commit");

    let tx = db.begin().expect("begin");
    let hits: Vec<_> = db
        .search_by_dn(&tx, "ou=users,dc=t", Scope::Base)
        .expect("search")
        .collect::<Result<_, _>>()
        .expect("entries");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].dn, "ou=users,dc=t");

    // Base scope of an absent DN is an empty stream.
    let count = db
        .search_by_dn(&tx, "ou=ghost,dc=t", Scope::Base)
        .expect("search")
        .count();
    assert_eq!(count, 0);
}

#[test]
fn one_level_excludes_grandchildren() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    let mut tx = db.begin().expect("begin");
    for dn in [
        "ou=users,dc=t",
        "uid=a,ou=users,dc=t",
        "uid=b,ou=users,dc=t",
        "ou=groups,dc=t",
        "cn=admins,ou=groups,dc=t",
    ] {
        db.put(&mut tx, &Entry::new(dn).with_str("x", "1")).expect("put");
    }
    db.commit(&mut tx).expect("commit");

    let tx = db.begin().expect("begin");
    let dns: Vec<String> = db
        .search_by_dn(&tx, "dc=t", Scope::OneLevel)
        .expect("search")
        .map(|e| e.expect("entry").dn)
        .collect();
    assert_eq!(dns, vec!["ou=groups,dc=t", "ou=users,dc=t"]);

    let dns: Vec<String> = db
        .search_by_dn(&tx, "ou=users,dc=t", Scope::Subtree)
        .expect("search")
        .map(|e| e.expect("entry").dn)
        .collect();
    assert_eq!(
        dns,
        vec!["ou=users,dc=t", "uid=a,ou=users,dc=t", "uid=b,ou=users,dc=t"]
    );
}

#[test]
fn filter_search_applies_matcher() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");

    let mut tx = db.begin().expect("begin");
    for (uid, dept) in [("a", "eng"), ("b", "sales"), ("c", "eng")] {
        let entry = Entry::new(&format!("uid={uid},dc=t")).with_str("dept", dept);
        db.put(&mut tx, &entry).expect("put");
    }
    db.commit(&mut tx).expect("commit");

    let tx = db.begin().expect("begin");
    let hits: Vec<String> = db
        .search_by_filter(&tx, "dc=t", |entry: &Entry| {
            entry.values("dept").map(|v| v[0] == b"eng").unwrap_or(false)
        })
        .expect("search")
        .map(|e| e.expect("entry").dn)
        .collect();
    assert_eq!(hits, vec!["uid=a,dc=t", "uid=c,dc=t"]);
}

#[test]
fn cancelled_search_ends_early() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    populate_flat(&db, 64);

    let tx = db.begin().expect("begin");
    let mut iter = db.search_by_dn(&tx, "dc=t", Scope::Subtree).expect("search");
    assert!(iter.next_entry().expect("first").is_some());
    iter.cancel_flag()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(iter.next_entry().expect("cancelled").is_none());
    iter.close();
    assert!(iter.next_entry().expect("closed").is_none());
}

#[test]
fn deleted_entries_are_skipped_by_search() {
    let dir = tempdir().expect("tmpdir");
    let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
    populate_flat(&db, 10);

    let mut tx = db.begin().expect("begin");
    db.delete(&mut tx, "uid=u0004,dc=t").expect("delete");
    db.commit(&mut tx).expect("commit");

    let tx = db.begin().expect("begin");
    let dns: Vec<String> = db
        .search_by_dn(&tx, "dc=t", Scope::Subtree)
        .expect("search")
        .map(|e| e.expect("entry").dn)
        .collect();
    assert_eq!(dns.len(), 9);
    assert!(!dns.contains(&"uid=u0004,dc=t".to_string()));
}
