use obelisk::{
    backup_full, backup_incremental, restore, verify, BackupKind, Config, DirError, DirectoryDB,
    Entry, Scope,
};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use tempfile::tempdir;

const FULL_HEADER_LEN: u64 = 64;

fn populate(db: &DirectoryDB, start: u32, count: u32) {
    let mut tx = db.begin().expect("begin");
    for i in start..start + count {
        let entry = Entry::new(&format!("uid=u{i:04},dc=t")).with_str("n", &i.to_string());
        db.put(&mut tx, &entry).expect("put");
    }
    db.commit(&mut tx).expect("commit");
}

fn all_dns(db: &DirectoryDB) -> Vec<String> {
    let tx = db.begin().expect("begin");
    db.search_by_dn(&tx, "dc=t", Scope::Subtree)
        .expect("search")
        .map(|e| e.expect("entry").dn)
        .collect()
}

#[test]
fn full_backup_verify_and_restore() {
    let source_dir = tempdir().expect("source dir");
    let backup_dir = tempdir().expect("backup dir");
    let restore_dir = tempdir().expect("restore dir");

    let db = DirectoryDB::open(Config::new(source_dir.path())).expect("open");
    populate(&db, 0, 256);

    let archive = backup_dir.path().join("full-001.oba");
    let report = backup_full(&db, &archive, false).expect("full backup");
    assert_eq!(report.kind, BackupKind::Full);
    assert!(report.pages > 1);
    assert!(report.duration.as_nanos() > 0);

    assert_eq!(verify(&archive).expect("verify"), BackupKind::Full);

    restore(&archive, &[], restore_dir.path()).expect("restore");
    let restored = DirectoryDB::open(Config::new(restore_dir.path())).expect("open restored");
    let dns = all_dns(&restored);
    assert_eq!(dns.len(), 256);
    let tx = restored.begin().expect("begin");
    let entry = restored.get(&tx, "uid=u0100,dc=t").expect("get restored");
    assert_eq!(entry.values("n").unwrap(), &[b"100".to_vec()]);
}

#[test]
fn flipped_byte_fails_verification() {
    let source_dir = tempdir().expect("source dir");
    let backup_dir = tempdir().expect("backup dir");

    let db = DirectoryDB::open(Config::new(source_dir.path())).expect("open");
    populate(&db, 0, 64);
    let archive = backup_dir.path().join("full.oba");
    backup_full(&db, &archive, false).expect("backup");

    // Flip one payload byte at header_size + 50.
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&archive)
        .expect("open archive");
    file.seek(SeekFrom::Start(FULL_HEADER_LEN + 50)).expect("seek");
    let mut byte = [0u8; 1];
    use std::io::Read;
    file.read_exact(&mut byte).expect("read");
    file.seek(SeekFrom::Start(FULL_HEADER_LEN + 50)).expect("seek back");
    file.write_all(&[byte[0] ^ 0xFF]).expect("flip");

    assert!(matches!(
        verify(&archive),
        Err(DirError::ChecksumMismatch(_))
    ));
}

#[test]
fn incremental_chain_restores_to_latest_state() {
    let source_dir = tempdir().expect("source dir");
    let backup_dir = tempdir().expect("backup dir");
    let restore_dir = tempdir().expect("restore dir");

    let db = DirectoryDB::open(Config::new(source_dir.path())).expect("open");
    populate(&db, 0, 100);
    let full = backup_dir.path().join("full.oba");
    backup_full(&db, &full, false).expect("full backup");

    // Delta 1: new entries and an update.
    populate(&db, 100, 50);
    {
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=u0000,dc=t").with_str("n", "updated"))
            .expect("update");
        db.commit(&mut tx).expect("commit");
    }
    let inc1 = backup_dir.path().join("inc-001.oba");
    let report = backup_incremental(&db, &inc1, false).expect("incremental 1");
    assert_eq!(report.kind, BackupKind::Incremental);
    assert!(report.pages > 0);

    // Delta 2: a deletion.
    {
        let mut tx = db.begin().expect("begin");
        db.delete(&mut tx, "uid=u0001,dc=t").expect("delete");
        db.commit(&mut tx).expect("commit");
    }
    let inc2 = backup_dir.path().join("inc-002.oba");
    backup_incremental(&db, &inc2, false).expect("incremental 2");

    verify(&inc1).expect("verify inc1");
    verify(&inc2).expect("verify inc2");

    restore(&full, &[inc1, inc2], restore_dir.path()).expect("restore chain");
    let restored = DirectoryDB::open(Config::new(restore_dir.path())).expect("open restored");

    let source_dns = all_dns(&db);
    let restored_dns = all_dns(&restored);
    assert_eq!(source_dns, restored_dns, "restored state equals the source");
    assert_eq!(restored_dns.len(), 149);

    let tx = restored.begin().expect("begin");
    let entry = restored.get(&tx, "uid=u0000,dc=t").expect("updated entry");
    assert_eq!(entry.values("n").unwrap(), &[b"updated".to_vec()]);
    assert!(matches!(
        restored.get(&tx, "uid=u0001,dc=t"),
        Err(DirError::NotFound(_))
    ));
}

#[test]
fn incremental_without_changes_captures_zero_pages() {
    let source_dir = tempdir().expect("source dir");
    let backup_dir = tempdir().expect("backup dir");

    let db = DirectoryDB::open(Config::new(source_dir.path())).expect("open");
    populate(&db, 0, 16);
    backup_full(&db, &backup_dir.path().join("full.oba"), false).expect("full");

    let inc = backup_dir.path().join("inc-empty.oba");
    let report = backup_incremental(&db, &inc, false).expect("empty incremental");
    assert_eq!(report.pages, 0, "nothing changed since the base");
    assert!(report.duration.as_nanos() > 0);
    verify(&inc).expect("empty incremental verifies");
}

#[test]
fn incremental_without_base_is_rejected() {
    let source_dir = tempdir().expect("source dir");
    let backup_dir = tempdir().expect("backup dir");
    let db = DirectoryDB::open(Config::new(source_dir.path())).expect("open");
    populate(&db, 0, 4);
    assert!(matches!(
        backup_incremental(&db, &backup_dir.path().join("inc.oba"), false),
        Err(DirError::NotFound(_))
    ));
}

#[test]
fn compressed_backups_roundtrip() {
    let source_dir = tempdir().expect("source dir");
    let backup_dir = tempdir().expect("backup dir");
    let restore_dir = tempdir().expect("restore dir");

    let db = DirectoryDB::open(Config::new(source_dir.path())).expect("open");
    populate(&db, 0, 200);

    let full = backup_dir.path().join("full-z.oba");
    let report = backup_full(&db, &full, true).expect("compressed full");
    verify(&full).expect("verify compressed");

    // Page images are repetitive; compression should pay for itself.
    let raw_size = {
        let stats = db.stats().expect("stats");
        stats.pager.total_pages * 4096
    };
    assert!(report.bytes_written < raw_size);

    populate(&db, 200, 30);
    let inc = backup_dir.path().join("inc-z.oba");
    backup_incremental(&db, &inc, true).expect("compressed incremental");
    verify(&inc).expect("verify compressed incremental");

    restore(&full, &[inc], restore_dir.path()).expect("restore compressed chain");
    let restored = DirectoryDB::open(Config::new(restore_dir.path())).expect("open restored");
    assert_eq!(all_dns(&restored).len(), 230);
}

#[test]
fn garbage_file_is_unsupported() {
    let dir = tempdir().expect("tmpdir");
    let path: PathBuf = dir.path().join("not-a-backup.oba");
    std::fs::write(&path, b"definitely not an archive").expect("write");
    assert!(matches!(verify(&path), Err(DirError::UnsupportedFormat(_))));
}

#[test]
fn backup_does_not_mutate_source() {
    let source_dir = tempdir().expect("source dir");
    let backup_dir = tempdir().expect("backup dir");

    let db = DirectoryDB::open(Config::new(source_dir.path())).expect("open");
    populate(&db, 0, 32);
    let before = all_dns(&db);
    backup_full(&db, &backup_dir.path().join("full.oba"), false).expect("full");
    backup_incremental(&db, &backup_dir.path().join("inc.oba"), true).expect("incremental");
    assert_eq!(all_dns(&db), before);
    let report = db.verify_integrity().expect("verify");
    assert!(report.is_healthy());
}
