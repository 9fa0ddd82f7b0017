use obelisk::{Config, DirError, DirectoryDB, Entry, Scope};
use tempfile::tempdir;

const KEY_A: [u8; 32] = [0xA1; 32];
const KEY_B: [u8; 32] = [0xB2; 32];

fn encrypted_config(dir: &std::path::Path, key: [u8; 32]) -> Config {
    Config {
        encryption_key: Some(key),
        ..Config::new(dir)
    }
}

#[test]
fn encrypted_store_roundtrips_with_the_right_key() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(encrypted_config(dir.path(), KEY_A)).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(
            &mut tx,
            &Entry::new("uid=secret,dc=t").with_str("cn", "ClassifiedName"),
        )
        .expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }

    let db = DirectoryDB::open(encrypted_config(dir.path(), KEY_A)).expect("reopen");
    let tx = db.begin().expect("begin");
    let entry = db.get(&tx, "uid=secret,dc=t").expect("get");
    assert_eq!(entry.values("cn").unwrap(), &[b"ClassifiedName".to_vec()]);
}

#[test]
fn wrong_key_fails_decryption() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(encrypted_config(dir.path(), KEY_A)).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(&mut tx, &Entry::new("uid=s,dc=t").with_str("cn", "S")).expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }

    match DirectoryDB::open(encrypted_config(dir.path(), KEY_B)) {
        Err(DirError::ChecksumMismatch(_)) => {}
        Err(other) => panic!("expected authentication failure, got {other:?}"),
        Ok(_) => panic!("wrong key must not open the store"),
    }
}

#[test]
fn plaintext_does_not_reach_disk() {
    let dir = tempdir().expect("tmpdir");
    let marker = b"VisibleOnlyInMemory";

    {
        let db = DirectoryDB::open(encrypted_config(dir.path(), KEY_A)).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(
            &mut tx,
            &Entry::new("uid=m,dc=t").with_str("cn", std::str::from_utf8(marker).unwrap()),
        )
        .expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }

    for name in ["directory.oba", "directory.oba.wal"] {
        let path = dir.path().join(name);
        if !path.exists() {
            continue;
        }
        let bytes = std::fs::read(&path).expect("read file");
        let leaked = bytes
            .windows(marker.len())
            .any(|window| window == marker);
        assert!(!leaked, "{name} leaks plaintext attribute bytes");
    }
}

#[test]
fn unencrypted_store_does_leave_plaintext() {
    // Sanity check for the scan above: without a key the same marker is
    // findable on disk.
    let dir = tempdir().expect("tmpdir");
    let marker = b"VisibleOnlyInMemory";

    {
        let db = DirectoryDB::open(Config::new(dir.path())).expect("open");
        let mut tx = db.begin().expect("begin");
        db.put(
            &mut tx,
            &Entry::new("uid=m,dc=t").with_str("cn", std::str::from_utf8(marker).unwrap()),
        )
        .expect("put");
        db.commit(&mut tx).expect("commit");
        db.close().expect("close");
    }

    let bytes = std::fs::read(dir.path().join("directory.oba")).expect("read file");
    assert!(bytes.windows(marker.len()).any(|w| w == marker));
}

#[test]
fn key_rotation_reencrypts_the_store() {
    let dir = tempdir().expect("tmpdir");

    {
        let db = DirectoryDB::open(encrypted_config(dir.path(), KEY_A)).expect("open");
        let mut tx = db.begin().expect("begin");
        for i in 0..20u32 {
            db.put(
                &mut tx,
                &Entry::new(&format!("uid=k{i},dc=t")).with_str("n", &i.to_string()),
            )
            .expect("put");
        }
        db.commit(&mut tx).expect("commit");

        db.rotate_encryption_key(&KEY_B).expect("rotate");

        // The handle keeps working under the new key.
        let tx = db.begin().expect("begin");
        let count = db
            .search_by_dn(&tx, "dc=t", Scope::Subtree)
            .expect("search")
            .count();
        assert_eq!(count, 20);
        drop(tx);
        db.close().expect("close");
    }

    // Only the new key opens the store now.
    assert!(DirectoryDB::open(encrypted_config(dir.path(), KEY_A)).is_err());
    let db = DirectoryDB::open(encrypted_config(dir.path(), KEY_B)).expect("open with new key");
    let tx = db.begin().expect("begin");
    assert!(db.get(&tx, "uid=k7,dc=t").is_ok());
}

#[test]
fn key_file_is_accepted() {
    let dir = tempdir().expect("tmpdir");
    let key_path = dir.path().join("store.key");
    std::fs::write(&key_path, KEY_A).expect("write key file");

    let config = Config {
        encryption_key_file: Some(key_path),
        ..Config::new(dir.path().join("data"))
    };
    let db = DirectoryDB::open(config.clone()).expect("open with key file");
    let mut tx = db.begin().expect("begin");
    db.put(&mut tx, &Entry::new("uid=f,dc=t").with_str("cn", "F")).expect("put");
    db.commit(&mut tx).expect("commit");
    db.close().expect("close");

    let db = DirectoryDB::open(config).expect("reopen with key file");
    let tx = db.begin().expect("begin");
    assert!(db.get(&tx, "uid=f,dc=t").is_ok());
}
