//! End-to-end vault file scenarios: create/reopen and atomic saves.

use localpdub_core::paths::VaultPaths;
use localpdub_core::{Record, Session, VaultError};

#[test]
fn test_create_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v.lpd");

    let mut session = Session::create(&path, "hunter22").unwrap();
    let mut record = Record::new("x");
    record.username = "u".to_string();
    record.password = "p".to_string();
    session.store().add(record).unwrap();
    session.save().unwrap();
    session.close();

    let reopened = Session::open(&path, "hunter22").unwrap();
    let records = reopened.store().list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].title, "x");
    assert_eq!(records[0].username, "u");

    assert!(matches!(
        Session::open(&path, "wrong"),
        Err(VaultError::InvalidPassword)
    ));
}

#[test]
fn test_interrupted_save_leaves_prior_content_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v.lpd");
    let paths = VaultPaths::at(&path);

    let mut session = Session::create(&path, "hunter22").unwrap();
    session.store().add(Record::new("survivor")).unwrap();
    session.save().unwrap();
    session.close();

    // A save that dies after writing ciphertext but before the rename
    // leaves only a partial temp file behind; it must never be read.
    std::fs::write(paths.tmp_path(), b"").unwrap();

    let reopened = Session::open(&path, "hunter22").unwrap();
    let records = reopened.store().list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].title, "survivor");
}

#[test]
fn test_backup_allows_one_rollback_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v.lpd");
    let paths = VaultPaths::at(&path);

    let session = Session::create(&path, "hunter22").unwrap();
    session.store().add(Record::new("first")).unwrap();
    session.save().unwrap();
    let first_save = std::fs::read(&path).unwrap();

    session.store().add(Record::new("second")).unwrap();
    session.save().unwrap();

    assert_eq!(std::fs::read(paths.bak_path()).unwrap(), first_save);
    assert_ne!(std::fs::read(&path).unwrap(), first_save);
}
