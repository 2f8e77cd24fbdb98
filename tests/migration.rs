//! Migration tests against the durable backend.
//!
//! The memory-backend behavior is covered in the crate's unit tests; these
//! verify the properties that matter operationally: idempotence across
//! process restarts, sequence continuity, and resolvability of migrated
//! subjects.

use anshin::db::{CaseDb, CaseDbConfig};
use anshin::resolve::MatchType;
use anshin::subject::{LegacyClient, NewSubject};

fn persistent_db(dir: &std::path::Path) -> CaseDb {
    CaseDb::new(CaseDbConfig {
        data_dir: Some(dir.to_path_buf()),
        ..Default::default()
    })
    .unwrap()
}

fn legacy(name: &str, dob: &str) -> LegacyClient {
    LegacyClient {
        name: name.to_string(),
        dob: Some(dob.to_string()),
        ..Default::default()
    }
}

#[test]
fn migration_is_idempotent_across_reopens() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let db = persistent_db(dir.path());
        db.import_legacy(legacy("山田健太", "1990-01-15")).unwrap();
        db.import_legacy(legacy("佐々木真理", "1985-03-02")).unwrap();
        db.import_legacy(legacy("鈴木一郎", "1978-11-30")).unwrap();

        let report = db.run_migration().unwrap();
        assert_eq!(report.migrated, 3);
        assert!(report.errors.is_empty());
        assert_eq!(db.info().unwrap().identity_count, 3);
    }

    // A second run in a fresh process finds nothing to do.
    let db = persistent_db(dir.path());
    let report = db.run_migration().unwrap();
    assert_eq!(report.migrated, 0);
    assert_eq!(report.repaired, 0);
    assert_eq!(db.info().unwrap().identity_count, 3);
    assert_eq!(db.info().unwrap().unmigrated_count, 0);
}

#[test]
fn migrated_subjects_resolve_like_registered_ones() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = persistent_db(dir.path());
    db.import_legacy(legacy("山田健太", "1990-01-15")).unwrap();
    db.run_migration().unwrap();

    let resolution = db.resolve("山田さん").unwrap();
    assert_eq!(resolution.match_type, MatchType::Fuzzy);
    assert_eq!(resolution.suggested_name.as_deref(), Some("山田健太"));

    let exact = db.resolve("山田健太").unwrap();
    assert_eq!(exact.match_type, MatchType::Exact);
    let view = exact.subject.unwrap();
    assert_eq!(view.dob.as_deref(), Some("1990-01-15"));
    assert_eq!(view.display_code.to_string(), "A-001");
}

#[test]
fn registrations_after_migration_continue_the_sequence() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = persistent_db(dir.path());
    db.import_legacy(legacy("山田健太", "1990-01-15")).unwrap();
    db.import_legacy(legacy("佐々木真理", "1985-03-02")).unwrap();
    db.run_migration().unwrap();

    let view = db
        .create_subject_with_identity(NewSubject {
            name: "鈴木一郎".into(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(view.display_code.to_string(), "A-003");
}

#[test]
fn interleaved_imports_are_picked_up_by_the_next_run() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = persistent_db(dir.path());
    db.import_legacy(legacy("山田健太", "1990-01-15")).unwrap();
    assert_eq!(db.run_migration().unwrap().migrated, 1);

    // Data imported after the first run stays legacy until the next one.
    db.import_legacy(legacy("佐々木真理", "1985-03-02")).unwrap();
    assert_eq!(db.info().unwrap().unmigrated_count, 1);

    let report = db.run_migration().unwrap();
    assert_eq!(report.migrated, 1);
    assert_eq!(db.info().unwrap().unmigrated_count, 0);

    // Codes were assigned in import order without reuse.
    let first = db.resolve("山田健太").unwrap().subject.unwrap();
    let second = db.resolve("佐々木真理").unwrap().subject.unwrap();
    assert_eq!(first.display_code.to_string(), "A-001");
    assert_eq!(second.display_code.to_string(), "A-002");
}
