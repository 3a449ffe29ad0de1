//! First-access recovery: corrupt files, files from newer schemas,
//! versioned filenames and migrations.

use std::fs;
use std::path::Path;

use custodian::{MigrationContext, SchemaVersion};

use crate::common::*;

fn users(access: &StoreAccess) -> Vec<String> {
    access
        .read(|h| {
            let results = h.query(&Query::all("Score"))?;
            Ok(results
                .iter()
                .filter_map(|r| r.field("user").and_then(|u| u.as_str()).map(str::to_string))
                .collect())
        })
        .unwrap()
}

fn seed(dir: &Path, version: u64, user: &str) {
    let access = open_scores(dir, version);
    let user = user.to_string();
    access
        .write(move |txn| {
            insert_score(txn, &user, 1);
            Ok(())
        })
        .unwrap();
    access.dispose();
}

#[test]
fn corrupt_primary_is_backed_up_and_replaced() {
    let dir = TempDir::new().unwrap();
    let garbage = b"this is definitely not a store file header".to_vec();
    fs::write(dir.path().join("client.store"), &garbage).unwrap();

    let access = open_scores(dir.path(), 1);
    assert_eq!(score_count(&access), 0);

    let backups = files_containing(dir.path(), "_corrupt");
    assert_eq!(backups.len(), 1, "backups: {:?}", backups);
    assert_eq!(fs::read(dir.path().join(&backups[0])).unwrap(), garbage);

    // The fresh store is usable
    access
        .write(|txn| {
            insert_score(txn, "lena", 1);
            Ok(())
        })
        .unwrap();
    assert_eq!(score_count(&access), 1);
    access.dispose();
}

#[test]
fn corrupt_again_within_the_same_second_still_opens() {
    let dir = TempDir::new().unwrap();
    let first = b"first run left this behind".to_vec();
    let second = b"and the restart left this".to_vec();

    fs::write(dir.path().join("client.store"), &first).unwrap();
    open_scores(dir.path(), 1).dispose();
    fs::write(dir.path().join("client.store"), &second).unwrap();
    let access = open_scores(dir.path(), 1);
    assert_eq!(score_count(&access), 0);
    access.dispose();

    let backups = files_containing(dir.path(), "_corrupt");
    assert_eq!(backups.len(), 2, "backups: {:?}", backups);
    let mut contents: Vec<Vec<u8>> = backups
        .iter()
        .map(|name| fs::read(dir.path().join(name)).unwrap())
        .collect();
    contents.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(contents, expected);
}

#[test]
fn torn_final_write_keeps_committed_records() {
    let dir = TempDir::new().unwrap();
    seed(dir.path(), 1, "alice");
    seed(dir.path(), 1, "bob");

    // A crash mid-append leaves a partial frame behind
    let path = dir.path().join("client.store");
    let mut bytes = fs::read(&path).unwrap();
    let intact = bytes.len();
    bytes.extend_from_slice(&[9, 0, 0]);
    fs::write(&path, &bytes).unwrap();

    let access = open_scores(dir.path(), 1);
    let mut seen = users(&access);
    seen.sort();
    assert_eq!(seen, vec!["alice".to_string(), "bob".to_string()]);
    assert!(files_containing(dir.path(), "_corrupt").is_empty());
    access.dispose();

    assert_eq!(fs::metadata(&path).unwrap().len(), intact as u64);
}

#[test]
fn truncated_header_is_treated_as_corruption() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("client.store"), b"CSTD").unwrap();

    let access = open_scores(dir.path(), 1);
    assert_eq!(score_count(&access), 0);
    assert_eq!(files_containing(dir.path(), "_corrupt").len(), 1);
    access.dispose();
}

#[test]
fn schema_too_new_keeps_a_copy_and_starts_fresh() {
    let dir = TempDir::new().unwrap();
    seed(dir.path(), 3, "future");
    let newer_bytes = fs::read(dir.path().join("client.store")).unwrap();

    let access = open_scores(dir.path(), 2);
    assert_eq!(score_count(&access), 0);
    assert_eq!(
        fs::read(dir.path().join("client_newer_version.store")).unwrap(),
        newer_bytes
    );
    access.dispose();
}

#[test]
fn newer_version_file_replaces_primary_once_readable() {
    let dir = TempDir::new().unwrap();

    // A file written at schema 2, parked by an earlier downgrade
    seed(dir.path(), 2, "newer");
    fs::rename(
        dir.path().join("client.store"),
        dir.path().join("client_newer_version.store"),
    )
    .unwrap();
    let parked = fs::read(dir.path().join("client_newer_version.store")).unwrap();

    // The downgraded release kept writing to a fresh primary
    seed(dir.path(), 1, "older");
    let older = fs::read(dir.path().join("client.store")).unwrap();

    // Upgrading again recovers the parked file
    let access = open_scores(dir.path(), 2);
    assert_eq!(users(&access), vec!["newer".to_string()]);
    assert!(!dir.path().join("client_newer_version.store").exists());
    access.dispose();

    assert_eq!(fs::read(dir.path().join("client.store")).unwrap(), parked);
    let before = files_containing(dir.path(), "_newer_version_before_recovery");
    assert_eq!(before.len(), 1, "backups: {:?}", before);
    assert_eq!(fs::read(dir.path().join(&before[0])).unwrap(), older);
}

#[test]
fn recovery_is_abandoned_while_newer_file_stays_unreadable() {
    let dir = TempDir::new().unwrap();
    seed(dir.path(), 3, "future");
    fs::rename(
        dir.path().join("client.store"),
        dir.path().join("client_newer_version.store"),
    )
    .unwrap();
    seed(dir.path(), 1, "current");

    let access = open_scores(dir.path(), 2);
    assert_eq!(users(&access), vec!["current".to_string()]);
    assert!(dir.path().join("client_newer_version.store").exists());
    assert!(files_containing(dir.path(), "_before_recovery").is_empty());
    access.dispose();
}

#[test]
fn versioned_filename_copies_previous_version() {
    let dir = TempDir::new().unwrap();
    let config = |dir: &Path| AccessConfig {
        versioned_filename: true,
        ..fast_config(dir)
    };

    let first = StoreAccess::builder(config(dir.path()))
        .schema(scores_schema(1))
        .open()
        .unwrap();
    first
        .write(|txn| {
            insert_score(txn, "mo", 1);
            Ok(())
        })
        .unwrap();
    assert_eq!(first.files().filename(), "client_1.store");
    first.dispose();

    let second = StoreAccess::builder(config(dir.path()))
        .schema(scores_schema(2))
        .open()
        .unwrap();
    assert_eq!(second.files().filename(), "client_2.store");
    assert_eq!(users(&second), vec!["mo".to_string()]);
    second.dispose();

    // The previous version's file is left alone
    assert!(dir.path().join("client_1.store").exists());
}

#[test]
fn migrations_run_in_order_on_an_older_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed(dir.path(), 1, "nia");

    let access = StoreAccess::builder(fast_config(dir.path()))
        .schema(Schema::new(3, ["Score", "Tally"]))
        .migration(2, |ctx: &mut dyn MigrationContext, version: SchemaVersion| {
            for record in ctx.records("Score") {
                let mut fields = record.fields.clone();
                fields["migrated_to"] = json!(version.as_u64());
                ctx.update(record.id, fields)?;
            }
            Ok(())
        })
        .migration(3, |ctx: &mut dyn MigrationContext, _: SchemaVersion| {
            ctx.rename_kind("Score", "Tally");
            Ok(())
        })
        .open()
        .unwrap();

    let tallies = access
        .read(|h| Ok(h.query(&Query::all("Tally"))?))
        .unwrap();
    assert_eq!(tallies.len(), 1);
    let record = tallies.iter().next().unwrap();
    assert_eq!(record.field("migrated_to"), Some(&json!(2)));
    assert_eq!(score_count(&access), 0);
    access.dispose();
}
