//! Blocking windows, compaction and backups.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use custodian::MaintenanceState;

use crate::common::*;

#[test]
fn compact_twice_succeeds_and_never_grows() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    for i in 0..20 {
        access
            .write(move |txn| {
                insert_score(txn, "ivy", i);
                Ok(())
            })
            .unwrap();
    }
    let path = access.files().primary_path();

    assert!(access.compact().unwrap());
    let first = fs::metadata(&path).unwrap().len();
    assert!(access.compact().unwrap());
    let second = fs::metadata(&path).unwrap().len();
    assert!(second <= first);
    access.dispose();
}

#[test]
fn compact_refused_while_a_handle_is_open() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let handle = access.open_short_lived().unwrap();
    assert!(!access.compact().unwrap());
    drop(handle);
    assert!(access.compact().unwrap());
    access.dispose();
}

#[test]
fn block_times_out_while_another_thread_holds_a_handle() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let held = access.open_short_lived().unwrap();

    let err = access
        .run_on_owner(|access| access.block_all_operations("compact").map(drop))
        .unwrap_err();
    assert!(matches!(err, AccessError::MaintenanceTimeout { attempts, .. } if attempts > 1));

    // Best-effort restored
    assert_eq!(access.maintenance_state(), MaintenanceState::Idle);
    drop(held);
    access.run_on_owner(|access| access.read(|_| Ok(()))).unwrap();
    access.compact().unwrap();
    access.dispose();
}

#[test]
fn new_handles_wait_while_blocked() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);

    let guard = access
        .run_on_owner(|access| access.block_all_operations("upgrade"))
        .unwrap();
    assert_eq!(access.maintenance_state(), MaintenanceState::RunningCallerWork);

    let opened = Arc::new(AtomicUsize::new(0));
    let (reader, o) = (access.clone(), Arc::clone(&opened));
    let waiter = std::thread::spawn(move || {
        let count = score_count(&reader);
        o.fetch_add(1, Ordering::SeqCst);
        count
    });

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(opened.load(Ordering::SeqCst), 0);

    // Released off the owning thread: restore is marshalled and bounded
    guard.release().unwrap();
    assert_eq!(waiter.join().unwrap(), 0);
    assert_eq!(access.maintenance_state(), MaintenanceState::Idle);
    access.dispose();
}

#[test]
fn backup_requires_a_blocking_window() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    assert!(matches!(
        access.create_backup("client_manual.store"),
        Err(AccessError::BackupRequiresBlock)
    ));
    access.dispose();
}

#[test]
fn backup_inside_block_copies_primary_file() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    access
        .write(|txn| {
            insert_score(txn, "jo", 7);
            Ok(())
        })
        .unwrap();

    access
        .run_on_owner(|access| {
            access.block_all_operations_with("backup", |guard| {
                guard.access().create_backup("client_manual.store")
            })
        })
        .unwrap();

    let primary = fs::read(access.files().primary_path()).unwrap();
    let backup = fs::read(dir.path().join("client_manual.store")).unwrap();
    assert_eq!(primary, backup);
    access.dispose();
}

#[test]
fn every_subscription_redelivers_after_block() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    access
        .write(|txn| {
            insert_score(txn, "kim", 1);
            Ok(())
        })
        .unwrap();

    let initials: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::default()).collect();
    let subscriptions: Vec<_> = initials
        .iter()
        .map(|counter| {
            let counter = Arc::clone(counter);
            access
                .subscribe(Query::all("Score"), move |results: &ResultSet, changes: Option<&ChangeSet>| {
                    if changes.is_none() && !results.is_empty() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap()
        })
        .collect();
    flush_owner(&access);
    assert!(initials.iter().all(|c| c.load(Ordering::SeqCst) == 1));

    access
        .run_on_owner(|access| access.block_all_operations("compact")?.release())
        .unwrap();
    flush_owner(&access);

    assert!(initials.iter().all(|c| c.load(Ordering::SeqCst) == 2));
    assert_eq!(access.stats().unwrap().subscriptions, 3);
    drop(subscriptions);
    access.dispose();
}

#[test]
fn subscription_added_during_block_registers_on_release() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let calls = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&calls);
    let subscription = access
        .run_on_owner(move |access| {
            let guard = access.block_all_operations("compact")?;
            let subscription = access.subscribe(Query::all("Score"), move |_: &ResultSet, _: Option<&ChangeSet>| {
                c.fetch_add(1, Ordering::SeqCst);
            })?;
            guard.release()?;
            Ok(subscription)
        })
        .unwrap();
    flush_owner(&access);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(subscription);
    access.dispose();
}

#[test]
fn nested_block_on_the_same_thread_fails_fast() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let err = access
        .run_on_owner(|access| {
            let _outer = access.block_all_operations("outer")?;
            Ok(access.block_all_operations("inner").err())
        })
        .unwrap()
        .unwrap();
    assert!(matches!(err, AccessError::OperationsBlocked(_)));
    access.dispose();
}

#[test]
fn release_off_thread_times_out_while_owner_is_busy() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = AccessConfig {
        restore_timeout_ms: 100,
        ..fast_config(dir.path())
    };
    let access = StoreAccess::builder(config)
        .schema(scores_schema(1))
        .open()
        .unwrap();

    let guard = access
        .run_on_owner(|access| access.block_all_operations("busy owner"))
        .unwrap();

    // Keep the owning thread occupied so the restore job cannot run
    let busy = Arc::new(AtomicBool::new(true));
    let b = Arc::clone(&busy);
    access
        .post_to_owner(move |_| {
            while b.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

    let err = guard.release().unwrap_err();
    assert!(matches!(err, AccessError::RestoreTimeout(t) if t == Duration::from_millis(100)));

    // The gate is released regardless
    assert_eq!(access.maintenance_state(), MaintenanceState::Idle);
    drop(access.open_short_lived().unwrap());

    // The queued restore still runs once the owner frees up
    busy.store(false, Ordering::SeqCst);
    flush_owner(&access);
    access.run_on_owner(|access| access.read(|_| Ok(()))).unwrap();
    access.dispose();
}
