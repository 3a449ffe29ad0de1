//! Thread affinity, reentrancy and asynchronous dispatch rules.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use custodian::{AsyncOperation, CancellationToken, MaintenanceState, StoreHandle};
use parking_lot::Mutex;

use crate::common::*;

#[test]
fn async_calls_off_the_owning_thread_are_refused() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);

    let err = access.read_async(|_| Ok(())).err().unwrap();
    assert!(matches!(err, AccessError::WrongThread { operation: "read_async" }));
    assert!(err.is_programming_error());

    let err = access.write_async(|_| Ok(())).err().unwrap();
    assert!(matches!(err, AccessError::WrongThread { operation: "write_async" }));
    assert_eq!(access.pending_operations(), 0);
    access.dispose();
}

#[test]
fn block_all_operations_off_the_owning_thread_is_refused() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let err = access.block_all_operations("test").err().unwrap();
    assert!(matches!(
        err,
        AccessError::WrongThread {
            operation: "block_all_operations"
        }
    ));
    access.dispose();
}

#[test]
fn owning_handle_from_reset_callback_raises_reentrancy() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let outcome: Arc<Mutex<Option<String>>> = Arc::default();

    let cb_access = access.clone();
    let cb_outcome = Arc::clone(&outcome);
    let subscription = access
        .subscribe(Query::all("Score"), move |results: &ResultSet, changes: Option<&ChangeSet>| {
            // Only the reset delivery: empty with no change set while blocked
            let blocked = cb_access.maintenance_state() != MaintenanceState::Idle;
            if results.is_empty() && changes.is_none() && blocked {
                let result = cb_access.owning_handle().map(|_| ());
                *cb_outcome.lock() = Some(format!("{:?}", result));
            }
        })
        .unwrap();
    flush_owner(&access);

    access
        .run_on_owner(|access| access.block_all_operations("reentrancy")?.release())
        .unwrap();

    let seen = outcome.lock().clone().unwrap();
    assert!(seen.contains("Reentrancy"), "got {}", seen);

    drop(subscription);
    access.dispose();
}

#[test]
fn owning_handle_inside_block_reports_operations_blocked() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);

    let err = access
        .run_on_owner(|access| {
            let _guard = access.block_all_operations("upgrade")?;
            Ok(access.read(|_| Ok(())).err())
        })
        .unwrap()
        .unwrap();
    assert!(matches!(err, AccessError::OperationsBlocked(ref reason) if reason == "upgrade"));

    // Restored afterwards
    access.run_on_owner(|access| access.read(|_| Ok(()))).unwrap();
    access.dispose();
}

#[test]
fn cancelled_before_start_resolves_cancelled_and_clears_pending() {
    let dir = TempDir::new().unwrap();
    let config = AccessConfig {
        async_workers: 1,
        ..fast_config(dir.path())
    };
    let access = StoreAccess::builder(config)
        .schema(scores_schema(1))
        .open()
        .unwrap();

    // Occupy the only worker so the second operation cannot start yet
    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let (r, s) = (Arc::clone(&release), Arc::clone(&started));
    let (busy, cancelled): (AsyncOperation<()>, AsyncOperation<usize>) = access
        .run_on_owner(move |access| {
            let busy = access.read_async(move |_| {
                s.store(true, Ordering::SeqCst);
                while !r.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })?;
            let token = CancellationToken::new();
            let cancelled = access.read_async_with_cancel(|_| Ok(1usize), token.clone())?;
            token.cancel();
            Ok((busy, cancelled))
        })
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || started.load(Ordering::SeqCst)));
    assert_eq!(access.pending_operations(), 2);
    release.store(true, Ordering::SeqCst);

    busy.wait().unwrap();
    assert!(matches!(cancelled.wait(), Err(AccessError::Cancelled)));
    assert!(wait_for(Duration::from_secs(5), || access.pending_operations() == 0));
    access.dispose();
}

#[test]
fn failed_async_write_rolls_back_and_surfaces_error() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);

    let op = access
        .run_on_owner(|access| {
            access.write_async(|txn| {
                insert_score(txn, "erin", 1);
                txn.insert("Unknown", json!({}))?;
                Ok(())
            })
        })
        .unwrap();
    let err = op.wait().unwrap_err();
    assert!(err.engine_error().is_some());
    assert_eq!(score_count(&access), 0);
    access.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_operation_can_be_awaited() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);

    let owner_side = access.clone();
    let op = tokio::task::spawn_blocking(move || {
        owner_side.run_on_owner(|access| {
            access.write_async(|txn| Ok(insert_score(txn, "frank", 9).as_u64()))
        })
    })
    .await
    .unwrap()
    .unwrap();

    let id = op.await.unwrap();
    assert_eq!(id, 0);

    let check = access.clone();
    let count = tokio::task::spawn_blocking(move || score_count(&check)).await.unwrap();
    assert_eq!(count, 1);
    tokio::task::spawn_blocking(move || access.dispose()).await.unwrap();
}

#[test]
fn subscription_registered_off_thread_delivers_on_owner() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let on_owner = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let owner_check = access.clone();
    let (o, c) = (Arc::clone(&on_owner), Arc::clone(&calls));
    let subscription = access
        .subscribe(Query::all("Score"), move |_: &ResultSet, _: Option<&ChangeSet>| {
            o.store(owner_check.is_owning_thread(), Ordering::SeqCst);
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || calls.load(Ordering::SeqCst) == 1));
    assert!(on_owner.load(Ordering::SeqCst));

    // Disposing from this thread is marshalled to the owner
    subscription.dispose();
    flush_owner(&access);
    access
        .write(|txn| {
            insert_score(txn, "gina", 1);
            Ok(())
        })
        .unwrap();
    flush_owner(&access);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    access.dispose();
}

#[test]
fn custom_subscription_is_registered_again_after_block() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let registrations = Arc::new(AtomicUsize::new(0));
    let teardowns = Arc::new(AtomicUsize::new(0));

    let (r, t) = (Arc::clone(&registrations), Arc::clone(&teardowns));
    let subscription = access
        .subscribe_custom(move |_: &StoreAccess, handle: &dyn StoreHandle| {
            assert_eq!(handle.schema_version().as_u64(), 1);
            r.fetch_add(1, Ordering::SeqCst);
            let t = Arc::clone(&t);
            Some(Box::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            }) as custodian::Teardown)
        })
        .unwrap();
    flush_owner(&access);
    assert_eq!(registrations.load(Ordering::SeqCst), 1);

    access
        .run_on_owner(|access| access.block_all_operations("compact")?.release())
        .unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(registrations.load(Ordering::SeqCst), 2);

    subscription.dispose();
    flush_owner(&access);
    assert_eq!(teardowns.load(Ordering::SeqCst), 2);
    access.dispose();
}

#[test]
fn field_subscription_fires_only_on_value_change() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let id = access
        .write(|txn| Ok(insert_score(txn, "hank", 1)))
        .unwrap();

    let values: Arc<Mutex<Vec<Option<serde_json::Value>>>> = Arc::default();
    let v = Arc::clone(&values);
    let subscription = access
        .subscribe_to_field("Score", id, "total", move |value: Option<&serde_json::Value>| {
            v.lock().push(value.cloned());
        })
        .unwrap();
    flush_owner(&access);

    // Same total, other field changed: no callback
    let updates = [
        json!({ "user": "henry", "total": 1 }),
        json!({ "user": "henry", "total": 2 }),
    ];
    for fields in updates {
        access
            .write(move |txn| {
                txn.update(id, fields)?;
                Ok(())
            })
            .unwrap();
        flush_owner(&access);
    }
    access
        .write(move |txn| {
            txn.remove(id)?;
            Ok(())
        })
        .unwrap();
    flush_owner(&access);

    assert_eq!(
        *values.lock(),
        vec![Some(json!(1)), Some(json!(2)), None]
    );
    drop(subscription);
    access.dispose();
}
