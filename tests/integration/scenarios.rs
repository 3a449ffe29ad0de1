//! End-to-end scenarios: reads and writes on both thread kinds, subscription
//! delivery, and a subscription surviving a blocking window.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::common::*;

#[derive(Debug, Clone, PartialEq)]
struct Delivery {
    len: usize,
    changes: Option<ChangeSet>,
}

type Deliveries = Arc<Mutex<Vec<Delivery>>>;

fn recorder(deliveries: &Deliveries) -> impl FnMut(&ResultSet, Option<&ChangeSet>) + Send + 'static {
    let deliveries = Arc::clone(deliveries);
    move |results: &ResultSet, changes: Option<&ChangeSet>| {
        deliveries.lock().push(Delivery {
            len: results.len(),
            changes: changes.cloned(),
        });
    }
}

#[test]
fn scenario_a_reads_on_owner_and_worker_see_the_write() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);

    access
        .run_on_owner(|access| {
            access.write(|txn| {
                insert_score(txn, "alice", 100);
                Ok(())
            })
        })
        .unwrap();

    let on_owner = access
        .run_on_owner(|access| access.read(|h| Ok(h.query(&Query::all("Score"))?.len())))
        .unwrap();
    assert_eq!(on_owner, 1);

    let pending = access
        .run_on_owner(|access| access.read_async(|h| Ok(h.query(&Query::all("Score"))?.len())))
        .unwrap();
    assert_eq!(pending.wait().unwrap(), 1);

    let stats = access.stats().unwrap();
    assert_eq!(stats.writes_owner, 1);
    assert_eq!(stats.reads_owner, 1);
    assert_eq!(stats.reads_async, 1);
    access.dispose();
}

#[test]
fn scenario_a_off_thread_sync_calls_use_short_lived_handles() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);

    access
        .write(|txn| {
            insert_score(txn, "bob", 5);
            Ok(())
        })
        .unwrap();
    assert_eq!(score_count(&access), 1);

    let stats = access.stats().unwrap();
    assert_eq!(stats.writes_async, 1);
    assert_eq!(stats.reads_async, 1);
    assert_eq!(stats.reads_owner, 0);
    access.dispose();
}

#[test]
fn scenario_b_subscription_receives_initial_then_diff_then_nothing() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let deliveries: Deliveries = Arc::default();

    // Subscribe and write in one owner job so the initial delivery already
    // includes the first record.
    let record = recorder(&deliveries);
    let subscription = access
        .run_on_owner(move |access| {
            let query = Query::all("Score").where_field("user", json!("alice"));
            let subscription = access.subscribe(query, record)?;
            access.write(|txn| {
                insert_score(txn, "alice", 1);
                Ok(())
            })?;
            Ok(subscription)
        })
        .unwrap();

    flush_owner(&access);
    assert_eq!(
        *deliveries.lock(),
        vec![Delivery {
            len: 1,
            changes: None
        }]
    );

    // Non-matching write: no delivery
    access
        .write(|txn| {
            insert_score(txn, "carol", 2);
            Ok(())
        })
        .unwrap();
    access
        .write(|txn| {
            insert_score(txn, "alice", 3);
            Ok(())
        })
        .unwrap();
    flush_owner(&access);

    {
        let seen = deliveries.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].len, 2);
        assert_eq!(
            seen[1].changes,
            Some(ChangeSet {
                inserted: vec![1],
                removed: vec![],
                modified: vec![],
            })
        );
    }

    subscription.dispose();
    access
        .write(|txn| {
            insert_score(txn, "alice", 4);
            Ok(())
        })
        .unwrap();
    flush_owner(&access);
    assert_eq!(deliveries.lock().len(), 2);

    assert_eq!(access.stats().unwrap().subscriptions, 0);
    access.dispose();
}

#[test]
fn scenario_c_subscription_reset_during_block_and_live_after() {
    let dir = TempDir::new().unwrap();
    let access = open_scores(dir.path(), 1);
    let deliveries: Deliveries = Arc::default();

    access
        .write(|txn| {
            insert_score(txn, "alice", 10);
            insert_score(txn, "alice", 20);
            Ok(())
        })
        .unwrap();

    let subscription = access
        .subscribe(Query::all("Score"), recorder(&deliveries))
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || deliveries.lock().len() == 1));

    let seen_during_block = Arc::clone(&deliveries);
    let during = access
        .run_on_owner(move |access| {
            let guard = access.block_all_operations("compact")?;
            let snapshot = seen_during_block.lock().clone();
            guard.release()?;
            Ok(snapshot)
        })
        .unwrap();

    // Reset arrived before the block returned control to the caller
    assert_eq!(
        during.last(),
        Some(&Delivery {
            len: 0,
            changes: None
        })
    );

    // Fresh initial population after restore
    flush_owner(&access);
    assert_eq!(
        deliveries.lock().last(),
        Some(&Delivery {
            len: 2,
            changes: None
        })
    );

    // And the subscription is live again
    access
        .write(|txn| {
            insert_score(txn, "dave", 30);
            Ok(())
        })
        .unwrap();
    flush_owner(&access);
    let last = deliveries.lock().last().cloned().unwrap();
    assert_eq!(last.len, 3);
    assert_eq!(last.changes.unwrap().inserted, vec![2]);

    drop(subscription);
    access.dispose();
}
