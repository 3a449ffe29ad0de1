//! In-flight accounting across owner and worker operations.

use std::time::Duration;

use custodian::AsyncOperation;
use proptest::prelude::*;

use crate::common::*;

#[derive(Debug, Clone, Copy)]
enum Step {
    OwnerRead,
    OwnerWrite,
    AsyncRead,
    AsyncWrite,
    AsyncFailingWrite,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::OwnerRead),
        Just(Step::OwnerWrite),
        Just(Step::AsyncRead),
        Just(Step::AsyncWrite),
        Just(Step::AsyncFailingWrite),
    ]
}

fn committed_writes(steps: &[Step]) -> usize {
    steps
        .iter()
        .filter(|s| matches!(s, Step::OwnerWrite | Step::AsyncWrite))
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn pending_count_returns_to_zero(steps in prop::collection::vec(step_strategy(), 1..12)) {
        let dir = TempDir::new().unwrap();
        let access = open_scores(dir.path(), 1);

        let plan = steps.clone();
        let operations: Vec<AsyncOperation<()>> = access
            .run_on_owner(move |access| {
                let mut operations = Vec::new();
                for step in plan {
                    match step {
                        Step::OwnerRead => {
                            access.read(|h| Ok(h.query(&Query::all("Score")).map(drop)?))?;
                        }
                        Step::OwnerWrite => {
                            access.write(|txn| {
                                insert_score(txn, "owner", 1);
                                Ok(())
                            })?;
                        }
                        Step::AsyncRead => {
                            operations.push(access.read_async(|h| Ok(h.query(&Query::all("Score")).map(drop)?))?);
                        }
                        Step::AsyncWrite => {
                            operations.push(access.write_async(|txn| {
                                insert_score(txn, "worker", 1);
                                Ok(())
                            })?);
                        }
                        Step::AsyncFailingWrite => {
                            operations.push(access.write_async(|txn| {
                                insert_score(txn, "worker", 1);
                                txn.insert("Unknown", json!({}))?;
                                Ok(())
                            })?);
                        }
                    }
                }
                Ok(operations)
            })
            .unwrap();

        let failures = operations
            .into_iter()
            .map(|op| op.wait())
            .filter(Result::is_err)
            .count();
        let expected_failures = steps
            .iter()
            .filter(|s| matches!(s, Step::AsyncFailingWrite))
            .count();
        prop_assert_eq!(failures, expected_failures);

        prop_assert!(wait_for(Duration::from_secs(5), || access.pending_operations() == 0));
        prop_assert_eq!(score_count(&access), committed_writes(&steps));
        access.dispose();
    }
}
