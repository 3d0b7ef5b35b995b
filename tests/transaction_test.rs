//! Integration tests for nested transaction coordination.

mod common;

use chryso::db::Outcome;
use chryso::{DbError, DriverFailure, Engine, Transaction};
use common::recording_engine;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Stand-in for an application error raised inside a transaction block.
#[derive(Debug)]
enum AppError {
    Value(String),
    Db(DbError),
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        AppError::Db(err)
    }
}

#[test]
fn test_nested_atomic_emits_savepoints_by_depth() {
    let (engine, recorder) = recording_engine();

    engine
        .atomic(|outer| {
            assert_eq!(outer.depth(), 0);
            engine.atomic(|middle| {
                assert_eq!(middle.depth(), 1);
                assert_eq!(middle.savepoint_name().as_deref(), Some("chryso_1"));
                engine.atomic(|inner| {
                    assert_eq!(inner.depth(), 2);
                    Ok::<_, DbError>(())
                })
            })
        })
        .unwrap();

    assert_eq!(
        recorder.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT chryso_1",
            "SAVEPOINT chryso_2",
            "RELEASE SAVEPOINT chryso_2",
            "RELEASE SAVEPOINT chryso_1",
            "COMMIT",
        ]
    );
    assert_eq!(engine.depth(), None);
}

fn nest(engine: &Engine, remaining: usize) -> Result<usize, DbError> {
    engine.atomic(|tx| {
        if remaining == 1 {
            Ok(tx.depth())
        } else {
            nest(engine, remaining - 1)
        }
    })
}

#[test]
fn test_innermost_depth_is_nesting_minus_one() {
    for k in 1..=6 {
        let (engine, _) = recording_engine();
        assert_eq!(nest(&engine, k).unwrap(), k - 1);
        assert!(!engine.in_transaction());
    }
}

#[test]
fn test_inner_failure_rolls_back_only_its_savepoint() {
    let (engine, recorder) = recording_engine();

    let result: Result<(), AppError> = engine.atomic(|outer| {
        let inner: Result<(), AppError> =
            engine.atomic(|_| Err(AppError::Value("bad value".to_string())));

        match inner {
            Err(AppError::Value(message)) => assert_eq!(message, "bad value"),
            other => panic!("expected the original error, got {other:?}"),
        }
        assert!(outer.is_active());
        assert_eq!(engine.depth(), Some(0));
        Ok(())
    });

    assert!(result.is_ok());
    assert_eq!(
        recorder.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT chryso_1",
            "ROLLBACK TO SAVEPOINT chryso_1",
            "COMMIT",
        ]
    );
}

#[test]
fn test_outer_can_still_roll_back_after_inner_failure() {
    let (engine, recorder) = recording_engine();

    engine
        .atomic(|outer| {
            let _ = engine.atomic(|_| Err::<(), _>(AppError::Value("nope".to_string())));
            outer.rollback()
        })
        .unwrap();

    assert_eq!(
        recorder.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT chryso_1",
            "ROLLBACK TO SAVEPOINT chryso_1",
            "ROLLBACK",
        ]
    );
}

#[test]
fn test_sequential_top_level_blocks_stay_at_depth_zero() {
    let (engine, recorder) = recording_engine();

    for _ in 0..3 {
        engine
            .atomic(|tx| {
                assert_eq!(tx.depth(), 0);
                assert!(tx.savepoint_name().is_none());
                Ok::<_, DbError>(())
            })
            .unwrap();
    }

    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "COMMIT", "BEGIN", "COMMIT", "BEGIN", "COMMIT"]
    );
}

#[test]
fn test_error_in_top_level_block_rolls_back_and_surfaces() {
    let (engine, recorder) = recording_engine();

    let result = engine.atomic(|tx| {
        tx.execute("INSERT INTO t VALUES (1)", &[])?;
        Err::<(), _>(AppError::Value("invalid".to_string()))
    });

    assert!(matches!(result, Err(AppError::Value(ref m)) if m == "invalid"));
    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "INSERT INTO t VALUES (1)", "ROLLBACK"]
    );
    assert_eq!(engine.depth(), None);
}

#[test]
fn test_double_commit_is_a_state_error() {
    let (engine, _) = recording_engine();

    engine
        .atomic(|tx| {
            tx.commit()?;
            let err = tx.commit().unwrap_err();
            assert!(matches!(err, DbError::TransactionState { .. }));
            assert!(err.to_string().contains(tx.id()));
            Ok::<_, DbError>(())
        })
        .unwrap();
}

#[test]
fn test_double_rollback_is_a_state_error() {
    let (engine, _) = recording_engine();

    engine
        .atomic(|tx| {
            tx.rollback()?;
            assert!(matches!(
                tx.rollback(),
                Err(DbError::TransactionState { .. })
            ));
            Ok::<_, DbError>(())
        })
        .unwrap();
}

#[test]
fn test_mixed_double_resolution_is_a_state_error() {
    let (engine, _) = recording_engine();

    engine
        .atomic(|tx| {
            tx.rollback()?;
            assert!(matches!(tx.commit(), Err(DbError::TransactionState { .. })));
            assert_eq!(tx.outcome(), Some(Outcome::RolledBack));
            Ok::<_, DbError>(())
        })
        .unwrap();

    engine
        .atomic(|tx| {
            tx.commit()?;
            assert!(matches!(
                tx.rollback(),
                Err(DbError::TransactionState { .. })
            ));
            assert_eq!(tx.outcome(), Some(Outcome::Committed));
            Ok::<_, DbError>(())
        })
        .unwrap();
}

#[test]
fn test_explicit_resolution_is_not_repeated_on_exit() {
    let (engine, recorder) = recording_engine();

    engine.atomic(|tx| tx.commit()).unwrap();
    engine.atomic(|tx| tx.rollback()).unwrap();
    let _ = engine.atomic(|tx| {
        tx.rollback()?;
        Err::<(), _>(AppError::Value("after rollback".to_string()))
    });

    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "COMMIT", "BEGIN", "ROLLBACK", "BEGIN", "ROLLBACK"]
    );
}

#[test]
fn test_explicit_inner_commit_then_outer_commit() {
    let (engine, recorder) = recording_engine();

    engine
        .atomic(|_| {
            engine.atomic(|inner| {
                inner.commit()?;
                assert!(!inner.is_active());
                Ok::<_, DbError>(())
            })
        })
        .unwrap();

    assert_eq!(
        recorder.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT chryso_1",
            "RELEASE SAVEPOINT chryso_1",
            "COMMIT",
        ]
    );
}

#[test]
fn test_nesting_under_resolved_parent_is_rejected() {
    let (engine, recorder) = recording_engine();

    let result = engine.atomic(|tx| {
        tx.commit()?;
        engine.atomic(|_| Ok::<_, DbError>(()))
    });

    assert!(matches!(result, Err(DbError::TransactionState { .. })));
    assert_eq!(recorder.statements(), vec!["BEGIN", "COMMIT"]);
    assert_eq!(engine.depth(), None);
}

#[test]
fn test_panic_inside_block_rolls_back_and_pops() {
    let (engine, recorder) = recording_engine();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        engine.atomic(|_| -> Result<(), DbError> { panic!("kaboom") })
    }));

    assert!(outcome.is_err());
    assert_eq!(recorder.statements(), vec!["BEGIN", "ROLLBACK"]);
    assert_eq!(engine.depth(), None);
}

#[test]
fn test_panic_in_nested_block_leaves_outer_usable() {
    let (engine, recorder) = recording_engine();

    engine
        .atomic(|outer| {
            let caught = catch_unwind(AssertUnwindSafe(|| {
                engine.atomic(|_| -> Result<(), DbError> { panic!("inner kaboom") })
            }));
            assert!(caught.is_err());
            assert!(outer.is_active());
            assert_eq!(engine.depth(), Some(0));
            outer.execute("UPDATE t SET x = 1", &[])?;
            Ok::<_, DbError>(())
        })
        .unwrap();

    assert_eq!(
        recorder.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT chryso_1",
            "ROLLBACK TO SAVEPOINT chryso_1",
            "UPDATE t SET x = 1",
            "COMMIT",
        ]
    );
}

#[test]
fn test_failed_commit_still_pops_and_is_translated() {
    let (engine, recorder) = recording_engine();
    recorder.fail_on(
        "COMMIT",
        DriverFailure::with_sql_state("08006", "server closed the connection"),
    );

    let result = engine.atomic(|_| Ok::<_, DbError>(()));

    assert!(matches!(result, Err(DbError::Connectivity { .. })));
    assert_eq!(engine.depth(), None);
    // The failed COMMIT was the one resolution; no ROLLBACK follows it.
    assert_eq!(recorder.statements(), vec!["BEGIN", "COMMIT"]);
}

#[test]
fn test_failed_begin_never_runs_the_block() {
    let (engine, recorder) = recording_engine();
    recorder.fail_on("BEGIN", DriverFailure::with_sql_state("25001", "already in a transaction"));

    let mut ran = false;
    let result = engine.atomic(|_| {
        ran = true;
        Ok::<_, DbError>(())
    });

    assert!(matches!(result, Err(DbError::Statement { .. })));
    assert!(!ran);
    assert_eq!(engine.depth(), None);
    assert_eq!(recorder.statements(), vec!["BEGIN"]);
}

#[test]
fn test_failed_rollback_does_not_mask_original_error() {
    let (engine, recorder) = recording_engine();
    recorder.fail_on("ROLLBACK", DriverFailure::new("rollback exploded"));

    let result = engine.atomic(|_| Err::<(), _>(AppError::Value("original".to_string())));

    assert!(matches!(result, Err(AppError::Value(ref m)) if m == "original"));
    assert_eq!(engine.depth(), None);
}

#[test]
fn test_statement_error_inside_block_is_translated_and_rolled_back() {
    let (engine, recorder) = recording_engine();
    recorder.fail_on(
        "INSERT",
        DriverFailure::with_sql_state("23505", "duplicate key value violates unique constraint"),
    );

    let result = engine.atomic(|tx| tx.execute("INSERT INTO users VALUES (1)", &[]));

    assert!(matches!(result, Err(DbError::ConstraintViolation { .. })));
    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "INSERT INTO users VALUES (1)", "ROLLBACK"]
    );
}

#[test]
fn test_dropped_guard_rolls_back() {
    let (engine, recorder) = recording_engine();

    {
        let tx = engine.begin().unwrap();
        tx.execute("DELETE FROM t", &[]).unwrap();
        assert!(engine.in_transaction());
    }

    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "DELETE FROM t", "ROLLBACK"]
    );
    assert!(!engine.in_transaction());
}

#[test]
fn test_guard_commit_and_nested_guard() {
    let (engine, recorder) = recording_engine();

    let outer = engine.begin().unwrap();
    let inner = engine.begin().unwrap();
    assert_eq!(inner.depth(), 1);
    assert_eq!(inner.context().parent().unwrap().id(), outer.id());

    inner.commit().unwrap();
    drop(inner);
    outer.commit().unwrap();
    drop(outer);

    assert_eq!(
        recorder.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT chryso_1",
            "RELEASE SAVEPOINT chryso_1",
            "COMMIT",
        ]
    );
}

#[test]
fn test_resolving_outer_while_inner_open_is_rejected() {
    let (engine, recorder) = recording_engine();

    let outer = engine.begin().unwrap();
    let inner = engine.begin().unwrap();

    let err = outer.commit().unwrap_err();
    assert!(matches!(err, DbError::TransactionState { .. }));
    assert!(outer.is_active());

    inner.rollback().unwrap();
    drop(inner);
    outer.commit().unwrap();
    drop(outer);

    assert_eq!(
        recorder.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT chryso_1",
            "ROLLBACK TO SAVEPOINT chryso_1",
            "COMMIT",
        ]
    );
}

#[test]
fn test_dropping_outer_guard_discards_open_inner() {
    let (engine, recorder) = recording_engine();

    let outer = engine.begin().unwrap();
    let inner: Transaction<'_> = engine.begin().unwrap();

    drop(outer);
    assert!(!inner.is_active());
    assert!(!engine.in_transaction());
    assert!(matches!(
        inner.commit(),
        Err(DbError::TransactionState { .. })
    ));
    drop(inner);

    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "SAVEPOINT chryso_1", "ROLLBACK"]
    );

    // The stack is clean: the next block starts at depth 0 again.
    engine
        .atomic(|tx| {
            assert_eq!(tx.depth(), 0);
            Ok::<_, DbError>(())
        })
        .unwrap();
}

#[test]
fn test_each_thread_has_its_own_stack_and_connection() {
    let (engine, recorder) = recording_engine();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                engine
                    .atomic(|outer| {
                        assert_eq!(outer.depth(), 0);
                        engine.atomic(|inner| {
                            assert_eq!(inner.depth(), 1);
                            Ok::<_, DbError>(())
                        })
                    })
                    .unwrap();
            });
        }
    });

    assert_eq!(recorder.opened(), 4);
    for serial in 0..4 {
        assert_eq!(
            recorder.statements_on(serial),
            vec![
                "BEGIN",
                "SAVEPOINT chryso_1",
                "RELEASE SAVEPOINT chryso_1",
                "COMMIT",
            ]
        );
    }
    assert!(!engine.in_transaction());
}

#[test]
fn test_dispose_inside_block_refuses_further_statements() {
    let (engine, recorder) = recording_engine();

    let result = engine.atomic(|tx| {
        tx.execute("INSERT INTO t VALUES (1)", &[])?;
        engine.dispose();
        tx.execute("INSERT INTO t VALUES (2)", &[])?;
        Ok::<_, DbError>(())
    });

    let err = result.unwrap_err();
    assert!(matches!(err, DbError::TransactionState { .. }));
    // No replacement connection was opened, so nothing ran outside the
    // transaction and no stray ROLLBACK was sent elsewhere.
    assert_eq!(recorder.opened(), 1);
    assert_eq!(
        recorder.statements(),
        vec!["BEGIN", "INSERT INTO t VALUES (1)"]
    );
    assert!(!engine.in_transaction());

    // The next block starts over on a fresh connection.
    engine.atomic(|tx| tx.execute("SELECT 1", &[])).unwrap();
    assert_eq!(recorder.opened(), 2);
    assert_eq!(recorder.statements_on(1), vec!["BEGIN", "SELECT 1", "COMMIT"]);
}

#[test]
fn test_release_inside_nested_block_fails_commit() {
    let (engine, recorder) = recording_engine();

    let result = engine.atomic(|_| {
        engine.atomic(|_| {
            engine.pool().release()?;
            Ok::<_, DbError>(())
        })
    });

    assert!(matches!(result, Err(DbError::TransactionState { .. })));
    assert_eq!(recorder.opened(), 1);
    assert_eq!(recorder.statements(), vec!["BEGIN", "SAVEPOINT chryso_1"]);
    assert!(!engine.in_transaction());
}

#[test]
fn test_dispose_from_another_thread_invalidates_open_transaction() {
    let (engine, recorder) = recording_engine();

    let tx = engine.begin().unwrap();
    std::thread::scope(|s| {
        s.spawn(|| engine.dispose());
    });

    assert!(matches!(
        tx.execute("UPDATE t SET x = 1", &[]),
        Err(DbError::TransactionState { .. })
    ));
    drop(tx);

    assert_eq!(recorder.opened(), 1);
    assert_eq!(recorder.statements(), vec!["BEGIN"]);
}
