use std::time::Duration;

use sproc_middleware::test_utils::{TestEnv, procedures};
use sproc_middleware::{CallOptions, SprocError, TransactionState, params};

fn rows(env: &TestEnv) -> usize {
    env.db.rows(procedures::TEST_TABLE).len()
}

#[tokio::test(flavor = "current_thread")]
async fn begin_while_active_is_rejected() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let options = CallOptions::new("uow-1");
    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;
    assert_eq!(uow.state(), TransactionState::Idle);

    uow.begin().await?;
    uow.execute_non_query(
        &procedures::insert_contract(),
        &params! { "Name" => "a", "Value" => 1 },
        &options,
    )
    .await?;

    let err = uow.begin().await.unwrap_err();
    assert!(matches!(err, SprocError::InvalidState(_)));
    assert!(uow.has_active_transaction());
    assert_eq!(uow.state(), TransactionState::Active);

    // The existing transaction is intact and still commits its work.
    uow.commit().await?;
    assert_eq!(uow.state(), TransactionState::Committed);
    assert_eq!(rows(&env), 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn failed_call_then_rollback_leaves_nothing_behind() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let options = CallOptions::new("uow-2");
    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;

    uow.begin().await?;
    let inserted = uow
        .execute_non_query(
            &procedures::non_query(),
            &params! { "Name" => "doomed", "Value" => 7 },
            &options,
        )
        .await?;
    assert_eq!(inserted.rows_affected(), 1);

    let failed = uow
        .execute(&procedures::fail(), &params! {}, &options)
        .await?;
    assert!(!failed.is_success());
    assert!(uow.has_active_transaction());

    uow.rollback().await?;
    assert!(!uow.has_active_transaction());
    assert_eq!(uow.state(), TransactionState::RolledBack);
    assert_eq!(rows(&env), 0);

    let visible = env
        .gateway
        .execute_strict(
            TestEnv::MAIN,
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &options,
        )
        .await?;
    assert_eq!(visible.first_set().map(|s| s.len()), Some(0));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn uncommitted_work_is_isolated_until_commit() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let options = CallOptions::new("uow-3");
    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;

    uow.begin().await?;
    for value in [1, 2, 3] {
        uow.execute_non_query(
            &procedures::insert_contract(),
            &params! { "Name" => "n", "Value" => value },
            &options,
        )
        .await?;
    }
    let inside: Option<String> = uow
        .execute_scalar(&procedures::scalar(), &params! { "Id" => 3 }, &options)
        .await?;
    assert_eq!(inside.as_deref(), Some("n"));
    assert_eq!(rows(&env), 0);

    uow.commit().await?;
    assert_eq!(rows(&env), 3);
    assert_eq!(env.db.commit_count(), 1);

    // A finished unit of work can start over.
    uow.begin().await?;
    assert!(uow.has_active_transaction());
    uow.rollback().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn calls_require_an_active_transaction() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let options = CallOptions::new("uow-4");
    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;

    let err = uow
        .execute(&procedures::reader(), &params! { "MinValue" => 0 }, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, SprocError::InvalidState(_)));
    assert!(matches!(uow.commit().await, Err(SprocError::InvalidState(_))));
    assert!(matches!(uow.rollback().await, Err(SprocError::InvalidState(_))));
    assert_eq!(env.db.call_count("sp_TestReader"), 0);

    assert!(matches!(
        env.gateway.unit_of_work("nowhere"),
        Err(SprocError::Configuration(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn commit_failure_ends_rolled_back() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let options = CallOptions::new("uow-5");
    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;

    uow.begin().await?;
    uow.execute_non_query(
        &procedures::insert_contract(),
        &params! { "Name" => "a", "Value" => 1 },
        &options,
    )
    .await?;
    env.db.fail_commits(1);

    let err = uow.commit().await.unwrap_err();
    assert!(matches!(err, SprocError::Connectivity(_)));
    assert_eq!(uow.state(), TransactionState::RolledBack);
    assert!(!uow.has_active_transaction());
    assert_eq!(rows(&env), 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn dropping_an_active_unit_of_work_rolls_back() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let options = CallOptions::new("uow-6");
    {
        let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;
        uow.begin().await?;
        uow.execute_non_query(
            &procedures::insert_contract(),
            &params! { "Name" => "a", "Value" => 1 },
            &options,
        )
        .await?;
    }
    // The rollback runs on a spawned task.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(env.db.rollback_count(), 1);
    assert_eq!(rows(&env), 0);

    // The connection went back to the pool clean and is reused.
    env.gateway
        .execute_strict(
            TestEnv::MAIN,
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &options,
        )
        .await?;
    assert_eq!(env.db.connect_count(), 1);
    Ok(())
}
