use sproc_middleware::config::RetryConfig;
use sproc_middleware::test_utils::memory::ScriptedFailure;
use sproc_middleware::test_utils::{TestEnv, procedures};
use sproc_middleware::{CallOptions, ErrorKind, SprocError, params};

fn with_attempts(max_attempts: u32) -> Result<TestEnv, SprocError> {
    TestEnv::with_config(TestEnv::config().with_retry(RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
    }))
}

#[tokio::test(flavor = "current_thread")]
async fn transient_failures_are_retried_up_to_the_limit() -> Result<(), SprocError> {
    for (failures, max_attempts) in [(0, 3), (1, 3), (2, 3), (3, 3), (5, 3), (1, 1), (4, 5)] {
        let env = with_attempts(max_attempts)?;
        env.db
            .fail_next("sp_TestNonQuery", failures, ScriptedFailure::Database(1205));

        let result = env
            .gateway
            .execute(
                TestEnv::MAIN,
                &procedures::non_query(),
                &params! { "Name" => "r", "Value" => 1 },
                &CallOptions::new(format!("retry-{failures}-{max_attempts}")),
            )
            .await?;

        let expected_attempts = (failures + 1).min(max_attempts);
        assert_eq!(
            result.is_success(),
            failures < max_attempts,
            "N={failures} M={max_attempts}"
        );
        assert_eq!(
            env.db.call_count("sp_TestNonQuery"),
            expected_attempts,
            "N={failures} M={max_attempts}"
        );

        let events = env.audit_events().await?;
        assert_eq!(events.len(), 1, "one event per operation");
        assert_eq!(events[0].attempts(), expected_attempts);
        assert_eq!(events[0].success(), failures < max_attempts);
        if failures >= max_attempts {
            assert_eq!(events[0].error_kind(), Some(ErrorKind::TransientDatabase));
        }
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn fatal_failures_are_not_retried() -> Result<(), SprocError> {
    let env = with_attempts(5)?;
    env.db
        .fail_next("sp_TestNonQuery", 3, ScriptedFailure::Database(2627));

    let err = env
        .gateway
        .execute_strict(
            TestEnv::MAIN,
            &procedures::non_query(),
            &params! { "Name" => "dup", "Value" => 1 },
            &CallOptions::new("fatal"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FatalDatabase);
    assert_eq!(env.db.call_count("sp_TestNonQuery"), 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn dropped_connections_are_retried_on_a_fresh_one() -> Result<(), SprocError> {
    let env = with_attempts(3)?;
    env.db
        .fail_next("sp_TestReader", 1, ScriptedFailure::Connectivity);

    let result = env
        .gateway
        .execute_strict(
            TestEnv::MAIN,
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &CallOptions::new("drop"),
        )
        .await?;
    assert!(result.is_success());
    assert_eq!(env.db.call_count("sp_TestReader"), 2);
    assert_eq!(env.db.connect_count(), 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn transaction_restarts_from_begin_on_transient_failure() -> Result<(), SprocError> {
    let env = with_attempts(3)?;
    env.db
        .fail_next("sp_TestInsert", 1, ScriptedFailure::Database(1205));

    let non_query = procedures::non_query();
    let insert = procedures::insert_contract();
    let options = CallOptions::new("tx-retry");

    let new_id = env
        .gateway
        .run_in_transaction(TestEnv::MAIN, &options, |uow| {
            let non_query = non_query.clone();
            let insert = insert.clone();
            let options = options.clone();
            Box::pin(async move {
                let created = uow
                    .execute_non_query(&non_query, &params! { "Name" => "a", "Value" => 1 }, &options)
                    .await?;
                uow.execute_non_query(&insert, &params! { "Name" => "b", "Value" => 2 }, &options)
                    .await?;
                created.output::<i64>("NewId")
            })
        })
        .await?;

    assert!(new_id.is_some());
    assert_eq!(env.db.rows(procedures::TEST_TABLE).len(), 2);
    assert_eq!(env.db.rollback_count(), 1);
    assert_eq!(env.db.commit_count(), 1);
    assert_eq!(env.db.call_count("sp_TestNonQuery"), 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn transaction_body_errors_roll_back_without_retry() -> Result<(), SprocError> {
    let env = with_attempts(3)?;
    let insert = procedures::insert_contract();
    let fail = procedures::fail();
    let options = CallOptions::new("tx-fatal");

    let result: Result<(), SprocError> = env
        .gateway
        .run_in_transaction(TestEnv::MAIN, &options, |uow| {
            let insert = insert.clone();
            let fail = fail.clone();
            let options = options.clone();
            Box::pin(async move {
                uow.execute_non_query(&insert, &params! { "Name" => "a", "Value" => 1 }, &options)
                    .await?;
                uow.execute_strict(&fail, &params! {}, &options).await?;
                Ok(())
            })
        })
        .await;

    assert!(matches!(result, Err(SprocError::Database(_))));
    assert!(env.db.rows(procedures::TEST_TABLE).is_empty());
    assert_eq!(env.db.call_count("sp_TestFail"), 1);
    assert_eq!(env.db.commit_count(), 0);
    Ok(())
}
