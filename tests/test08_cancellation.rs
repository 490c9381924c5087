use std::time::Duration;

use sproc_middleware::test_utils::{TestEnv, procedures};
use sproc_middleware::{CallOptions, ErrorKind, SprocError, TransactionState, params};
use tokio_util::sync::CancellationToken;

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

#[tokio::test(flavor = "current_thread")]
async fn already_cancelled_call_never_runs() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let token = CancellationToken::new();
    token.cancel();

    let err = env
        .gateway
        .execute(
            TestEnv::MAIN,
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &CallOptions::new("pre-cancelled").cancel_token(token),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SprocError::Cancelled));
    assert_eq!(env.db.call_count("sp_TestReader"), 0);

    let events = env.audit_events().await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error_kind(), Some(ErrorKind::Cancelled));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn cancelling_a_gateway_call_discards_its_connection() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(30));

    let err = tokio::time::timeout(
        Duration::from_secs(3),
        env.gateway.execute(
            TestEnv::MAIN,
            &procedures::delay(),
            &params! { "DelayMs" => 5_000 },
            &CallOptions::new("cancel-mid").cancel_token(token),
        ),
    )
    .await
    .expect("cancellation is prompt")
    .unwrap_err();
    assert!(matches!(err, SprocError::Cancelled));
    // Cancellation is final: no retry.
    assert_eq!(env.db.call_count("sp_TestDelay"), 1);

    env.gateway
        .execute_strict(
            TestEnv::MAIN,
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &CallOptions::new("after-cancel"),
        )
        .await?;
    assert_eq!(env.db.connect_count(), 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn cancelling_inside_a_transaction_rolls_it_back() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;
    uow.begin().await?;
    uow.execute_non_query(
        &procedures::insert_contract(),
        &params! { "Name" => "a", "Value" => 1 },
        &CallOptions::new("tx-cancel"),
    )
    .await?;

    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(30));
    let err = uow
        .execute(
            &procedures::delay(),
            &params! { "DelayMs" => 5_000 },
            &CallOptions::new("tx-cancel").cancel_token(token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SprocError::Cancelled));
    assert!(!uow.has_active_transaction());
    assert_eq!(uow.state(), TransactionState::RolledBack);
    assert!(env.db.rows(procedures::TEST_TABLE).is_empty());
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn timeout_inside_a_transaction_rolls_it_back() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let options = CallOptions::new("tx-timeout");
    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;
    uow.begin().await?;
    uow.execute_non_query(
        &procedures::insert_contract(),
        &params! { "Name" => "a", "Value" => 1 },
        &options,
    )
    .await?;

    let result = uow
        .execute(
            &procedures::delay(),
            &params! { "DelayMs" => 5_000 },
            &options.clone().timeout(Duration::from_millis(30)),
        )
        .await?;
    assert!(!result.is_success());
    assert_eq!(result.error_kind(), Some(ErrorKind::TransientDatabase));
    assert_eq!(uow.state(), TransactionState::RolledBack);
    assert!(env.db.rows(procedures::TEST_TABLE).is_empty());

    // Nothing left to roll back.
    assert!(matches!(uow.rollback().await, Err(SprocError::InvalidState(_))));
    Ok(())
}
