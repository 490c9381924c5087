use std::time::Duration;

use sproc_middleware::params::ParameterMarshaller;
use sproc_middleware::test_utils::{TestEnv, procedures};
use sproc_middleware::{CallOptions, ErrorKind, SprocError, StoredProcedureExecutor, params};

#[tokio::test(flavor = "current_thread")]
async fn executor_runs_on_a_checked_out_connection() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    procedures::seed_values(&env.db, &[5, 15, 25]);
    let executor = StoredProcedureExecutor::new(Duration::from_secs(5));
    let marshaller = ParameterMarshaller::default();
    let options = CallOptions::new("exec-conn");

    let contract = procedures::reader();
    let bound = marshaller.bind(&contract, &params! { "MinValue" => 10 })?;
    let mut conn = env.gateway.provider().acquire(TestEnv::MAIN).await?;
    let result = executor
        .execute(&mut conn, &contract, &bound, &options)
        .await?;
    assert!(result.is_success());
    assert_eq!(result.first_set().map(|s| s.len()), Some(2));

    let fail = procedures::fail();
    let bound = marshaller.bind(&fail, &params! {})?;
    let structured = executor.execute(&mut conn, &fail, &bound, &options).await?;
    assert_eq!(structured.error_kind(), Some(ErrorKind::FatalDatabase));
    let strict = executor
        .execute_strict(&mut conn, &fail, &bound, &options)
        .await
        .unwrap_err();
    assert_eq!(strict.kind(), ErrorKind::FatalDatabase);
    assert!(!conn.is_broken());
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn executor_binds_to_the_unit_of_work_transaction() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let executor = StoredProcedureExecutor::default();
    let contract = procedures::insert_contract();
    let bound =
        ParameterMarshaller::default().bind(&contract, &params! { "Name" => "tx", "Value" => 7 })?;
    let options = CallOptions::new("exec-uow");

    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;
    let err = executor
        .execute(&mut uow, &contract, &bound, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, SprocError::InvalidState(_)));

    uow.begin().await?;
    executor
        .execute_strict(&mut uow, &contract, &bound, &options)
        .await?;
    assert!(env.db.rows(procedures::TEST_TABLE).is_empty());
    uow.commit().await?;
    assert_eq!(env.db.rows(procedures::TEST_TABLE).len(), 1);
    // Same connection for begin, call and commit.
    assert_eq!(env.db.connect_count(), 1);
    Ok(())
}
