use std::time::{Duration, Instant};

use sproc_middleware::config::RetryConfig;
use sproc_middleware::test_utils::{TestEnv, procedures};
use sproc_middleware::{CallOptions, ErrorCategory, SprocError, params};

fn single_attempt() -> Result<TestEnv, SprocError> {
    TestEnv::with_config(TestEnv::config().with_retry(RetryConfig {
        max_attempts: 1,
        ..RetryConfig::default()
    }))
}

#[tokio::test(flavor = "current_thread")]
async fn slow_procedure_times_out_instead_of_hanging() -> Result<(), SprocError> {
    let env = single_attempt()?;
    let options = CallOptions::new("slow-1").timeout(Duration::from_millis(100));

    let start = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        env.gateway.execute(
            TestEnv::MAIN,
            &procedures::delay(),
            &params! { "DelayMs" => 5_000 },
            &options,
        ),
    )
    .await
    .expect("call must not hang")?;

    assert!(!result.is_success());
    assert_eq!(result.error_category(), Some(ErrorCategory::Timeout));
    assert!(result.error_message().is_some());
    assert!(start.elapsed() < Duration::from_secs(3));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn timed_out_connection_is_not_reused() -> Result<(), SprocError> {
    let env = single_attempt()?;
    let slow = CallOptions::new("slow-2").timeout(Duration::from_millis(50));
    env.gateway
        .execute(
            TestEnv::MAIN,
            &procedures::delay(),
            &params! { "DelayMs" => 5_000 },
            &slow,
        )
        .await?;
    assert_eq!(env.db.connect_count(), 1);

    let fast = CallOptions::new("fast");
    let result = env
        .gateway
        .execute(
            TestEnv::MAIN,
            &procedures::delay(),
            &params! { "DelayMs" => 0 },
            &fast,
        )
        .await?;
    assert!(result.is_success());
    assert_eq!(env.db.connect_count(), 2);

    // A healthy connection goes back to the pool.
    env.gateway
        .execute_strict(
            TestEnv::MAIN,
            &procedures::delay(),
            &params! { "DelayMs" => 0 },
            &fast,
        )
        .await?;
    assert_eq!(env.db.connect_count(), 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn configured_default_timeout_applies() -> Result<(), SprocError> {
    let config = TestEnv::config()
        .with_default_timeout(Duration::from_millis(50))
        .with_retry(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
    let env = TestEnv::with_config(config)?;

    let result = env
        .gateway
        .execute(
            TestEnv::MAIN,
            &procedures::delay(),
            &params! { "DelayMs" => 2_000 },
            &CallOptions::new("default-timeout"),
        )
        .await?;
    assert_eq!(result.error_category(), Some(ErrorCategory::Timeout));
    Ok(())
}
