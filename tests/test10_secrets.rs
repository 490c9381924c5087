use std::io::Write;
use std::time::Duration;

use sproc_middleware::config::{ConnectionDefinition, MiddlewareConfig, PoolConfig};
use sproc_middleware::test_utils::{TestEnv, procedures};
use sproc_middleware::{CallOptions, ErrorCategory, ErrorKind, SprocError, params};

#[tokio::test(flavor = "current_thread")]
async fn rotated_secret_rebuilds_the_pool() -> Result<(), SprocError> {
    let env = TestEnv::with_config(TestEnv::config().with_secret_ttl(Duration::ZERO))?;
    let options = CallOptions::new("rotation");
    let values = params! { "MinValue" => 0 };

    env.gateway
        .execute_strict(TestEnv::MAIN, &procedures::reader(), &values, &options)
        .await?;
    env.gateway
        .execute_strict(TestEnv::MAIN, &procedures::reader(), &values, &options)
        .await?;
    assert_eq!(env.db.connect_count(), 1);

    env.secrets.set(TestEnv::MAIN, "memory://rotated");
    env.gateway
        .execute_strict(TestEnv::MAIN, &procedures::reader(), &values, &options)
        .await?;
    assert_eq!(env.db.connect_count(), 2);
    assert_eq!(
        env.db.connection_strings(),
        ["memory://main", "memory://rotated"]
    );
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn failed_connect_is_retried_with_a_fresh_secret() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    env.db.fail_connects(1);

    env.gateway
        .execute_strict(
            TestEnv::MAIN,
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &CallOptions::new("reconnect"),
        )
        .await?;

    let events = env.audit_events().await?;
    assert_eq!(events.len(), 1);
    assert!(events[0].success());
    assert_eq!(events[0].attempts(), 2);
    assert_eq!(env.db.call_count("sp_TestReader"), 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_connection_id_is_a_configuration_error() -> Result<(), SprocError> {
    let env = TestEnv::new()?;
    let err = env
        .gateway
        .execute(
            "reporting",
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &CallOptions::new("unknown"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SprocError::Configuration(_)));
    assert!(matches!(
        env.gateway.unit_of_work("reporting"),
        Err(SprocError::Configuration(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn missing_secret_is_unavailable() -> Result<(), SprocError> {
    let env = TestEnv::with_config(TestEnv::config().with_secret_ttl(Duration::ZERO))?;
    env.secrets.remove(TestEnv::MAIN);

    let err = env
        .gateway
        .execute(
            TestEnv::MAIN,
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &CallOptions::new("no-secret"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SprocError::SecretUnavailable(_)));
    assert_eq!(env.db.connect_count(), 0);

    let events = env.audit_events().await?;
    assert_eq!(events.len(), 1);
    assert!(!events[0].success());
    assert_eq!(events[0].attempts(), 3);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn secret_name_can_differ_from_connection_id() -> Result<(), SprocError> {
    let config = TestEnv::config().with_connection(
        ConnectionDefinition::new("reporting").with_secret_name("vault/reporting-db"),
    );
    let env = TestEnv::with_config(config)?;
    env.gateway
        .execute_strict(
            "reporting",
            &procedures::reader(),
            &params! { "MinValue" => 0 },
            &CallOptions::new("named-secret"),
        )
        .await?;
    assert_eq!(env.db.connection_strings(), ["memory://reporting"]);
    Ok(())
}

#[test]
fn configuration_loads_from_a_json_file() -> Result<(), SprocError> {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"{{
            "connections": [{{ "id": "main" }}, {{ "id": "audit", "pool_max_size": 2 }}],
            "retry": {{ "max_attempts": 5 }},
            "circuit_breaker": {{ "failure_threshold": 3, "cool_down_ms": 500 }}
        }}"#
    )
    .expect("write config");

    let config = MiddlewareConfig::from_json_file(file.path())?;
    assert_eq!(config.connections.len(), 2);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.connection("audit").and_then(|c| c.pool_max_size), Some(2));
    assert_eq!(
        config.circuit_breaker.as_ref().map(|cb| cb.cool_down()),
        Some(Duration::from_millis(500))
    );

    let duplicate = r#"{ "connections": [{ "id": "main" }, { "id": "main" }] }"#;
    assert!(matches!(
        MiddlewareConfig::from_json_str(duplicate),
        Err(SprocError::Configuration(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn saturated_pool_times_out_without_rebuilding() -> Result<(), SprocError> {
    let env = TestEnv::with_config(TestEnv::config().with_pool(PoolConfig {
        max_size: 1,
        wait_timeout_ms: 50,
    }))?;
    let options = CallOptions::new("saturation");
    let values = params! { "MinValue" => 0 };

    let mut uow = env.gateway.unit_of_work(TestEnv::MAIN)?;
    uow.begin().await?;

    let starved = env
        .gateway
        .execute(TestEnv::MAIN, &procedures::reader(), &values, &options)
        .await?;
    assert!(!starved.is_success());
    assert_eq!(starved.error_kind(), Some(ErrorKind::TransientDatabase));
    assert_eq!(starved.error_category(), Some(ErrorCategory::Timeout));
    assert_eq!(env.db.connect_count(), 1);

    uow.commit().await?;
    let served = env
        .gateway
        .execute(TestEnv::MAIN, &procedures::reader(), &values, &options)
        .await?;
    assert!(served.is_success());
    assert_eq!(env.db.connect_count(), 1);
    Ok(())
}
