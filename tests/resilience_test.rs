use axum::http::StatusCode;
use chat_relay::hardening::*;
use chat_relay::types::*;

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: chat_relay::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_policy_eventual_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: chat_relay::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            let a = attempts;
            async move {
                if a < 3 {
                    Err(ObservedError::from(RelayError::UpstreamUnreachable(
                        "connection refused".to_string(),
                    )))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_retry_policy_gives_up_after_max_attempts() {
    let policy = RetryPolicy::new(2, 1);
    let mut attempts = 0;

    let result: chat_relay::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move {
                Err(ObservedError::from(RelayError::UpstreamHttp(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "busy".into(),
                )))
            }
        })
        .await;

    match result {
        Err(e) => assert!(matches!(
            e.inner,
            RelayError::UpstreamHttp(s, _) if s == StatusCode::SERVICE_UNAVAILABLE
        )),
        Ok(v) => panic!("Expected Err, got Ok({})", v),
    }
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_non_retryable_errors_fail_fast() {
    let policy = RetryPolicy::new(5, 1);
    let mut attempts = 0;

    let result: chat_relay::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move {
                Err(ObservedError::from(RelayError::UpstreamHttp(
                    StatusCode::UNAUTHORIZED,
                    "bad key".into(),
                )))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_single_attempt_never_retries() {
    let policy = RetryPolicy::new(0, 1);
    assert_eq!(policy.max_attempts, 1);
    let mut attempts = 0;

    let result: chat_relay::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(ObservedError::from(RelayError::UpstreamTimeout("slow".into()))) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[test]
fn test_retryable_classification() {
    let retryable = [
        RelayError::UpstreamUnreachable("refused".into()),
        RelayError::UpstreamTimeout("slow".into()),
        RelayError::UpstreamHttp(StatusCode::TOO_MANY_REQUESTS, String::new()),
        RelayError::UpstreamHttp(StatusCode::BAD_GATEWAY, String::new()),
    ];
    for err in retryable {
        assert!(RetryPolicy::is_retryable(&ObservedError::from(err)));
    }

    let fatal = [
        RelayError::UpstreamHttp(StatusCode::BAD_REQUEST, String::new()),
        RelayError::MalformedFrame("x".into()),
        RelayError::SessionNotFound("x".into()),
        RelayError::Cancelled,
    ];
    for err in fatal {
        assert!(!RetryPolicy::is_retryable(&ObservedError::from(err)));
    }
}
