/// Integration tests with mocked D&B endpoints
/// Exercises auth, retries, batching and staging without hitting the real API
use duns_match_api::auth::{Authenticator, TokenStore};
use duns_match_api::config::Config;
use duns_match_api::errors::AppError;
use duns_match_api::matcher::Matcher;
use duns_match_api::models::{CompanyQuery, StagedPayload};
use duns_match_api::rate_limiter::RateLimiter;
use duns_match_api::response_store::ResponseStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MATCH_PATH: &str = "/v1/match/cleanseMatch";

/// Helper function to create test config
fn create_test_config(server: &MockServer) -> Config {
    let mut config = Config::new(server.uri(), "test_key", "test_secret");
    config.base_delay = Duration::from_millis(10);
    config.max_delay = Duration::from_millis(50);
    config.requests_per_second = 0;
    config
}

fn token_store(config: &Config) -> Arc<TokenStore> {
    let authenticator = Authenticator::new(config).unwrap();
    Arc::new(TokenStore::new(authenticator, config.token_safety_margin))
}

fn create_matcher(config: &Config) -> Matcher {
    Matcher::new(config, token_store(config)).unwrap()
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v3/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-123",
            "expiresIn": 86400
        })))
        .mount(server)
        .await;
}

fn candidate(duns: &str, name: &str, confidence: u8) -> Value {
    json!({
        "organization": {
            "duns": duns,
            "primaryName": name,
            "primaryAddress": {
                "addressCountry": {"isoAlpha2Code": "US", "name": "United States"},
                "postalCode": "95014",
                "streetAddress": {"line1": "1 Apple Park Way"}
            }
        },
        "matchQualityInformation": {
            "confidenceCode": confidence,
            "matchGrade": "AAAAAAAAAFA"
        }
    })
}

fn match_body(candidates: Vec<Value>) -> Value {
    json!({ "matchCandidates": candidates })
}

async fn match_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == MATCH_PATH)
        .count()
}

#[tokio::test]
async fn test_single_match_returns_ranked_candidate() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .and(query_param("name", "Apple Inc."))
        .and(query_param("countryISOAlpha2Code", "US"))
        .and(query_param("inLanguage", "auto"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(match_body(vec![candidate("060704780", "Apple Inc.", 10)])),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let query = CompanyQuery::new("Apple Inc.").with_country("US");
    let result = matcher.match_one(&query).await.unwrap();

    assert_eq!(result.candidates.len(), 1);
    let best = result.best().unwrap();
    assert_eq!(best.duns, "060704780");
    assert_eq!(best.confidence_score, 10.0);
    assert_eq!(best.matched_name, "Apple Inc.");
    assert_eq!(result.attempts, 1);
    assert_eq!(result.request_id.len(), 64);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(match_body(vec![candidate("060704780", "Apple Inc.", 10)])),
        )
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let result = matcher.match_one(&CompanyQuery::new("Apple Inc.")).await.unwrap();

    assert_eq!(result.attempts, 3);
    assert_eq!(result.candidates.len(), 1);
    assert_eq!(match_requests(&mock_server).await, 3);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&mock_server);
    config.max_attempts = 3;
    let matcher = create_matcher(&config);
    let err = matcher.match_one(&CompanyQuery::new("Acme")).await.unwrap_err();

    assert!(matches!(err.cause, AppError::TransientNetworkError(_)));
    assert_eq!(err.attempts, 3);
    assert!(err.request_id.is_some());
    assert_eq!(match_requests(&mock_server).await, 3);
}

#[tokio::test]
async fn test_unauthorized_match_is_not_retried() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let err = matcher.match_one(&CompanyQuery::new("Acme")).await.unwrap_err();

    assert!(matches!(err.cause, AppError::AuthError(_)));
    assert!(err.cause.is_fatal());
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn test_other_client_errors_are_permanent() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad parameter"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let err = matcher.match_one(&CompanyQuery::new("Acme")).await.unwrap_err();

    match err.cause {
        AppError::RequestRejected { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad parameter");
        }
        other => panic!("expected RequestRejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_match_is_an_empty_result() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"errorCode": "20505", "errorMessage": "No Match found for the given input criteria"}
        })))
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let result = matcher
        .match_one(&CompanyQuery::new("Nonexistent Widgets Ltd"))
        .await
        .unwrap();

    assert!(result.candidates.is_empty());
    assert!(result.best().is_none());
}

#[tokio::test]
async fn test_plain_not_found_is_rejected() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let err = matcher.match_one(&CompanyQuery::new("Acme")).await.unwrap_err();
    assert!(matches!(err.cause, AppError::RequestRejected { status: 404, .. }));
}

#[tokio::test]
async fn test_retry_after_overrides_backoff() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(match_body(vec![])))
        .mount(&mock_server)
        .await;

    // Computed backoff would be seconds long
    let mut config = create_test_config(&mock_server);
    config.base_delay = Duration::from_secs(5);
    config.max_delay = Duration::from_secs(30);
    let matcher = create_matcher(&config);

    let start = Instant::now();
    let result = matcher.match_one(&CompanyQuery::new("Acme")).await.unwrap();

    assert_eq!(result.attempts, 2);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_chinese_queries_request_simplified_chinese() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .and(query_param("inLanguage", "zh-hans-CN"))
        .and(query_param("streetAddressLine1", "1 Dongcheng Rd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(match_body(vec![])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let query = CompanyQuery::new("Huawei")
        .with_country("cn")
        .with_address(" 1 Dongcheng Rd ");
    let result = matcher.match_one(&query).await.unwrap();
    assert_eq!(result.query.country.as_deref(), Some("CN"));
}

#[tokio::test]
async fn test_batch_rejects_invalid_query_without_network() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(match_body(vec![candidate("123456789", "Acme", 8)])),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let queries = vec![
        CompanyQuery::new("Acme"),
        CompanyQuery::new("   "),
        CompanyQuery::new("Globex").with_country("US"),
    ];
    let outcome = matcher
        .match_batch(&queries, 3, &CancellationToken::new())
        .await;

    assert!(!outcome.cancelled);
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results[0].is_ok());
    assert!(outcome.results[2].is_ok());

    let rejected = outcome.results[1].as_ref().unwrap_err();
    assert!(matches!(rejected.cause, AppError::ValidationError(_)));
    assert_eq!(rejected.attempts, 0);
    assert!(rejected.request_id.is_none());
    assert_eq!(outcome.matched(), 2);
    assert_eq!(outcome.failed(), 1);
}

#[tokio::test]
async fn test_batch_preserves_input_order() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    let cases = [
        ("Slow", "000000001", 300),
        ("Medium", "000000002", 150),
        ("Fast", "000000003", 0),
    ];
    for (name, duns, delay_ms) in cases {
        Mock::given(method("GET"))
            .and(path(MATCH_PATH))
            .and(query_param("name", name))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(match_body(vec![candidate(duns, name, 9)]))
                    .set_delay(Duration::from_millis(delay_ms)),
            )
            .mount(&mock_server)
            .await;
    }

    let matcher = create_matcher(&create_test_config(&mock_server));
    let queries: Vec<_> = ["Slow", "Medium", "Fast"]
        .into_iter()
        .map(CompanyQuery::new)
        .collect();
    let outcome = matcher
        .match_batch(&queries, 3, &CancellationToken::new())
        .await;

    let duns: Vec<_> = outcome
        .results
        .iter()
        .map(|r| r.as_ref().unwrap().best().unwrap().duns.clone())
        .collect();
    assert_eq!(duns, vec!["000000001", "000000002", "000000003"]);
}

#[tokio::test]
async fn test_empty_batch_makes_no_calls() {
    let mock_server = MockServer::start().await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let outcome = matcher.match_batch(&[], 5, &CancellationToken::new()).await;

    assert!(outcome.results.is_empty());
    assert!(!outcome.cancelled);
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_batch_returns_partial_result() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(match_body(vec![]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let queries: Vec<_> = ["A", "B", "C", "D"].into_iter().map(CompanyQuery::new).collect();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let outcome = matcher.match_batch(&queries, 2, &cancel).await;

    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(outcome.cancelled);
    assert_eq!(outcome.results.len(), 4);
    for (result, query) in outcome.results.iter().zip(&queries) {
        let err = result.as_ref().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(&err.query, query);
    }
}

#[tokio::test]
async fn test_identical_queries_are_coalesced() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(match_body(vec![candidate("060704780", "Apple Inc.", 10)]))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let query = CompanyQuery::new("Apple Inc.").with_country("US");
    // Differently spelled but identical once normalised
    let same = CompanyQuery::new(" Apple Inc. ").with_country("us");

    let (a, b) = tokio::join!(matcher.match_one(&query), matcher.match_one(&same));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.request_id, b.request_id);

    let again = matcher.match_one(&query).await.unwrap();
    assert_eq!(again.request_id, a.request_id);
}

#[tokio::test]
async fn test_token_refresh_is_single_flight() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "tok-123", "expiresIn": 3600}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let tokens = token_store(&create_test_config(&mock_server));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.get_valid_credential().await })
        })
        .collect();

    for handle in handles {
        let credential = handle.await.unwrap().unwrap();
        assert_eq!(credential.token, "tok-123");
    }
    assert_eq!(tokens.refresh_count(), 1);
}

#[tokio::test]
async fn test_expired_token_is_refreshed() {
    let mock_server = MockServer::start().await;

    // Shorter than the safety margin, so never reusable
    Mock::given(method("POST"))
        .and(path("/v3/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "short", "expires_in": 30})),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let tokens = token_store(&create_test_config(&mock_server));
    tokens.get_valid_credential().await.unwrap();
    tokens.get_valid_credential().await.unwrap();
    assert_eq!(tokens.refresh_count(), 2);
}

#[tokio::test]
async fn test_bad_credentials_are_fatal() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid client"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server);
    let authenticator = Authenticator::new(&config).unwrap();
    let err = authenticator.authenticate().await.unwrap_err();

    assert!(matches!(err, AppError::AuthError(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unavailable_token_endpoint_becomes_auth_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&mock_server);
    config.max_attempts = 3;
    let matcher = create_matcher(&config);
    let err = matcher.match_one(&CompanyQuery::new("Acme")).await.unwrap_err();

    assert!(matches!(err.cause, AppError::AuthError(_)));
    assert_eq!(match_requests(&mock_server).await, 0);
}

#[tokio::test]
async fn test_responses_are_staged_before_reporting() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .and(query_param("name", "Acme"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(match_body(vec![candidate("123456789", "Acme", 7)])),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .and(query_param("name", "Broken"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad"))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ResponseStore::open(dir.path()).await.unwrap());
    let config = create_test_config(&mock_server);
    let matcher = create_matcher(&config).with_store(store.clone());

    let queries = vec![
        CompanyQuery::new("Acme"),
        CompanyQuery::new("Broken"),
        CompanyQuery::new(""),
    ];
    let outcome = matcher
        .match_batch(&queries, 2, &CancellationToken::new())
        .await;

    let matched = outcome.results[0].as_ref().unwrap();
    let staged = store.load(&matched.request_id).await.unwrap().unwrap();
    assert_eq!(staged.source_query.name, "Acme");
    assert!(matches!(
        staged.raw_payload,
        StagedPayload::Matched { http_status: 200, .. }
    ));

    let failed = outcome.results[1].as_ref().unwrap_err();
    let staged_failure = store
        .load(failed.request_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        staged_failure.raw_payload,
        StagedPayload::Failed { attempts: 1, .. }
    ));

    // Validation failures never reach the store
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 2);
}

#[tokio::test]
async fn test_success_replaces_staged_failure() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(match_body(vec![candidate("060704780", "Apple Inc.", 10)])),
        )
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ResponseStore::open(dir.path()).await.unwrap());
    let mut config = create_test_config(&mock_server);
    config.max_attempts = 2;
    let matcher = create_matcher(&config).with_store(store.clone());
    let query = CompanyQuery::new("Apple Inc.");

    let err = matcher.match_one(&query).await.unwrap_err();
    let request_id = err.request_id.clone().unwrap();
    let staged = store.load(&request_id).await.unwrap().unwrap();
    assert!(matches!(staged.raw_payload, StagedPayload::Failed { attempts: 2, .. }));

    // Failures are not cached, so the same query is fetched again
    let result = matcher.match_one(&query).await.unwrap();
    assert_eq!(result.request_id, request_id);
    assert_eq!(result.candidates.len(), 1);

    let staged = store.load(&request_id).await.unwrap().unwrap();
    assert!(matches!(
        staged.raw_payload,
        StagedPayload::Matched { http_status: 200, .. }
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_coalesced_failures_keep_each_callers_query() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server).await;

    Mock::given(method("GET"))
        .and(path(MATCH_PATH))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string("bad request")
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let matcher = create_matcher(&create_test_config(&mock_server));
    let query = CompanyQuery::new("Apple Inc.").with_country("US");
    let same = CompanyQuery::new(" Apple Inc. ").with_country("us");

    let (a, b) = tokio::join!(matcher.match_one(&query), matcher.match_one(&same));
    let (a, b) = (a.unwrap_err(), b.unwrap_err());

    assert_eq!(a.request_id, b.request_id);
    assert_eq!(a.query, query);
    assert_eq!(b.query, same);
    assert!(matches!(b.cause, AppError::RequestRejected { status: 400, .. }));
}

#[tokio::test]
async fn test_short_lived_token_is_shared_by_queued_callers() {
    let mock_server = MockServer::start().await;

    // Lifetime below the safety margin
    Mock::given(method("POST"))
        .and(path("/v3/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "short", "expiresIn": 30}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let tokens = token_store(&create_test_config(&mock_server));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.get_valid_credential().await })
        })
        .collect();

    for handle in handles {
        let credential = handle.await.unwrap().unwrap();
        assert_eq!(credential.token, "short");
    }
    assert_eq!(tokens.refresh_count(), 1);
}

#[tokio::test]
async fn test_token_is_requested_after_rate_limit_wait() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid client"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let limiter = Arc::new(RateLimiter::per_second(1));
    limiter.acquire().await;
    let matcher = create_matcher(&create_test_config(&mock_server)).with_limiter(limiter);

    // The token exchange fails at once, so any delay is the permit wait
    let start = Instant::now();
    let err = matcher.match_one(&CompanyQuery::new("Acme")).await.unwrap_err();

    assert!(matches!(err.cause, AppError::AuthError(_)));
    assert!(start.elapsed() >= Duration::from_millis(800));
    assert_eq!(match_requests(&mock_server).await, 0);
}
