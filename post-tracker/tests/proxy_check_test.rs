mod common;

use common::init_tracing;
use post_tracker::proxy::append_proxy;
use post_tracker::{load_proxy_file, save_proxy_file, CheckSummary, ProxyEndpoint, ProxyValidator};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Requests are sent to the proxy in absolute form, so the mock server sees
// every probe regardless of the probe host.
const PROBE_URL: &str = "http://probe.test/ip";

fn endpoint_for(server: &MockServer) -> ProxyEndpoint {
    ProxyEndpoint::new("127.0.0.1", server.address().port())
}

fn validator(timeout: Duration) -> ProxyValidator {
    ProxyValidator::new(PROBE_URL, timeout).unwrap()
}

#[tokio::test]
async fn test_working_proxy_reports_ip_and_latency() {
    init_tracing();
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"origin": "203.0.113.7"}"#))
        .expect(1)
        .mount(&proxy)
        .await;

    let result = validator(Duration::from_secs(5)).check_endpoint(&endpoint_for(&proxy)).await;

    assert!(result.working);
    assert_eq!(result.observed_external_ip.as_deref(), Some("203.0.113.7"));
    assert!(result.latency_ms.is_some());
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_error_status_is_not_working() {
    init_tracing();
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&proxy)
        .await;

    let result = validator(Duration::from_secs(5)).check_endpoint(&endpoint_for(&proxy)).await;

    assert!(!result.working);
    assert_eq!(result.error.as_deref(), Some("status 503"));
    assert!(result.latency_ms.is_some());
    assert!(result.observed_external_ip.is_none());
}

#[tokio::test]
async fn test_redirect_is_reported_not_followed() {
    init_tracing();
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "http://elsewhere.test/"))
        .expect(1)
        .mount(&proxy)
        .await;

    let result = validator(Duration::from_secs(5)).check_endpoint(&endpoint_for(&proxy)).await;

    assert!(!result.working);
    assert_eq!(result.error.as_deref(), Some("status 302"));
}

#[tokio::test]
async fn test_dropped_connection_counts_as_connect_failure() {
    init_tracing();
    // Accepts and immediately closes: the relay never carries the request.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let result = validator(Duration::from_secs(5))
        .check_endpoint(&ProxyEndpoint::new("127.0.0.1", port))
        .await;

    assert!(!result.working);
    assert_eq!(result.error.as_deref(), Some("connect failed"));
    assert!(result.latency_ms.is_none());
}

#[tokio::test]
async fn test_slow_proxy_times_out() {
    init_tracing();
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&proxy)
        .await;

    let result = validator(Duration::from_millis(200))
        .check_endpoint(&endpoint_for(&proxy))
        .await;

    assert!(!result.working);
    assert_eq!(result.error.as_deref(), Some("timeout"));
    assert!(result.latency_ms.is_none());
}

#[tokio::test]
async fn test_unreachable_proxy_fails_to_connect() {
    init_tracing();
    let result = validator(Duration::from_secs(2))
        .check_endpoint(&ProxyEndpoint::new("127.0.0.1", 1))
        .await;

    assert!(!result.working);
    assert_eq!(result.error.as_deref(), Some("connect failed"));
}

#[tokio::test]
async fn test_credentials_are_sent_as_proxy_authorization() {
    init_tracing();
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Proxy-Authorization", "Basic YWxpY2U6czNjcjN0"))
        .respond_with(ResponseTemplate::new(200).set_body_string("198.51.100.4"))
        .mount(&proxy)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(407))
        .with_priority(10)
        .mount(&proxy)
        .await;

    let checker = validator(Duration::from_secs(5));
    let with_auth = endpoint_for(&proxy).with_credentials("alice", "s3cr3t");
    let result = checker.check_endpoint(&with_auth).await;
    assert!(result.working);
    assert_eq!(result.observed_external_ip.as_deref(), Some("198.51.100.4"));

    let result = checker.check_endpoint(&endpoint_for(&proxy)).await;
    assert_eq!(result.error.as_deref(), Some("status 407"));
}

#[tokio::test]
async fn test_check_many_returns_one_result_per_proxy() {
    init_tracing();
    let fast = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"origin": "203.0.113.1"}"#))
        .mount(&fast)
        .await;
    let slow = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"origin": "203.0.113.2"}"#)
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&slow)
        .await;

    let endpoints = vec![
        endpoint_for(&slow),
        endpoint_for(&fast),
        ProxyEndpoint::new("127.0.0.1", 1),
    ];
    let started = std::time::Instant::now();
    let results = validator(Duration::from_secs(5)).check_many(endpoints, 3).await;
    let summary = CheckSummary::from_results(&results, started.elapsed());

    assert_eq!(results.len(), 3);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.working, 2);
    // Completion order: the slow proxy does not hold up the others.
    assert_eq!(results.last().unwrap().endpoint, endpoint_for(&slow));
    assert!(results.iter().any(|r| r.error.as_deref() == Some("connect failed")));
}

#[tokio::test]
async fn test_check_many_with_no_proxies() {
    let results = validator(Duration::from_secs(1)).check_many(Vec::new(), 10).await;
    assert!(results.is_empty());
    assert_eq!(CheckSummary::from_results(&results, Duration::ZERO).working_percent(), 0.0);
}

#[tokio::test]
async fn test_proxy_file_append_save_and_load() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("proxies.txt");

    assert!(load_proxy_file(&path).await.unwrap().endpoints.is_empty());

    let (first, added) = append_proxy(&path, "10.0.0.1:8080").await.unwrap();
    assert!(added);
    let (_, added) = append_proxy(&path, " 10.0.0.1:8080 ").await.unwrap();
    assert!(!added);
    append_proxy(&path, "proxy.local:3128:bob:pw").await.unwrap();
    assert!(append_proxy(&path, "10.0.0.1").await.is_err());

    std::fs::write(&path, format!("{}\n# spare\nbroken line\n", std::fs::read_to_string(&path).unwrap())).unwrap();
    let list = load_proxy_file(&path).await.unwrap();
    assert_eq!(list.endpoints.len(), 2);
    assert_eq!(list.rejected.len(), 1);
    assert_eq!(list.endpoints[0], first);
    assert_eq!(list.endpoints[1].username.as_deref(), Some("bob"));

    save_proxy_file(&path, &list.endpoints[1..]).await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "proxy.local:3128:bob:pw\n");
}
