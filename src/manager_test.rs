use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tokio::time::Instant;

use super::*;
use crate::backoff::BackoffConfig;
use crate::routing::RouteRule;
use crate::session::GaugeGuard;
use crate::test_support::FakeConnector;

const ENDPOINT: &str = "ws://backend.test/rs";

/// HTTP backend that records calls and answers with the path it saw.
struct RecordingHttp {
    calls: StdMutex<Vec<HttpCall>>,
    _slot: GaugeGuard,
}

impl RecordingHttp {
    fn new(gauge: &ResourceGauge) -> Self {
        Self { calls: StdMutex::new(Vec::new()), _slot: gauge.acquire() }
    }

    fn paths(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").iter().map(|c| c.path.clone()).collect()
    }
}

#[async_trait]
impl HttpBackend for RecordingHttp {
    async fn execute(&self, call: HttpCall) -> Result<Response, SdkError> {
        let path = call.path.clone();
        self.calls.lock().expect("calls lock").push(call);
        Ok(Response::Single(json!({ "via": "http", "path": path })))
    }
}

fn policy() -> RoutingPolicy {
    RoutingPolicy::new()
        .route("echo", RouteRule::stream(Interaction::RequestResponse))
        .route("fail", RouteRule::stream(Interaction::RequestResponse))
        .route("items", RouteRule::stream(Interaction::RequestStream))
        .route("endless", RouteRule::stream(Interaction::RequestStream))
        .route("telemetry", RouteRule::stream(Interaction::FireAndForget))
        .route(
            "lookup",
            RouteRule::stream(Interaction::RequestResponse).with_http_fallback(Method::GET, "/lookup/{id}"),
        )
        .route("hang", RouteRule::stream(Interaction::RequestResponse).with_http_fallback(Method::GET, "/hang"))
        .route("stall", RouteRule::stream(Interaction::RequestResponse))
        .route("stall.stream", RouteRule::stream(Interaction::RequestStream))
        .route("upload", RouteRule::http(Method::POST, "/upload"))
}

fn fast_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(100),
        max: Duration::from_millis(1_000),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts,
    }
}

fn config() -> SdkConfig {
    SdkConfig::default().with_call_timeout(Duration::from_secs(5)).with_backoff(fast_backoff(5))
}

struct Harness {
    manager: SessionManager,
    connector: FakeConnector,
    http: Arc<RecordingHttp>,
}

fn harness(config: SdkConfig) -> Harness {
    let gauge = ResourceGauge::new();
    let connector = FakeConnector::default();
    let http = Arc::new(RecordingHttp::new(&gauge));
    let manager = SessionManager::from_parts(
        config,
        policy(),
        Arc::new(connector.clone()),
        Some(http.clone() as Arc<dyn HttpBackend>),
        gauge,
    );
    Harness { manager, connector, http }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn requests_for(backend: &crate::test_support::BackendHandle, route: &str) -> usize {
    backend.received().iter().filter(|f| f.route == route && f.status == frames::Status::Request).count()
}

fn assert_gap(from: Instant, to: Instant, expected_ms: u64) {
    let gap = to.duration_since(from);
    let expected = Duration::from_millis(expected_ms);
    assert!(gap >= expected && gap <= expected + Duration::from_millis(5), "gap {gap:?}, expected ~{expected:?}");
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn connect_then_close_releases_every_handle() {
    let gauge = ResourceGauge::new();
    let http: Arc<dyn HttpBackend> = Arc::new(RecordingHttp::new(&gauge));
    let manager =
        SessionManager::from_parts(config(), policy(), Arc::new(FakeConnector::default()), Some(http), gauge);

    manager.connect(ENDPOINT).await.unwrap();
    assert_eq!(manager.state(), SessionState::Connected);
    assert_eq!(manager.open_handles(), 2);

    manager.close().await;
    assert_eq!(manager.open_handles(), 0);
    assert_eq!(manager.state(), SessionState::Disconnected);
    assert!(manager.session().closed);
}

#[tokio::test]
async fn close_is_idempotent() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();

    h.manager.close().await;
    h.manager.close().await;
    assert_eq!(h.manager.state(), SessionState::Disconnected);

    let err = h.manager.call(Request::new("echo", json!({}))).await.unwrap_err();
    assert!(matches!(err, SdkError::Closed));
    assert!(matches!(h.manager.connect(ENDPOINT).await, Err(SdkError::Closed)));
}

#[tokio::test]
async fn close_without_connect_drops_http_client() {
    let gauge = ResourceGauge::new();
    let http: Arc<dyn HttpBackend> = Arc::new(RecordingHttp::new(&gauge));
    let manager = SessionManager::from_parts(config(), policy(), Arc::new(FakeConnector::default()), Some(http), gauge);
    assert_eq!(manager.open_handles(), 1);

    manager.close().await;
    assert_eq!(manager.open_handles(), 0);
}

#[tokio::test]
async fn dropping_last_handle_releases_channel() {
    let gauge = ResourceGauge::new();
    let manager =
        SessionManager::from_parts(config(), policy(), Arc::new(FakeConnector::default()), None, gauge.clone());
    manager.connect(ENDPOINT).await.unwrap();
    assert_eq!(gauge.count(), 1);

    drop(manager);
    eventually(|| gauge.count() == 0).await;
}

#[tokio::test]
async fn concurrent_connects_share_one_handshake() {
    let h = harness(config());
    let connects: Vec<_> = (0..10)
        .map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.connect(ENDPOINT).await })
        })
        .collect();
    for connect in connects {
        connect.await.expect("join").expect("connect");
    }

    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.manager.state(), SessionState::Connected);
    assert_eq!(h.manager.session().endpoint.as_deref(), Some(ENDPOINT));
}

#[tokio::test]
async fn refused_connect_reports_connection_error() {
    let h = harness(config());
    h.connector.refuse(1);

    let err = h.manager.connect(ENDPOINT).await.unwrap_err();
    assert!(err.is_connection());
    let session = h.manager.session();
    assert_eq!(session.state, SessionState::Disconnected);
    assert!(session.last_error.is_some());

    h.manager.connect(ENDPOINT).await.unwrap();
    assert_eq!(h.manager.state(), SessionState::Connected);
    assert!(h.manager.session().last_error.is_none());
}

#[tokio::test]
async fn connect_configured_requires_stream_url() {
    let h = harness(config());
    assert!(matches!(h.manager.connect_configured().await, Err(SdkError::Config(_))));
}

#[tokio::test]
async fn wait_for_state_times_out() {
    let h = harness(config());
    assert!(!h.manager.wait_for_state(SessionState::Connected, Duration::from_millis(20)).await);
    assert!(h.manager.wait_for_state(SessionState::Disconnected, Duration::from_millis(20)).await);
}

// =============================================================================
// ROUTING
// =============================================================================

#[tokio::test]
async fn streaming_only_call_before_connect_is_not_connected() {
    let h = harness(config());
    let err = h.manager.call(Request::new("echo", json!({}))).await.unwrap_err();
    assert!(matches!(err, SdkError::NotConnected));
    assert_eq!(h.connector.attempts(), 0);
}

#[tokio::test]
async fn call_before_connect_uses_http_fallback() {
    let h = harness(config());
    let response = h.manager.call(Request::new("lookup", json!({"id": 7}))).await.unwrap();
    assert_eq!(response, Response::Single(json!({"via": "http", "path": "/lookup/7"})));
    assert_eq!(h.http.paths(), vec!["/lookup/7".to_owned()]);
}

#[tokio::test]
async fn http_only_route_never_needs_connect() {
    let h = harness(config());
    let response = h.manager.call(Request::new("upload", json!({"name": "a"}))).await.unwrap();
    assert_eq!(response.into_value()["path"], "/upload");
    assert_eq!(h.connector.attempts(), 0);
    assert!(h.manager.session().last_activity_ms.is_some());
}

#[tokio::test]
async fn connected_calls_use_streaming_per_interaction() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();

    let single = h.manager.call(Request::new("echo", json!({"a": 1}))).await.unwrap();
    assert_eq!(single, Response::Single(json!({"a": 1})));

    let many = h.manager.call(Request::new("items", json!({"count": 2}))).await.unwrap();
    assert_eq!(many, Response::Many(vec![json!({"n": 0}), json!({"n": 1})]));

    let none = h.manager.call(Request::new("telemetry", json!({"x": 1}))).await.unwrap();
    assert_eq!(none, Response::Empty);

    let looked_up = h.manager.call(Request::new("lookup", json!({"id": 1}))).await.unwrap();
    assert_eq!(looked_up, Response::Single(json!({"route": "lookup"})));
    assert!(h.http.paths().is_empty());

    let backend = h.connector.latest_backend();
    eventually(|| backend.received().iter().any(|f| f.route == "telemetry")).await;
    assert_eq!(h.manager.session().transport, crate::routing::TransportKind::Streaming);
}

#[tokio::test]
async fn remote_errors_are_not_retried() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();

    let err = h.manager.call(Request::new("fail", json!({}))).await.unwrap_err();
    assert!(matches!(err, SdkError::Remote { ref code, .. } if code == "E_TEST"));
    let backend = h.connector.latest_backend();
    assert_eq!(backend.received().iter().filter(|f| f.route == "fail").count(), 1);
}

#[tokio::test]
async fn streaming_timeout_falls_back_to_http() {
    let h = harness(config().with_call_timeout(Duration::from_millis(100)).with_max_call_retries(0));
    h.manager.connect(ENDPOINT).await.unwrap();

    let response = h.manager.call(Request::new("hang", json!({}))).await.unwrap();
    assert_eq!(response.into_value()["via"], "http");
    assert_eq!(h.http.paths(), vec!["/hang".to_owned()]);
}

#[tokio::test]
async fn reply_timeout_on_live_channel_is_sent_once() {
    let h = harness(config().with_call_timeout(Duration::from_millis(100)));
    h.manager.connect(ENDPOINT).await.unwrap();

    let err = h.manager.call(Request::new("stall", json!({}))).await.unwrap_err();
    assert!(matches!(err, SdkError::Transport(ref msg) if msg.contains("timed out")), "unexpected error: {err:?}");

    let backend = h.connector.latest_backend();
    eventually(|| backend.cancels().len() == 1).await;
    assert_eq!(requests_for(&backend, "stall"), 1);
    assert_eq!(h.manager.state(), SessionState::Connected);
}

#[tokio::test]
async fn unfinished_stream_call_is_bounded_by_call_timeout() {
    let h = harness(config().with_call_timeout(Duration::from_millis(100)));
    h.manager.connect(ENDPOINT).await.unwrap();

    let err = h.manager.call(Request::new("stall.stream", json!({}))).await.unwrap_err();
    assert!(matches!(err, SdkError::Transport(ref msg) if msg == "stall.stream timed out"), "unexpected error: {err:?}");

    let backend = h.connector.latest_backend();
    eventually(|| backend.cancels().len() == 1).await;
    assert_eq!(requests_for(&backend, "stall.stream"), 1);
}

#[tokio::test]
async fn cancelled_call_sends_cancel_frame() {
    let h = harness(config().with_max_call_retries(0));
    h.manager.connect(ENDPOINT).await.unwrap();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = h.manager.call_with_cancel(Request::new("hang", json!({})), &token).await.unwrap_err();
    assert!(matches!(err, SdkError::Cancelled));
    let backend = h.connector.latest_backend();
    eventually(|| backend.cancels().len() == 1).await;
    assert!(h.http.paths().is_empty());
}

#[tokio::test]
async fn subscribe_yields_items_until_cancelled() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();

    let mut subscription = h.manager.subscribe(Request::new("endless", json!({}))).await.unwrap();
    assert_eq!(subscription.next().await.expect("item").unwrap(), json!({"tick": true}));
    assert_eq!(subscription.next().await.expect("item").unwrap(), json!({"tick": true}));
    subscription.cancel();
    assert!(subscription.next().await.is_none());

    let backend = h.connector.latest_backend();
    eventually(|| backend.cancels().len() == 1).await;
}

#[tokio::test]
async fn subscribe_on_http_route_is_protocol_error() {
    let h = harness(config());
    let err = h.manager.subscribe(Request::new("upload", json!({}))).await.unwrap_err();
    assert!(err.is_protocol());
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[tokio::test]
async fn concurrent_calls_keep_session_consistent() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();

    let calls: Vec<_> = (0..32)
        .map(|i| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.call(Request::new("echo", json!({"i": i}))).await })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        let response = call.await.expect("join").expect("call");
        assert_eq!(response, Response::Single(json!({"i": i})));
    }

    let session = h.manager.session();
    assert_eq!(session.state, SessionState::Connected);
    assert_eq!(session.reconnects, 0);
    assert!(session.last_error.is_none());
    assert!(session.last_activity_ms.is_some());
    assert_eq!(h.connector.attempts(), 1);
}

// =============================================================================
// RECONNECT
// =============================================================================

#[tokio::test(start_paused = true)]
async fn transient_drop_reconnects_once_per_backoff_interval() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();
    h.connector.refuse(2);

    let dropped_at = Instant::now();
    h.connector.latest_backend().drop_connection();

    assert!(h.manager.wait_for_state(SessionState::Disconnected, Duration::from_secs(30)).await);
    assert!(h.manager.wait_for_state(SessionState::Connected, Duration::from_secs(30)).await);
    // Initial connect plus three reconnects: two refused, one accepted.
    let times = h.connector.attempt_times();
    assert_eq!(times.len(), 4);
    assert_gap(dropped_at, times[1], 100);
    assert_gap(times[1], times[2], 200);
    assert_gap(times[2], times[3], 400);
    assert_eq!(h.manager.session().reconnects, 3);

    let response = h.manager.call(Request::new("echo", json!({"ok": true}))).await.unwrap();
    assert_eq!(response, Response::Single(json!({"ok": true})));
}

#[tokio::test(start_paused = true)]
async fn drop_straight_after_connect_is_noticed() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();
    h.connector.latest_backend().drop_connection();

    assert!(h.manager.wait_for_state(SessionState::Disconnected, Duration::from_secs(5)).await);
    assert!(h.manager.wait_for_state(SessionState::Connected, Duration::from_secs(5)).await);
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.manager.session().reconnects, 1);

    let response = h.manager.call(Request::new("echo", json!({"back": true}))).await.unwrap();
    assert_eq!(response, Response::Single(json!({"back": true})));
}

#[tokio::test(start_paused = true)]
async fn fallback_route_skips_wait_during_outage() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();
    h.connector.refuse(100);
    h.connector.latest_backend().drop_connection();
    assert!(h.manager.wait_for_state(SessionState::Disconnected, Duration::from_secs(5)).await);

    let started = Instant::now();
    let response = h.manager.call(Request::new("lookup", json!({"id": 9}))).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100), "fallback waited {:?}", started.elapsed());
    assert_eq!(response.into_value()["via"], "http");
    assert_eq!(h.http.paths(), vec!["/lookup/9".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn call_during_outage_waits_for_reconnect() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();
    h.connector.refuse(1);
    h.connector.latest_backend().drop_connection();

    let response = h.manager.call(Request::new("echo", json!({"after": "drop"}))).await.unwrap();
    assert_eq!(response, Response::Single(json!({"after": "drop"})));
    assert_eq!(h.connector.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnect_surfaces_transport_error() {
    let h = harness(config().with_backoff(fast_backoff(2)));
    h.manager.connect(ENDPOINT).await.unwrap();
    h.connector.refuse(10);
    h.connector.latest_backend().drop_connection();

    let manager = h.manager.clone();
    eventually(move || manager.session().last_error.is_some_and(|e| e.contains("gave up"))).await;
    assert_eq!(h.connector.attempts(), 3);
    assert_eq!(h.manager.state(), SessionState::Disconnected);

    let err = h.manager.call(Request::new("echo", json!({}))).await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {err:?}");

    // Routes with a fallback keep working over HTTP.
    let response = h.manager.call(Request::new("lookup", json!({"id": 3}))).await.unwrap();
    assert_eq!(response.into_value()["via"], "http");

    // An explicit connect brings streaming back and the supervisor resumes.
    h.connector.refuse(0);
    h.manager.connect(ENDPOINT).await.unwrap();
    assert_eq!(h.manager.state(), SessionState::Connected);
    h.connector.latest_backend().drop_connection();
    assert!(h.manager.wait_for_state(SessionState::Disconnected, Duration::from_secs(5)).await);
    assert!(h.manager.wait_for_state(SessionState::Connected, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn close_during_reconnect_stops_supervisor() {
    let h = harness(config());
    h.manager.connect(ENDPOINT).await.unwrap();
    h.connector.refuse(100);
    h.connector.latest_backend().drop_connection();
    assert!(h.manager.wait_for_state(SessionState::Disconnected, Duration::from_secs(1)).await);

    h.manager.close().await;
    let attempts = h.connector.attempts();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.connector.attempts(), attempts);
    assert_eq!(h.manager.state(), SessionState::Disconnected);
}
