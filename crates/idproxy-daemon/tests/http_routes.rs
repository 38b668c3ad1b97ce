//! End-to-end tests: a real listener in front of mock destinations.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use idproxy::credentials::MetadataServerProvider;
use idproxy::{
    AuthenticatedTransport, CredentialError, CredentialProvider, ErrorBody, ForwardOptions,
    Forwarder, ShutdownTrigger, shutdown,
};
use idproxy_daemon::error::Result;
use idproxy_daemon::server;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const HEALTH_PATH: &str = "/_hc";

#[derive(Default)]
struct RecordingProvider {
    audiences: Mutex<Vec<String>>,
}

#[async_trait]
impl CredentialProvider for RecordingProvider {
    async fn acquire(&self, audience: &str) -> std::result::Result<AuthenticatedTransport, CredentialError> {
        self.audiences.lock().unwrap().push(audience.to_string());
        let token = SecretString::new(format!("token-for-{audience}").into());
        AuthenticatedTransport::new(reqwest::Client::new(), audience, &token)
    }
}

struct FailingProvider;

#[async_trait]
impl CredentialProvider for FailingProvider {
    async fn acquire(&self, _audience: &str) -> std::result::Result<AuthenticatedTransport, CredentialError> {
        Err(CredentialError::Unavailable("no ambient credentials".to_string()))
    }
}

/// Answers with the request body unchanged.
struct EchoBody;

impl Respond for EchoBody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_bytes(request.body.clone())
    }
}

struct Proxy {
    addr: SocketAddr,
    trigger: ShutdownTrigger,
    handle: JoinHandle<Result<()>>,
}

impl Proxy {
    async fn start(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::start_with(credentials, http_options(), Duration::from_secs(5)).await
    }

    async fn start_with(
        credentials: Arc<dyn CredentialProvider>,
        options: ForwardOptions,
        grace: Duration,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, shutdown) = shutdown::channel();

        let app = server::router(
            Forwarder::new(credentials, options),
            shutdown.clone(),
            HEALTH_PATH,
        );
        let handle = tokio::spawn(server::run(listener, app, shutdown, grace));

        Self {
            addr,
            trigger,
            handle,
        }
    }

    /// URL on the proxy that forwards to `path` on `destination`.
    fn url_for(&self, destination: &MockServer, path: &str) -> String {
        let authority = destination.uri().trim_start_matches("http://").to_string();
        format!("http://{}/{authority}{path}", self.addr)
    }
}

fn http_options() -> ForwardOptions {
    ForwardOptions {
        scheme: "http".to_string(),
        ..ForwardOptions::default()
    }
}

#[tokio::test]
async fn test_get_is_forwarded_with_token() {
    let destination = MockServer::start().await;
    let audience = format!("{}/v1/items", destination.uri());

    Mock::given(method("GET"))
        .and(path("/v1/items"))
        .and(header("authorization", format!("Bearer token-for-{audience}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
        .expect(1)
        .mount(&destination)
        .await;

    let provider = Arc::new(RecordingProvider::default());
    let proxy = Proxy::start(provider.clone()).await;

    let response = reqwest::get(proxy.url_for(&destination, "/v1/items"))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);
    assert_eq!(*provider.audiences.lock().unwrap(), vec![audience]);
}

#[tokio::test]
async fn test_credential_failure_is_unauthorized() {
    let destination = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&destination)
        .await;

    let proxy = Proxy::start(Arc::new(FailingProvider)).await;

    let response = reqwest::get(proxy.url_for(&destination, "/v1/items"))
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "Unauthorized\n");
}

#[tokio::test]
async fn test_unreachable_destination_is_internal_error() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let authority = unused.local_addr().unwrap();
    drop(unused);

    let proxy = Proxy::start(Arc::new(RecordingProvider::default())).await;

    let response = reqwest::get(format!("http://{}/{authority}/v1/items", proxy.addr))
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "Internal Server Error\n");
}

#[tokio::test]
async fn test_legacy_error_body() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let authority = unused.local_addr().unwrap();
    drop(unused);

    let options = ForwardOptions {
        error_body: ErrorBody::Unauthorized,
        ..http_options()
    };
    let proxy = Proxy::start_with(
        Arc::new(RecordingProvider::default()),
        options,
        Duration::from_secs(5),
    )
    .await;

    let response = reqwest::get(format!("http://{}/{authority}/v1/items", proxy.addr))
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "Unauthorized\n");
}

#[tokio::test]
async fn test_liveness_does_not_forward() {
    let provider = Arc::new(RecordingProvider::default());
    let proxy = Proxy::start(provider.clone()).await;

    let response = reqwest::get(format!("http://{}{HEALTH_PATH}", proxy.addr))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().starts_with("ok:"));
    assert!(provider.audiences.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_large_body_round_trips() {
    let destination = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(EchoBody)
        .expect(1)
        .mount(&destination)
        .await;

    let proxy = Proxy::start(Arc::new(RecordingProvider::default())).await;
    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let response = reqwest::Client::new()
        .post(proxy.url_for(&destination, "/upload"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload);
}

#[tokio::test]
async fn test_empty_destination_body() {
    let destination = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/items/7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&destination)
        .await;

    let proxy = Proxy::start(Arc::new(RecordingProvider::default())).await;

    let response = reqwest::Client::new()
        .delete(proxy.url_for(&destination, "/v1/items/7"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_forwards_get_independent_tokens() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;

    for destination in [&first, &second] {
        let audience = format!("{}/who", destination.uri());
        Mock::given(method("GET"))
            .and(path("/who"))
            .and(header("authorization", format!("Bearer token-for-{audience}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(destination.uri()))
            .expect(1)
            .mount(destination)
            .await;
    }

    let provider = Arc::new(RecordingProvider::default());
    let proxy = Proxy::start(provider.clone()).await;

    let (a, b) = tokio::join!(
        reqwest::get(proxy.url_for(&first, "/who")),
        reqwest::get(proxy.url_for(&second, "/who")),
    );

    assert_eq!(a.unwrap().text().await.unwrap(), first.uri());
    assert_eq!(b.unwrap().text().await.unwrap(), second.uri());
    assert_eq!(provider.audiences.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_metadata_server_tokens_reach_destination() {
    let metadata = MockServer::start().await;
    let destination = MockServer::start().await;
    let audience = format!("{}/v1/items", destination.uri());

    Mock::given(method("GET"))
        .and(path("/computeMetadata/v1/instance/service-accounts/default/identity"))
        .and(query_param("audience", audience.as_str()))
        .and(query_param("format", "full"))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(ResponseTemplate::new(200).set_body_string("minted-token"))
        .expect(1)
        .mount(&metadata)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/items"))
        .and(header("authorization", "Bearer minted-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&destination)
        .await;

    let provider =
        MetadataServerProvider::with_base_url(reqwest::Client::new(), metadata.uri()).unwrap();
    let proxy = Proxy::start(Arc::new(provider)).await;

    let response = reqwest::get(proxy.url_for(&destination, "/v1/items"))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "[]");
}

#[tokio::test]
async fn test_in_flight_request_finishes_during_shutdown() {
    let destination = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("done")
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&destination)
        .await;

    let proxy = Proxy::start(Arc::new(RecordingProvider::default())).await;
    let in_flight = tokio::spawn(reqwest::get(proxy.url_for(&destination, "/slow")));

    tokio::time::sleep(Duration::from_millis(100)).await;
    proxy.trigger.trigger();

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "done");

    let result = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_shutdown_is_bounded_by_grace() {
    let destination = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/stuck"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&destination)
        .await;

    let proxy = Proxy::start_with(
        Arc::new(RecordingProvider::default()),
        http_options(),
        Duration::from_millis(200),
    )
    .await;
    let url = proxy.url_for(&destination, "/stuck");
    let _stuck = tokio::spawn(async move { reqwest::get(url).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    proxy.trigger.trigger();

    let result = tokio::time::timeout(Duration::from_secs(5), proxy.handle)
        .await
        .expect("server ignored the grace period")
        .unwrap();
    assert!(result.is_ok());
    assert!(started.elapsed() < Duration::from_secs(5));
}
