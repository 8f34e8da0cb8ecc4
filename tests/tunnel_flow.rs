//! End-to-end tunnel flows over real sockets: server, client, and a local
//! service wired together on ephemeral ports.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use openport::client::{Client, ClientError, Config as ClientConfig, Events, NoopEvents, RequestLog};
use openport::server::{Config as ServerConfig, Server};

/// Records what the client reports to its presentation layer.
#[derive(Default)]
struct Captured {
    url: Mutex<Option<String>>,
    logs: Mutex<Vec<RequestLog>>,
}

impl Events for Captured {
    fn on_connected(&self, url: &str) {
        *self.url.lock().unwrap() = Some(url.to_string());
    }

    fn on_request(&self, log: &RequestLog) {
        self.logs.lock().unwrap().push(log.clone());
    }
}

/// A local HTTP service answering "hi" on `/` and echoing any other path.
async fn spawn_local_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let path = req.uri().path().to_string();
                    let body = if path == "/" {
                        "hi".to_string()
                    } else {
                        format!("echo:{path}")
                    };
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

async fn start_server() -> Arc<Server> {
    let server = Arc::new(
        Server::bind(ServerConfig {
            addr: ":0".to_string(),
            tunnel_addr: "127.0.0.1:0".to_string(),
            domain: "localhost".to_string(),
        })
        .await
        .unwrap(),
    );
    let srv = server.clone();
    tokio::spawn(async move {
        let _ = srv.run().await;
    });
    server
}

struct TestClient {
    client: Arc<Client>,
    events: Arc<Captured>,
    url: String,
}

/// Connects a client and waits for the tunnel to come up.
async fn connect_client(server: &Server, local: SocketAddr, subdomain: &str) -> TestClient {
    let events = Arc::new(Captured::default());
    let client = Arc::new(Client::new(ClientConfig {
        server_addr: server.tunnel_addr().to_string(),
        local_addr: local.to_string(),
        subdomain: subdomain.to_string(),
        events: events.clone(),
    }));
    let connecting = client.clone();
    tokio::spawn(async move {
        let _ = connecting.connect().await;
    });

    let url = {
        let events = events.clone();
        poll_until(move || {
            let events = events.clone();
            async move { events.url.lock().unwrap().clone() }
        })
        .await
    };

    TestClient {
        client,
        events,
        url,
    }
}

/// One raw HTTP/1.1 request against the server's public port, with full
/// control over the Host header.
async fn http_get(server: &Server, host: &str, path: &str) -> (u16, String) {
    let addr = SocketAddr::from(([127, 0, 0, 1], server.public_addr().port()));
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).into_owned();

    let status = text
        .split_whitespace()
        .nth(1)
        .expect("status line")
        .parse()
        .expect("status code");
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn poll_until<F, Fut, T>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not met within 10s");
        sleep(Duration::from_millis(20)).await;
    }
}

/// Retries a public request until it produces the expected status; requests
/// can race the registration that makes them routable.
async fn get_until_status(server: &Server, host: &str, path: &str, expected: u16) -> String {
    poll_until(move || async move {
        let (status, body) = http_get(server, host, path).await;
        (status == expected).then_some(body)
    })
    .await
}

#[tokio::test]
async fn happy_path_round_trip() {
    let local = spawn_local_service().await;
    let server = start_server().await;
    let tunnel = connect_client(&server, local, "demo").await;

    assert_eq!(
        tunnel.url,
        format!("http://demo.localhost:{}", server.public_addr().port())
    );

    let body = get_until_status(&server, "demo.localhost", "/", 200).await;
    assert_eq!(body, "hi");

    let logs = tunnel.events.logs.lock().unwrap();
    let log = logs.last().expect("request reported");
    assert_eq!(log.method, "GET");
    assert_eq!(log.path, "/");
    assert_eq!(log.status, 200);
}

#[tokio::test]
async fn empty_subdomain_gets_random_label() {
    let local = spawn_local_service().await;
    let server = start_server().await;
    let tunnel = connect_client(&server, local, "").await;

    let label = tunnel
        .url
        .strip_prefix("http://")
        .and_then(|rest| rest.split('.').next())
        .unwrap()
        .to_string();
    assert_eq!(label.len(), 8);
    assert!(label
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));

    let body = get_until_status(&server, &format!("{label}.localhost"), "/", 200).await;
    assert_eq!(body, "hi");
}

#[tokio::test]
async fn second_client_requesting_taken_subdomain_is_rejected() {
    let local = spawn_local_service().await;
    let server = start_server().await;
    let _first = connect_client(&server, local, "taken").await;

    let second = Client::new(ClientConfig {
        server_addr: server.tunnel_addr().to_string(),
        local_addr: local.to_string(),
        subdomain: "taken".to_string(),
        events: Arc::new(NoopEvents),
    });
    let err = timeout(Duration::from_secs(10), second.connect())
        .await
        .expect("handshake finishes")
        .unwrap_err();
    match err {
        ClientError::SubdomainTaken { subdomain } => assert_eq!(subdomain, "taken"),
        other => panic!("expected SubdomainTaken, got {other:?}"),
    }

    // The established tunnel is unaffected.
    let body = get_until_status(&server, "taken.localhost", "/", 200).await;
    assert_eq!(body, "hi");
}

#[tokio::test]
async fn unknown_subdomain_is_404() {
    let server = start_server().await;
    let (status, body) = http_get(&server, "ghost.localhost", "/").await;
    assert_eq!(status, 404);
    assert_eq!(body, r#"openport: tunnel "ghost" not found"#);
}

#[tokio::test]
async fn host_without_subdomain_is_400() {
    let server = start_server().await;
    let (status, body) = http_get(&server, "localhost", "/").await;
    assert_eq!(status, 400);
    assert_eq!(body, "openport: no tunnel specified");
}

#[tokio::test]
async fn disconnect_frees_the_subdomain() {
    let local = spawn_local_service().await;
    let server = start_server().await;
    let tunnel = connect_client(&server, local, "demo").await;

    get_until_status(&server, "demo.localhost", "/", 200).await;

    tunnel.client.close().await;
    get_until_status(&server, "demo.localhost", "/", 404).await;

    // The label is registrable again.
    let tunnel = connect_client(&server, local, "demo").await;
    assert_eq!(
        tunnel.url,
        format!("http://demo.localhost:{}", server.public_addr().port())
    );
    let body = get_until_status(&server, "demo.localhost", "/", 200).await;
    assert_eq!(body, "hi");
}

#[tokio::test]
async fn concurrent_requests_get_their_own_responses() {
    let local = spawn_local_service().await;
    let server = start_server().await;
    let _tunnel = connect_client(&server, local, "echo").await;

    get_until_status(&server, "echo.localhost", "/", 200).await;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let server = server.clone();
        tasks.spawn(async move {
            let (status, body) = http_get(&server, "echo.localhost", &format!("/r{i}")).await;
            (i, status, body)
        });
    }
    while let Some(result) = tasks.join_next().await {
        let (i, status, body) = result.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, format!("echo:/r{i}"));
    }
}
