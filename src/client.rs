use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_yamux::{config::Config as YamuxConfig, session::Session, stream::StreamHandle, Control};
use tracing::{debug, warn};

use crate::tunnel::{self, Handshake};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long the pre-flight dial to the local service may take.
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Metadata for one forwarded request, handed to the presentation layer.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    pub timestamp: SystemTime,
}

/// Presentation hooks. The data plane only ever talks to the terminal
/// through these.
pub trait Events: Send + Sync {
    fn on_connected(&self, _url: &str) {}
    fn on_request(&self, _log: &RequestLog) {}
}

/// Stand-in when no presentation layer is wired up.
pub struct NoopEvents;

impl Events for NoopEvents {}

/// Why the tunnel could not be established or keep running. Each variant
/// carries enough context for the presentation layer to say something
/// useful.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Nothing answered the pre-flight dial to the local service.
    #[error("local service not reachable ({detail})")]
    LocalNotReachable {
        addr: String,
        detail: String,
        #[source]
        source: Option<BoxError>,
    },
    /// Dial, handshake, or a server-side rejection other than a taken
    /// subdomain.
    #[error("server unreachable ({detail})")]
    ServerUnreachable {
        addr: String,
        detail: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("subdomain {subdomain:?} is already in use")]
    SubdomainTaken { subdomain: String },
    /// The multiplex session ended after the tunnel was up.
    #[error("connection lost ({detail})")]
    ConnectionLost {
        addr: String,
        detail: String,
        #[source]
        source: Option<BoxError>,
    },
}

#[derive(Clone)]
pub struct Config {
    /// Tunnel server address, e.g. "tunnel.example.com:9090".
    pub server_addr: String,
    /// Local service to expose, e.g. "localhost:3000".
    pub local_addr: String,
    /// Requested subdomain; empty for a server-assigned one.
    pub subdomain: String,
    pub events: Arc<dyn Events>,
}

/// Connects to the tunnel server and forwards incoming requests to a local
/// service.
pub struct Client {
    cfg: Config,
    control: Mutex<Option<Control>>,
}

impl Client {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            control: Mutex::new(None),
        }
    }

    /// Establishes the tunnel and serves forwarded requests until the
    /// session ends. Returns only on failure; a clean teardown goes through
    /// `close`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        // Fail fast when nothing is listening locally, before touching the
        // server.
        match timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&self.cfg.local_addr)).await {
            Ok(Ok(probe)) => drop(probe),
            Ok(Err(e)) => {
                return Err(ClientError::LocalNotReachable {
                    addr: self.cfg.local_addr.clone(),
                    detail: format!("port {}", self.local_port()),
                    source: Some(e.into()),
                })
            }
            Err(_) => {
                return Err(ClientError::LocalNotReachable {
                    addr: self.cfg.local_addr.clone(),
                    detail: format!("port {}", self.local_port()),
                    source: None,
                })
            }
        }

        let mut conn = TcpStream::connect(&self.cfg.server_addr).await.map_err(|e| {
            ClientError::ServerUnreachable {
                addr: self.cfg.server_addr.clone(),
                detail: self.cfg.server_addr.clone(),
                source: Some(e.into()),
            }
        })?;

        tunnel::write_handshake(
            &mut conn,
            &Handshake {
                subdomain: self.cfg.subdomain.clone(),
            },
        )
        .await
        .map_err(|e| ClientError::ServerUnreachable {
            addr: self.cfg.server_addr.clone(),
            detail: "handshake failed".to_string(),
            source: Some(e.into()),
        })?;

        let resp = tunnel::read_handshake_resp(&mut conn).await.map_err(|e| {
            ClientError::ServerUnreachable {
                addr: self.cfg.server_addr.clone(),
                detail: "no response from server".to_string(),
                source: Some(e.into()),
            }
        })?;

        if !resp.error.is_empty() {
            if resp.error.contains("already in use") {
                return Err(ClientError::SubdomainTaken {
                    subdomain: self.cfg.subdomain.clone(),
                });
            }
            return Err(ClientError::ServerUnreachable {
                addr: self.cfg.server_addr.clone(),
                detail: resp.error,
                source: None,
            });
        }

        self.cfg.events.on_connected(&resp.url);

        // The client dialed out but is the yamux accept side; the server
        // opens one stream per forwarded request.
        let mut session = Session::new_server(conn, YamuxConfig::default());
        *self.control.lock().await = Some(session.control());

        loop {
            match session.next().await {
                Some(Ok(stream)) => {
                    let local_addr = self.cfg.local_addr.clone();
                    let events = self.cfg.events.clone();
                    tokio::spawn(handle_stream(stream, local_addr, events));
                }
                Some(Err(e)) => {
                    return Err(ClientError::ConnectionLost {
                        addr: self.cfg.server_addr.clone(),
                        detail: "tunnel disconnected".to_string(),
                        source: Some(e.into()),
                    });
                }
                None => {
                    return Err(ClientError::ConnectionLost {
                        addr: self.cfg.server_addr.clone(),
                        detail: "tunnel disconnected".to_string(),
                        source: None,
                    });
                }
            }
        }
    }

    /// Tears down the multiplex session; a pending `connect` then returns.
    pub async fn close(&self) {
        if let Some(mut control) = self.control.lock().await.take() {
            let _ = control.close().await;
        }
    }

    fn local_port(&self) -> &str {
        self.cfg
            .local_addr
            .rsplit_once(':')
            .map_or("", |(_, port)| port)
    }
}

/// Serves one forwarded request: hyper parses it off the stream, we
/// re-issue it locally and hyper writes the response back. The stream
/// closes when this returns.
async fn handle_stream(stream: StreamHandle, local_addr: String, events: Arc<dyn Events>) {
    let service = service_fn(move |req: Request<Incoming>| {
        let local_addr = local_addr.clone();
        let events = events.clone();
        async move { proxy_request(req, &local_addr, events.as_ref()).await }
    });

    if let Err(e) = server_http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "forwarded stream ended with error");
    }
}

async fn proxy_request(
    req: Request<Incoming>,
    local_addr: &str,
    events: &dyn Events,
) -> Result<Response<BoxBody>> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let timestamp = SystemTime::now();
    let start = Instant::now();

    let result = forward_to_local(req, local_addr).await;
    let duration = start.elapsed();

    match result {
        Ok(resp) => {
            events.on_request(&RequestLog {
                method,
                path,
                status: resp.status().as_u16(),
                duration,
                timestamp,
            });
            Ok(resp.map(BodyExt::boxed))
        }
        Err(e) => {
            warn!(error = %e, "local request failed");
            events.on_request(&RequestLog {
                method,
                path,
                status: StatusCode::BAD_GATEWAY.as_u16(),
                duration,
                timestamp,
            });
            // A failed local request is a per-request event, not a
            // tunnel-level fault. Minimal 502, no body.
            Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(empty_body())
                .unwrap())
        }
    }
}

/// Re-issues the request against the local service over a fresh connection.
async fn forward_to_local(
    mut req: Request<Incoming>,
    local_addr: &str,
) -> Result<Response<Incoming>> {
    let stream = TcpStream::connect(local_addr).await?;
    let (mut sender, conn) = client_http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "local connection error");
        }
    });

    // Point the request at the local service; the origin-form path is kept
    // and the request line is rebuilt from it.
    req.headers_mut()
        .insert(hyper::header::HOST, local_addr.parse()?);

    Ok(sender.send_request(req).await?)
}

fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
