use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::HOST;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_yamux::{config::Config as YamuxConfig, session::Session};
use tracing::{debug, error, info, warn};

use crate::registry::{Registry, RegistryError};
use crate::tunnel::{self, HandshakeResp, Tunnel};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Server configuration. Addresses use the `host:port` form; a bare `:port`
/// listens on all interfaces, matching how the tool is deployed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public HTTP address end users hit, e.g. ":8080".
    pub addr: String,
    /// Address tunnel clients dial, e.g. ":9090".
    pub tunnel_addr: String,
    /// Base domain under which tunnels are published, e.g. "localhost".
    pub domain: String,
}

/// Accepts tunnel clients on one port and proxies public HTTP traffic to
/// them from another.
pub struct Server {
    cfg: Config,
    registry: Arc<Registry>,
    /// Part of the advertised URL after the subdomain and domain. The
    /// configured literal, except an OS-assigned port resolves to the port
    /// actually bound.
    url_addr: String,
    public_addr: SocketAddr,
    tunnel_addr: SocketAddr,
    public_listener: Mutex<Option<TcpListener>>,
    tunnel_listener: Mutex<Option<TcpListener>>,
}

impl Server {
    /// Binds both listeners. The server does not accept anything until
    /// `run`.
    pub async fn bind(cfg: Config) -> Result<Self> {
        let tunnel_listener = TcpListener::bind(bind_addr(&cfg.tunnel_addr))
            .await
            .with_context(|| format!("tunnel listen on {}", cfg.tunnel_addr))?;
        let public_listener = TcpListener::bind(bind_addr(&cfg.addr))
            .await
            .with_context(|| format!("public listen on {}", cfg.addr))?;

        let public_addr = public_listener.local_addr()?;
        let tunnel_addr = tunnel_listener.local_addr()?;
        let url_addr = url_addr(&cfg.addr, public_addr);

        Ok(Self {
            cfg,
            registry: Arc::new(Registry::new()),
            url_addr,
            public_addr,
            tunnel_addr,
            public_listener: Mutex::new(Some(public_listener)),
            tunnel_listener: Mutex::new(Some(tunnel_listener)),
        })
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_addr
    }

    /// Serves both listeners until one of them fails or the future is
    /// dropped.
    pub async fn run(&self) -> Result<()> {
        let tunnel_listener = self
            .tunnel_listener
            .lock()
            .unwrap()
            .take()
            .context("server is already running")?;
        let public_listener = self
            .public_listener
            .lock()
            .unwrap()
            .take()
            .context("server is already running")?;

        info!(
            addr = %self.cfg.addr,
            tunnel_addr = %self.cfg.tunnel_addr,
            domain = %self.cfg.domain,
            "server listening"
        );

        tokio::try_join!(
            self.accept_tunnels(tunnel_listener),
            self.serve_public(public_listener),
        )?;
        Ok(())
    }

    /// Closes every live tunnel session. The per-tunnel tasks observe the
    /// close, unregister, and exit.
    pub async fn shutdown(&self) {
        info!("closing all tunnel sessions");
        self.registry.close_all().await;
    }

    async fn accept_tunnels(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (conn, peer) = listener.accept().await.context("tunnel accept")?;
            debug!(peer = %peer, "tunnel connection accepted");
            let registry = self.registry.clone();
            let domain = self.cfg.domain.clone();
            let url_addr = self.url_addr.clone();
            tokio::spawn(async move {
                handle_tunnel(registry, domain, url_addr, conn).await;
            });
        }
    }

    async fn serve_public(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("public accept")?;
            let registry = self.registry.clone();
            let domain = self.cfg.domain.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    handle_public(registry.clone(), domain.clone(), req)
                });
                if let Err(e) = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(peer = %peer, error = %e, "public connection error");
                }
            });
        }
    }
}

/// Runs one control connection from handshake to session close.
async fn handle_tunnel(
    registry: Arc<Registry>,
    domain: String,
    url_addr: String,
    mut conn: TcpStream,
) {
    let hs = match tunnel::read_handshake(&mut conn).await {
        Ok(hs) => hs,
        Err(e) => {
            warn!(error = %e, "tunnel handshake failed");
            return;
        }
    };

    // Claim the label before answering; the loser of a race gets its
    // rejection here, never a success response.
    let subdomain = match registry.register(&hs.subdomain).await {
        Ok(label) => label,
        Err(e @ RegistryError::Conflict(_)) => {
            let resp = HandshakeResp {
                error: e.to_string(),
                ..Default::default()
            };
            if let Err(e) = tunnel::write_handshake_resp(&mut conn, &resp).await {
                debug!(error = %e, "failed to send rejection");
            }
            return;
        }
    };

    let url = format!("http://{subdomain}.{domain}{url_addr}");
    let resp = HandshakeResp {
        subdomain: subdomain.clone(),
        url: url.clone(),
        error: String::new(),
    };
    if let Err(e) = tunnel::write_handshake_resp(&mut conn, &resp).await {
        warn!(subdomain = %subdomain, error = %e, "failed to send handshake response");
        registry.unregister(&subdomain).await;
        return;
    }

    // The server is the yamux open side even though the client dialed: it
    // initiates one stream per inbound public request while the client only
    // accepts.
    let mut session = Session::new_client(conn, YamuxConfig::default());
    let record = Tunnel::new(subdomain.clone(), session.control());
    let id = record.id.clone();
    registry.bind(&subdomain, record).await;
    info!(subdomain = %subdomain, id = %id, url = %url, "tunnel registered");

    // Drive the session until it closes. Polling here is what moves frames
    // for every stream the dispatcher opens through the control handle.
    loop {
        match session.next().await {
            Some(Ok(mut stream)) => {
                // The accept side never opens streams.
                warn!(subdomain = %subdomain, "unexpected inbound stream from client");
                let _ = stream.shutdown().await;
            }
            Some(Err(e)) => {
                debug!(subdomain = %subdomain, error = %e, "session ended");
                break;
            }
            None => break,
        }
    }

    registry.unregister(&subdomain).await;
    info!(subdomain = %subdomain, id = %id, "tunnel unregistered");
}

/// Routes one public request through the tunnel matching its Host header.
async fn handle_public(
    registry: Arc<Registry>,
    domain: String,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Some(subdomain) = extract_subdomain(host, &domain) else {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "openport: no tunnel specified",
        ));
    };

    let Some(record) = registry.lookup(&subdomain).await else {
        return Ok(text_response(
            StatusCode::NOT_FOUND,
            &format!("openport: tunnel {subdomain:?} not found"),
        ));
    };

    // One fresh stream per request; concurrent requests to the same tunnel
    // each ride their own stream.
    let mut control = record.control;
    let stream = match control.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(subdomain = %subdomain, error = %e, "failed to open stream");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "openport: failed to reach tunnel client",
            ));
        }
    };

    let (mut sender, stream_conn) = match client_http1::handshake(TokioIo::new(stream)).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(subdomain = %subdomain, error = %e, "tunnel stream setup failed");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "openport: failed to forward request",
            ));
        }
    };
    tokio::spawn(async move {
        // Drives the stream, including the response body relay after the
        // handler has returned. The stream closes when this ends.
        if let Err(e) = stream_conn.await {
            debug!(error = %e, "tunnel stream error");
        }
    });

    match sender.send_request(req).await {
        // Status, headers (duplicates and order preserved) and body are
        // relayed verbatim; the body streams through unbuffered, so a large
        // response holds its stream open for its duration.
        Ok(resp) => Ok(resp.map(BodyExt::boxed)),
        Err(e) if e.is_parse() || e.is_incomplete_message() => {
            warn!(subdomain = %subdomain, error = %e, "unreadable response from tunnel");
            Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "openport: failed to read response from tunnel",
            ))
        }
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "failed to forward request");
            Ok(text_response(
                StatusCode::BAD_GATEWAY,
                "openport: failed to forward request",
            ))
        }
    }
}

/// Splits a Host header value into the subdomain label, if the host sits
/// under the base domain. Port suffixes are ignored and matching is
/// case-insensitive.
fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    let host = host.to_ascii_lowercase();
    let suffix = format!(".{}", base_domain.to_ascii_lowercase());
    host.strip_suffix(suffix.as_str())
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

/// `":8080"` is a valid listen spec for the deployment surface but not for
/// the socket API; bare ports bind all interfaces.
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn url_addr(cfg_addr: &str, bound: SocketAddr) -> String {
    match cfg_addr.strip_suffix(":0") {
        Some(prefix) => format!("{prefix}:{}", bound.port()),
        None => cfg_addr.to_string(),
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body.to_string()))
        .unwrap()
}

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}
