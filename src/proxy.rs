//! Host-based reverse proxy in front of project dev servers
//!
//! Requests for `<subdomain>.<base_domain>` are looked up in the
//! [`RouteTable`] and forwarded to the dev server's port on loopback.
//! WebSocket and other HTTP upgrades are passed through so hot reload works.

use async_trait::async_trait;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{json_error_response, ErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::routes::{ProxyRoute, RouteBackend};

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Cap on the dev server's upgrade response headers
const MAX_UPGRADE_HEAD_LEN: usize = 16 * 1024;

/// Domain → dev server port, read on every proxied request
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: DashMap<String, u16>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, host: &str) -> Option<u16> {
        self.entries.get(host).map(|port| *port)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RouteBackend for RouteTable {
    async fn install(&self, route: &ProxyRoute) -> anyhow::Result<()> {
        self.entries
            .insert(route.full_domain.to_lowercase(), route.target_port);
        debug!(domain = %route.full_domain, port = route.target_port, "Route table updated");
        Ok(())
    }

    async fn remove(&self, full_domain: &str) -> anyhow::Result<()> {
        self.entries.remove(&full_domain.to_lowercase());
        Ok(())
    }
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    routes: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: Arc<RouteTable>,
        request_timeout: Duration,
        pool_config: PoolConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            routes,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            request_timeout,
            shutdown_rx,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Dev server proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let pool = Arc::clone(&self.pool);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes, pool, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Dev server proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    routes: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, routes, pool, addr, request_timeout).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    routes: Arc<RouteTable>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
    request_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(hostname) = extract_hostname(&req) else {
        return Ok(json_error_response(
            ErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    let Some(port) = routes.resolve(&hostname) else {
        debug!(hostname, request_id, "No dev server for host");
        return Ok(json_error_response(
            ErrorCode::UnknownHost,
            "No dev server is running for this host",
        ));
    };

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(&hostname) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, port, method = %req.method(), uri = %req.uri(), request_id, "Proxying request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, hostname, port, request_id).await;
    }

    match tokio::time::timeout(request_timeout, pool.send_request(req, port)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            warn!(hostname, port, error = %e, "Dev server unreachable");
            Ok(json_error_response(
                ErrorCode::ConnectionFailed,
                "Dev server is not accepting connections",
            ))
        }
        Err(_) => {
            warn!(hostname, port, timeout_secs = request_timeout.as_secs(), "Request timed out");
            Ok(json_error_response(
                ErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Lowercased hostname from the Host header (or the URI authority for
/// HTTP/2), with any port stripped. Rejects anything that is not a plain
/// DNS name.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let hostname = raw.split(':').next()?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_lowercase().contains("upgrade"));

    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 request line and headers for the upstream upgrade handshake
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            raw.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    raw.push_str(&format!("Host: 127.0.0.1:{}\r\n\r\n", port));

    raw.into_bytes()
}

/// Status and headers of the upstream handshake response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let mut status_line = lines.next()?.splitn(3, ' ');
    let _version = status_line.next()?;
    let status = StatusCode::from_u16(status_line.next()?.parse().ok()?).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

fn empty_response(
    status: StatusCode,
    headers: &[(String, String)],
    skip_framing: bool,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if skip_framing && (lower == "content-length" || lower == "transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

async fn handle_upgrade(
    req: Request<Incoming>,
    hostname: String,
    port: u16,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let mut upstream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(hostname, port, error = %e, "Failed to connect to dev server for upgrade");
            return Ok(json_error_response(
                ErrorCode::ConnectionFailed,
                "Dev server is not accepting connections",
            ));
        }
    };

    if let Err(e) = upstream.write_all(&build_upgrade_request(&req, port)).await {
        warn!(hostname, error = %e, "Failed to send upgrade request");
        return Ok(json_error_response(
            ErrorCode::ConnectionFailed,
            "Failed to reach dev server",
        ));
    }

    let (head, leftover) = match read_upgrade_head(&mut upstream).await {
        Ok(Some(parts)) => parts,
        Ok(None) => {
            warn!(hostname, "Dev server closed connection during upgrade");
            return Ok(json_error_response(
                ErrorCode::ConnectionFailed,
                "Dev server closed the connection",
            ));
        }
        Err(e) => {
            warn!(hostname, error = %e, "Failed to read upgrade response");
            return Ok(json_error_response(
                ErrorCode::ConnectionFailed,
                "Failed to reach dev server",
            ));
        }
    };

    let Some((status, headers)) = parse_upgrade_response(&head) else {
        warn!(hostname, "Unparseable upgrade response");
        return Ok(json_error_response(
            ErrorCode::ConnectionFailed,
            "Invalid upgrade response from dev server",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(hostname, %status, "Dev server declined upgrade");
        return Ok(empty_response(status, &headers, false));
    }

    debug!(hostname, request_id, "Upgrade accepted");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, upstream, leftover, &hostname, &request_id).await
            }
            Err(e) => warn!(hostname, error = %e, "Client upgrade failed"),
        }
    });

    Ok(empty_response(StatusCode::SWITCHING_PROTOCOLS, &headers, true))
}

/// Read the upstream handshake up to the blank line ending its headers.
///
/// Returns the header bytes and whatever arrived after them, which already
/// belongs to the upgraded stream. `None` when the dev server closed first.
async fn read_upgrade_head(upstream: &mut TcpStream) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok(Some((buf, leftover)));
        }
        if buf.len() > MAX_UPGRADE_HEAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response headers too large",
            ));
        }
    }
}

/// Offset just past the `\r\n\r\n` that ends an HTTP head
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

async fn forward_bidirectional(
    client: Upgraded,
    mut upstream: TcpStream,
    leftover: Vec<u8>,
    hostname: &str,
    request_id: &str,
) {
    let mut client = TokioIo::new(client);
    if !leftover.is_empty() {
        if let Err(e) = client.write_all(&leftover).await {
            debug!(hostname, request_id, error = %e, "Upgraded connection closed with error");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(hostname, request_id, sent, received, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
