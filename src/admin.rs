use crate::error::{Error, ErrorCode, ErrorResponse};
use crate::orchestrator::DevServerOrchestrator;
use crate::ports::AllocationStrategy;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = response(status, bytes);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize admin response");
            json_error(ErrorCode::InternalError, "failed to serialize response")
        }
    }
}

fn json_error(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();
    let mut response = response(code.status_code(), body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(err: &Error) -> Response<Full<Bytes>> {
    let body = ErrorResponse::from(err);
    let status = body.code.status_code();
    if status.is_server_error() {
        warn!(error = %err, "Admin request failed");
    } else {
        debug!(error = %err, "Admin request rejected");
    }
    json_error(body.code, body.message)
}

/// Parse a JSON body; an empty body yields the default value
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, Response<Full<Bytes>>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| json_error(ErrorCode::BadRequest, format!("invalid JSON: {}", e)))
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    user_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct AllocateRequest {
    strategy: Option<AllocationStrategy>,
}

#[derive(Debug, Default, Deserialize)]
struct ReserveRequest {
    frontend: Option<u32>,
    backend: Option<u32>,
    #[serde(default)]
    reserved: Vec<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckPortsRequest {
    #[serde(default)]
    ports: Vec<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CleanupRequest {
    max_idle_secs: Option<u64>,
}

/// Request routing for the admin API, independent of the transport
pub struct AdminApi {
    orchestrator: Arc<DevServerOrchestrator>,
    auth_token: String,
}

impl AdminApi {
    pub fn new(orchestrator: Arc<DevServerOrchestrator>, auth_token: String) -> Self {
        Self {
            orchestrator,
            auth_token,
        }
    }

    fn check_auth(&self, authorization: Option<&str>) -> bool {
        authorization
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth) == self.auth_token)
            .unwrap_or(false)
    }

    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Response<Full<Bytes>> {
        debug!(%method, %path, "Admin API request");

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            (&Method::GET, ["health"]) => return response(StatusCode::OK, "ok"),
            (&Method::GET, ["version"]) => {
                return json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
                )
            }
            _ => {}
        }

        if !self.check_auth(authorization) {
            warn!(%path, "Unauthorized admin API request");
            return json_error(ErrorCode::Unauthorized, "unauthorized");
        }

        let result = match (method, segments.as_slice()) {
            (&Method::POST, ["projects", id, "start"]) => self.start(id, body).await,
            (&Method::POST, ["projects", id, "stop"]) => {
                let stopped = self.orchestrator.stop(id).await;
                Ok(json_response(StatusCode::OK, &serde_json::json!({ "stopped": stopped })))
            }
            (&Method::GET, ["projects", id, "status"]) => {
                let status = self.orchestrator.status(id).await;
                Ok(json_response(StatusCode::OK, &status))
            }
            (&Method::GET, ["projects", id, "ports"]) => Ok(match self.orchestrator.get_ports(id) {
                Some(allocation) => json_response(StatusCode::OK, &allocation),
                None => json_error(ErrorCode::NotFound, "no ports allocated"),
            }),
            (&Method::POST, ["projects", id, "ports"]) => self.allocate(id, body),
            (&Method::PUT, ["projects", id, "ports"]) => self.reserve(id, body),
            (&Method::DELETE, ["projects", id, "ports"]) => self
                .orchestrator
                .release_ports(id)
                .map(|released| json_response(StatusCode::OK, &serde_json::json!({ "released": released }))),
            (&Method::GET, ["servers"]) => {
                let servers = self.orchestrator.list_servers();
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "count": servers.len(), "servers": servers }),
                ))
            }
            (&Method::GET, ["users", id, "servers"]) => {
                let servers = self.orchestrator.list_user_servers(id);
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "count": servers.len(), "servers": servers }),
                ))
            }
            (&Method::POST, ["users", id, "scale"]) => {
                let stopped = self.orchestrator.scale_user_servers(id).await;
                Ok(json_response(StatusCode::OK, &serde_json::json!({ "stopped": stopped })))
            }
            (&Method::GET, ["ports"]) => {
                let allocations = self.orchestrator.list_ports();
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "count": allocations.len(), "allocations": allocations }),
                ))
            }
            (&Method::POST, ["ports", "check"]) => match parse_body::<CheckPortsRequest>(body) {
                Ok(req) => {
                    let ports = self.orchestrator.check_ports(&req.ports);
                    Ok(json_response(StatusCode::OK, &serde_json::json!({ "ports": ports })))
                }
                Err(resp) => Ok(resp),
            },
            (&Method::GET, ["metrics"]) => {
                let metrics = self.orchestrator.metrics().await;
                Ok(json_response(StatusCode::OK, &metrics))
            }
            (&Method::POST, ["cleanup"]) => match parse_body::<CleanupRequest>(body) {
                Ok(req) => {
                    let max_idle = req
                        .max_idle_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.orchestrator.config().idle_timeout());
                    let stopped = self.orchestrator.cleanup_idle(max_idle).await;
                    Ok(json_response(StatusCode::OK, &serde_json::json!({ "stopped": stopped })))
                }
                Err(resp) => Ok(resp),
            },
            _ => Ok(json_error(ErrorCode::NotFound, "not found")),
        };

        result.unwrap_or_else(|e| error_response(&e))
    }

    async fn start(&self, project_id: &str, body: &[u8]) -> crate::error::Result<Response<Full<Bytes>>> {
        let req: StartRequest = match parse_body(body) {
            Ok(req) => req,
            Err(resp) => return Ok(resp),
        };
        if req.user_id.is_empty() {
            return Ok(json_error(ErrorCode::BadRequest, "user_id is required"));
        }

        match self.orchestrator.start(project_id, &req.user_id).await {
            Ok(started) => Ok(json_response(StatusCode::OK, &started)),
            Err(e) => {
                error!(project_id, user_id = %req.user_id, error = %e, "Failed to start dev server");
                Err(e)
            }
        }
    }

    fn allocate(&self, project_id: &str, body: &[u8]) -> crate::error::Result<Response<Full<Bytes>>> {
        let req: AllocateRequest = match parse_body(body) {
            Ok(req) => req,
            Err(resp) => return Ok(resp),
        };
        let allocation = self.orchestrator.allocate_ports(project_id, req.strategy)?;
        Ok(json_response(StatusCode::OK, &allocation))
    }

    fn reserve(&self, project_id: &str, body: &[u8]) -> crate::error::Result<Response<Full<Bytes>>> {
        let req: ReserveRequest = match parse_body(body) {
            Ok(req) => req,
            Err(resp) => return Ok(resp),
        };
        let (Some(frontend), Some(backend)) = (req.frontend, req.backend) else {
            return Ok(json_error(ErrorCode::BadRequest, "frontend and backend are required"));
        };
        let allocation = self
            .orchestrator
            .reserve_ports(project_id, frontend, backend, &req.reserved)?;
        Ok(json_response(StatusCode::OK, &allocation))
    }
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    api: Arc<AdminApi>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<DevServerOrchestrator>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            api: Arc::new(AdminApi::new(orchestrator, auth_token)),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self.api);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, api).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: tokio::net::TcpStream, api: Arc<AdminApi>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let api = Arc::clone(&api);
        async move { handle_admin_request(req, api).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    api: Arc<AdminApi>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = req.collect().await?.to_bytes();
    Ok(api
        .handle(&method, &path, authorization.as_deref(), &body)
        .await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_empty_is_default() {
        let req: CleanupRequest = parse_body(b"").unwrap();
        assert!(req.max_idle_secs.is_none());
        let req: CleanupRequest = parse_body(b"  \n").unwrap();
        assert!(req.max_idle_secs.is_none());
    }

    #[test]
    fn test_parse_body_invalid_json() {
        let err = parse_body::<StartRequest>(b"{not json").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_strategy() {
        let req: AllocateRequest = parse_body(br#"{"strategy":"block"}"#).unwrap();
        assert_eq!(req.strategy, Some(AllocationStrategy::BlockBased));
        let req: AllocateRequest = parse_body(br#"{}"#).unwrap();
        assert_eq!(req.strategy, None);
    }

    #[test]
    fn test_error_response_status() {
        let resp = error_response(&Error::PortConflict("5200".into()));
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = error_response(&Error::ContainerStart("docker exploded".into()));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
