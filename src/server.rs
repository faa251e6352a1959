//! HTTP surface
//!
//! One chunk per `POST /deploy` request; the request carrying the last
//! missing chunk runs the whole deploy and answers with its result. The
//! remaining endpoints list state and act on conflict reports.

use crate::db::Database;
use crate::deploy::{bare_domain, DeployRequest, Orchestrator};
use crate::error::{json_error_response, json_response, DeployError, DeployResponse};
use crate::proxy::SharedProxy;
use crate::transfer::{ChunkMetadata, TransferStore};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub const CHUNK_METADATA_HEADER: &str = "x-chunk-metadata";
pub const DEPLOY_PORT_HEADER: &str = "x-deploy-port";
pub const DEPLOY_DOMAIN_HEADER: &str = "x-deploy-domain";
pub const IMAGE_NAME_HEADER: &str = "x-image-name";

/// Number of history entries returned by `GET /deployments`
const DEPLOYMENT_HISTORY_LIMIT: usize = 20;

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_value_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything a request handler needs
pub struct AppState {
    pub transfers: Arc<TransferStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub db: Database,
    pub proxy: SharedProxy,
    pub auth_token: String,
    pub db_timeout: Duration,
    pub max_chunk_size: u64,
}

pub type SharedState = Arc<AppState>;

/// Deploy API server
pub struct DeployServer {
    bind_addr: SocketAddr,
    state: SharedState,
    shutdown_rx: watch::Receiver<bool>,
}

impl DeployServer {
    pub fn new(bind_addr: SocketAddr, state: SharedState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Deploy API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
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
                        info!("Deploy API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, state: SharedState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim() == expected_token)
        .unwrap_or(false)
}

fn decode_segment(segment: &str) -> Result<String, DeployError> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .ok()
        .filter(|s| !s.is_empty() && !s.contains('/'))
        .ok_or_else(|| DeployError::Validation(format!("invalid path segment '{}'", segment)))
}

/// Container name in `/containers/{name}/stop`
fn stop_target(path: &str) -> Option<&str> {
    path.strip_prefix("/containers/")?
        .strip_suffix("/stop")
        .filter(|name| !name.is_empty())
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            urlencoding::decode(&v.replace('+', " "))
                .ok()
                .map(|v| v.into_owned())
        } else {
            None
        }
    })
}

async fn handle_request(
    req: Request<Incoming>,
    state: SharedState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_value_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        _ if !check_auth(req.headers(), &state.auth_token) => {
            warn!(%method, %path, "Unauthorized API request");
            json_error_response(&DeployError::Unauthorized)
        }

        _ => match route_authenticated(req, &method, &path, &state).await {
            Ok(response) => response,
            Err(e) => {
                if e.status_code().is_server_error() {
                    error!(%method, %path, error = %e, "Request failed");
                } else {
                    debug!(%method, %path, error = %e, "Request rejected");
                }
                json_error_response(&e)
            }
        },
    };

    Ok(response)
}

async fn route_authenticated(
    req: Request<Incoming>,
    method: &Method,
    path: &str,
    state: &AppState,
) -> Result<Response<Full<Bytes>>, DeployError> {
    match (method, path) {
        (&Method::POST, "/deploy") => handle_deploy(req, state).await,

        (&Method::GET, "/routes") => {
            let routes = state
                .db
                .call(state.db_timeout, |db| db.list_routes())
                .await
                .map_err(|e| DeployError::Internal(format!("{:#}", e)))?;
            Ok(json_value_response(
                StatusCode::OK,
                serde_json::json!({ "count": routes.len(), "routes": routes }),
            ))
        }

        (&Method::DELETE, p) if p.starts_with("/routes/") => {
            let domain = bare_domain(&decode_segment(&p["/routes/".len()..])?);
            delete_route(state, domain).await
        }

        (&Method::GET, "/deployments") => {
            let domain = query_param(req.uri().query(), "domain").map(|d| bare_domain(&d));
            let deployments = state
                .db
                .call(state.db_timeout, move |db| {
                    db.get_deployments(domain.as_deref(), DEPLOYMENT_HISTORY_LIMIT)
                })
                .await
                .map_err(|e| DeployError::Internal(format!("{:#}", e)))?;
            Ok(json_value_response(
                StatusCode::OK,
                serde_json::json!({ "count": deployments.len(), "deployments": deployments }),
            ))
        }

        (&Method::GET, "/transfers") => Ok(json_value_response(
            StatusCode::OK,
            serde_json::json!(state.transfers.stats()),
        )),

        (&Method::POST, p) if stop_target(p).is_some() => {
            let name = decode_segment(stop_target(p).unwrap_or_default())?;
            let info = state.orchestrator.stop_container(&name).await?;
            let mut body = DeployResponse::ok(StatusCode::OK, format!("Stopped container {}", name));
            body.container_id = Some(info.id);
            body.container_name = Some(name);
            body.state = Some("exited".to_string());
            Ok(json_response(&body))
        }

        (&Method::DELETE, p) if p.starts_with("/containers/") => {
            let name = decode_segment(&p["/containers/".len()..])?;
            let info = state.orchestrator.remove_container(&name).await?;
            let mut body = DeployResponse::ok(StatusCode::OK, format!("Removed container {}", name));
            body.container_id = Some(info.id);
            body.container_name = Some(name);
            Ok(json_response(&body))
        }

        _ => Ok(text_response(StatusCode::NOT_FOUND, "not found")),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, DeployError> {
    header_value(headers, name)
        .ok_or_else(|| DeployError::Validation(format!("missing {} header", name)))
}

/// Accept one chunk; run the deploy when it completes the transfer
async fn handle_deploy(req: Request<Incoming>, state: &AppState) -> Result<Response<Full<Bytes>>, DeployError> {
    let headers = req.headers();
    let metadata = ChunkMetadata::parse(&required_header(headers, CHUNK_METADATA_HEADER)?)?;
    let image_name =
        header_value(headers, IMAGE_NAME_HEADER).unwrap_or_else(|| metadata.image_name.clone());
    let request = DeployRequest::new(
        &required_header(headers, DEPLOY_PORT_HEADER)?,
        &required_header(headers, DEPLOY_DOMAIN_HEADER)?,
        &image_name,
    )?;

    let limit = usize::try_from(state.max_chunk_size).unwrap_or(usize::MAX);
    let data = Limited::new(req.into_body(), limit)
        .collect()
        .await
        .map_err(|e| {
            DeployError::Validation(format!(
                "chunk {} of transfer {} could not be read: {}",
                metadata.chunk_number, metadata.transfer_id, e
            ))
        })?
        .to_bytes();

    let ack = state.transfers.submit_chunk(&metadata, data)?;
    if !ack.complete {
        let body = DeployResponse::ok(
            StatusCode::ACCEPTED,
            format!(
                "chunk {} of transfer {} received ({}/{})",
                ack.chunk_number, ack.transfer_id, ack.received, ack.total_chunks
            ),
        );
        return Ok(json_response(&body));
    }

    let archive = state.transfers.assemble(&metadata.transfer_id)?;
    info!(
        transfer_id = %metadata.transfer_id,
        size = archive.len(),
        domain = %request.target_domain,
        "Transfer complete, deploying"
    );

    let outcome = state.orchestrator.deploy(request, archive).await?;
    Ok(json_response(&outcome.response()))
}

async fn delete_route(state: &AppState, domain: String) -> Result<Response<Full<Bytes>>, DeployError> {
    let key = domain.clone();
    let deleted = state
        .db
        .call(state.db_timeout, move |db| db.delete_route(&key))
        .await
        .map_err(|e| DeployError::persistence(&domain, e))?;

    if !deleted {
        return Err(DeployError::NotFound(format!("route for {}", domain)));
    }

    info!(domain = %domain, "Route deleted");
    if let Err(e) = state.proxy.reload().await {
        warn!(domain = %domain, error = %e, "Proxy reload failed after route delete");
    }

    let mut body = DeployResponse::ok(StatusCode::OK, format!("Removed route for {}", domain));
    body.domain = Some(domain);
    Ok(json_response(&body))
}
