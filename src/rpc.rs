//! Control-plane RPC server: HTTP/JSON over a private Unix socket

use crate::control::ProgramManager;
use crate::error::{json_error_response, ControlError, RpcErrorCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Bumped whenever a route or body shape changes
pub const API_VERSION: u32 = 1;

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(RpcErrorCode::Failed, format!("serialization failed: {}", e)),
    }
}

fn ok_response() -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, r#"{"ok":true}"#)
}

/// RPC server of the control plane
pub struct RpcServer {
    socket_path: PathBuf,
    manager: Arc<ProgramManager>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RpcServer {
    pub fn new(
        socket_path: PathBuf,
        manager: Arc<ProgramManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            socket_path,
            manager,
            shutdown_rx,
        }
    }

    /// Bind the socket (replacing a stale one) and restrict it to the owner
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o700))?;
        Ok(listener)
    }

    pub async fn serve(self, listener: UnixListener) -> anyhow::Result<()> {
        info!(socket = %self.socket_path.display(), "Control-plane RPC listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let manager = Arc::clone(&self.manager);
                            tokio::spawn(async move {
                                if let Err(e) = serve_rpc_connection(stream, manager).await {
                                    debug!(error = %e, "RPC connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept RPC connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("RPC server shutting down");
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn serve_rpc_connection(stream: UnixStream, manager: Arc<ProgramManager>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        async move { handle_rpc_request(req, manager).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("RPC connection error: {}", e))?;

    Ok(())
}

/// `wait` query flag, true unless explicitly disabled
fn wait_flag(query: Option<&str>) -> Result<bool, ControlError> {
    let Some(query) = query else {
        return Ok(true);
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("wait=") {
            return match value {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                other => Err(ControlError::new(
                    RpcErrorCode::BadArguments,
                    format!("invalid wait value: {}", other),
                )),
            };
        }
    }
    Ok(true)
}

fn into_response(result: Result<Response<Full<Bytes>>, ControlError>) -> Response<Full<Bytes>> {
    result.unwrap_or_else(Response::from)
}

async fn handle_rpc_request(
    req: Request<hyper::body::Incoming>,
    manager: Arc<ProgramManager>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!(%method, %path, "RPC request");

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["version"]) => json_ok(&serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "api": API_VERSION,
        })),

        (&Method::POST, ["reload"]) => into_response(manager.reload_config().map(|diff| json_ok(&diff))),

        (&Method::POST, ["groups", name]) => into_response(manager.add_group(name).map(|_| ok_response())),

        (&Method::DELETE, ["groups", name]) => {
            into_response(manager.remove_group(name).map(|_| ok_response()))
        }

        (&Method::GET, ["processes"]) => json_ok(&manager.list_programs()),

        (&Method::POST, ["processes", "start-all"]) => match wait_flag(query.as_deref()) {
            Ok(wait) => json_ok(&manager.start_all(wait).await),
            Err(e) => e.into(),
        },

        (&Method::POST, ["processes", name, "start"]) => {
            let result = match wait_flag(query.as_deref()) {
                Ok(wait) => manager.start_process(name, wait).await,
                Err(e) => Err(e),
            };
            into_response(result.map(|_| ok_response()))
        }

        (&Method::POST, ["processes", name, "stop"]) => {
            let result = match wait_flag(query.as_deref()) {
                Ok(wait) => manager.stop_process(name, wait).await,
                Err(e) => Err(e),
            };
            into_response(result.map(|_| ok_response()))
        }

        (&Method::POST, ["processes", name, "signal", signum]) => {
            let result = signum
                .parse::<i32>()
                .map_err(|_| {
                    ControlError::new(RpcErrorCode::BadSignal, format!("invalid signal: {}", signum))
                })
                .and_then(|signum| manager.signal_process(name, signum));
            into_response(result.map(|_| ok_response()))
        }

        _ => json_error_response(RpcErrorCode::BadName, format!("no such route: {} {}", method, path)),
    };

    Ok(response)
}
