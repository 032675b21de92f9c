//! RPC client for the control plane

use crate::control::{ProgramStatus, StartResult};
use crate::error::{ErrorResponse, SupervisorError};
use crate::program::ProgramDiff;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::debug;

/// Control plane identity returned by `GET /version`
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub api: u32,
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[allow(dead_code)]
    ok: bool,
}

/// One connection per call; the control plane is local and calls are rare
#[derive(Debug, Clone)]
pub struct RpcClient {
    socket_path: PathBuf,
}

impl RpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn version(&self) -> Result<VersionInfo, SupervisorError> {
        self.call(Method::GET, "/version").await
    }

    pub async fn reload_config(&self) -> Result<ProgramDiff, SupervisorError> {
        self.call(Method::POST, "/reload").await
    }

    pub async fn add_process_group(&self, name: &str) -> Result<(), SupervisorError> {
        self.ack(Method::POST, &format!("/groups/{}", name)).await
    }

    pub async fn remove_process_group(&self, name: &str) -> Result<(), SupervisorError> {
        self.ack(Method::DELETE, &format!("/groups/{}", name)).await
    }

    pub async fn start_process(&self, name: &str, wait: bool) -> Result<(), SupervisorError> {
        self.ack(Method::POST, &format!("/processes/{}/start?wait={}", name, wait))
            .await
    }

    pub async fn stop_process(&self, name: &str, wait: bool) -> Result<(), SupervisorError> {
        self.ack(Method::POST, &format!("/processes/{}/stop?wait={}", name, wait))
            .await
    }

    pub async fn signal_process(&self, name: &str, signum: i32) -> Result<(), SupervisorError> {
        self.ack(Method::POST, &format!("/processes/{}/signal/{}", name, signum))
            .await
    }

    pub async fn start_all_processes(&self, wait: bool) -> Result<Vec<StartResult>, SupervisorError> {
        self.call(Method::POST, &format!("/processes/start-all?wait={}", wait))
            .await
    }

    pub async fn list_processes(&self) -> Result<Vec<ProgramStatus>, SupervisorError> {
        self.call(Method::GET, "/processes").await
    }

    async fn ack(&self, method: Method, path: &str) -> Result<(), SupervisorError> {
        self.call::<Ack>(method, path).await.map(|_| ())
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T, SupervisorError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(transport)?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "RPC client connection closed with error");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "localhost")
            .body(Empty::<Bytes>::new())
            .map_err(transport)?;

        let response = sender.send_request(request).await.map_err(transport)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(transport)?
            .to_bytes();

        if status.is_success() {
            serde_json::from_slice(&body).map_err(transport)
        } else {
            match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(fault) => Err(fault.into()),
                Err(_) => Err(SupervisorError::Transport(format!(
                    "unexpected {} response: {}",
                    status,
                    String::from_utf8_lossy(&body)
                ))),
            }
        }
    }
}

fn transport<E: std::fmt::Display>(err: E) -> SupervisorError {
    SupervisorError::Transport(err.to_string())
}
