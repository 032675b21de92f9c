//! Reverse-proxy route table
//!
//! Renders an nginx configuration from a list of socket specs (HTTP virtual
//! hosts by hostname, TCP passthrough by port) and hot-reloads the proxy with
//! SIGHUP. The proxy itself is one of the supervised programs; see
//! [`RouteTable::program_spec`].

use crate::error::{RpcErrorCode, SupervisorError};
use crate::program::{AutoRestart, ProgramSpec};
use crate::supervisor::ProgramControl;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the proxy program in the supervised set
pub const PROXY_PROGRAM: &str = "nginx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    #[default]
    Http,
    Tcp,
}

/// A routing rule from a public hostname or port to a local backend socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSpec {
    pub kind: SocketKind,
    pub path: PathBuf,
    /// Virtual hostnames (HTTP only)
    pub http_hostnames: BTreeSet<String>,
    /// Public port (TCP only)
    pub tcp_port: Option<u16>,
}

impl SocketSpec {
    pub fn http<I, S>(path: impl Into<PathBuf>, hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: SocketKind::Http,
            path: path.into(),
            http_hostnames: hostnames.into_iter().map(Into::into).collect(),
            tcp_port: None,
        }
    }

    pub fn tcp(path: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            kind: SocketKind::Tcp,
            path: path.into(),
            http_hostnames: BTreeSet::new(),
            tcp_port: Some(port),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("hostname '{hostname}' is routed to both {first} and {second}")]
    DuplicateHostname {
        hostname: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("TCP port {port} is routed to both {first} and {second}")]
    DuplicatePort { port: u16, first: PathBuf, second: PathBuf },

    #[error("socket {0} is missing its hostnames or port")]
    Incomplete(PathBuf),

    #[error("failed to write proxy configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to signal proxy: {0}")]
    Signal(#[from] SupervisorError),
}

/// Check the cross-spec invariants: hostnames and ports are globally unique
pub fn validate_sockets(sockets: &[SocketSpec]) -> Result<(), RouteError> {
    let mut hostnames: BTreeMap<&str, &Path> = BTreeMap::new();
    let mut ports: BTreeMap<u16, &Path> = BTreeMap::new();

    for spec in sockets {
        match spec.kind {
            SocketKind::Http => {
                if spec.http_hostnames.is_empty() {
                    return Err(RouteError::Incomplete(spec.path.clone()));
                }
                for hostname in &spec.http_hostnames {
                    if let Some(first) = hostnames.insert(hostname.as_str(), &spec.path) {
                        return Err(RouteError::DuplicateHostname {
                            hostname: hostname.clone(),
                            first: first.to_path_buf(),
                            second: spec.path.clone(),
                        });
                    }
                }
            }
            SocketKind::Tcp => {
                let port = spec
                    .tcp_port
                    .ok_or_else(|| RouteError::Incomplete(spec.path.clone()))?;
                if let Some(first) = ports.insert(port, &spec.path) {
                    return Err(RouteError::DuplicatePort {
                        port,
                        first: first.to_path_buf(),
                        second: spec.path.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

fn unix_proxy_location(path: &Path, indent: &str) -> String {
    format!(
        "{indent}proxy_pass http://unix:{path};\n\
         {indent}proxy_set_header Upgrade $http_upgrade;\n\
         {indent}proxy_set_header Connection $connection_upgrade;\n",
        indent = indent,
        path = path.display()
    )
}

/// Render the proxy configuration. Pure: the same input gives the same text.
pub fn render_config(
    nginx_dir: &Path,
    http_listen: Option<&str>,
    sockets: &[SocketSpec],
    default_http_socket: Option<&Path>,
) -> String {
    let dir = nginx_dir.display();
    let mut out = String::new();

    out.push_str("daemon off;\n");
    out.push_str("error_log stderr info;\n");
    out.push_str(&format!("pid {}/nginx.pid;\n\n", dir));
    out.push_str("events {\n}\n");

    if let Some(listen) = http_listen {
        out.push_str("\nhttp {\n");
        out.push_str("    access_log stderr;\n");
        for (directive, sub) in [
            ("client_body_temp_path", "client_body"),
            ("proxy_temp_path", "proxy"),
            ("fastcgi_temp_path", "fastcgi"),
            ("uwsgi_temp_path", "uwsgi"),
            ("scgi_temp_path", "scgi"),
        ] {
            out.push_str(&format!("    {} {}/{};\n", directive, dir, sub));
        }

        out.push_str("\n    map $http_upgrade $connection_upgrade {\n");
        out.push_str("        default upgrade;\n");
        out.push_str("        ''      close;\n");
        out.push_str("    }\n");

        out.push_str("\n    server {\n");
        out.push_str(&format!("        listen {};\n", listen));
        out.push_str("        location / {\n");
        out.push_str("            proxy_set_header Host $host;\n");
        match default_http_socket {
            Some(path) => out.push_str(&unix_proxy_location(path, "            ")),
            None => out.push_str("            return 404;\n"),
        }
        out.push_str("        }\n");
        out.push_str("    }\n");

        for spec in sockets.iter().filter(|s| s.kind == SocketKind::Http) {
            // X-Forwarded-* are passed by nginx itself
            let server_names: Vec<String> = spec
                .http_hostnames
                .iter()
                .flat_map(|h| [h.clone(), format!("*.{}", h)])
                .collect();

            out.push_str("\n    server {\n");
            out.push_str(&format!("        listen {};\n", listen));
            out.push_str(&format!("        server_name {};\n", server_names.join(" ")));
            out.push_str("        location / {\n");
            out.push_str("            proxy_set_header Host $host;\n");
            out.push_str(&unix_proxy_location(&spec.path, "            "));
            out.push_str("        }\n");
            out.push_str("    }\n");
        }

        out.push_str("}\n");
    }

    out.push_str("\nstream {\n");
    for spec in sockets.iter().filter(|s| s.kind == SocketKind::Tcp) {
        let Some(port) = spec.tcp_port else { continue };
        out.push_str("    server {\n");
        out.push_str(&format!("        listen {};\n", port));
        out.push_str(&format!("        proxy_pass unix:{};\n", spec.path.display()));
        out.push_str("    }\n");
    }
    out.push_str("}\n");

    out
}

/// Routing state and the proxy program that serves it
pub struct RouteTable {
    program_name: String,
    proxy_executable: String,
    http_listen: Option<String>,
    sockets: Vec<SocketSpec>,
    default_http_socket: Option<PathBuf>,
    nginx_dir: PathBuf,
}

impl RouteTable {
    /// Create the proxy directory under `runtime_dir` and write an empty configuration
    pub fn new(
        runtime_dir: &Path,
        proxy_executable: impl Into<String>,
        http_listen: Option<String>,
    ) -> Result<Self, RouteError> {
        let nginx_dir = runtime_dir.join(PROXY_PROGRAM);
        std::fs::create_dir_all(&nginx_dir)?;

        let table = Self {
            program_name: PROXY_PROGRAM.to_string(),
            proxy_executable: proxy_executable.into(),
            http_listen,
            sockets: Vec::new(),
            default_http_socket: None,
            nginx_dir,
        };
        table.write_config()?;
        Ok(table)
    }

    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    pub fn config_path(&self) -> PathBuf {
        self.nginx_dir.join("nginx.conf")
    }

    pub fn sockets(&self) -> &[SocketSpec] {
        &self.sockets
    }

    pub fn default_http_socket(&self) -> Option<&Path> {
        self.default_http_socket.as_deref()
    }

    /// The supervised program running the proxy against this table
    pub fn program_spec(&self) -> ProgramSpec {
        ProgramSpec::new([
            self.proxy_executable.clone(),
            "-p".to_string(),
            self.nginx_dir.display().to_string(),
            "-e".to_string(),
            "stderr".to_string(),
            "-c".to_string(),
            "nginx.conf".to_string(),
        ])
        .with_autorestart(AutoRestart::True)
    }

    pub fn render(&self) -> String {
        render_config(
            &self.nginx_dir,
            self.http_listen.as_deref(),
            &self.sockets,
            self.default_http_socket.as_deref(),
        )
    }

    fn write_config(&self) -> Result<(), RouteError> {
        let path = self.config_path();
        let tmp_path = path.with_extension("conf.tmp");
        std::fs::write(&tmp_path, self.render())?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Rewrite the configuration and SIGHUP the proxy if it is supervised
    pub async fn reload<C: ProgramControl + ?Sized>(&self, control: &C) -> Result<(), RouteError> {
        self.write_config()?;

        if control.has_program(&self.program_name) {
            match control.signal(&self.program_name, libc::SIGHUP).await {
                Ok(()) => debug!(program = %self.program_name, "Proxy signalled to reload"),
                // A stopped or backing-off proxy reads the new file when it starts
                Err(e) if e.fault_code() == Some(RpcErrorCode::NotRunning) => {
                    debug!(program = %self.program_name, "Proxy not running, reload skipped")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Replace the socket list. Invalid lists are rejected before anything is written.
    pub async fn set_sockets<C: ProgramControl + ?Sized>(
        &mut self,
        sockets: Vec<SocketSpec>,
        control: &C,
    ) -> Result<(), RouteError> {
        validate_sockets(&sockets)?;
        info!(sockets = sockets.len(), "Routes updated");
        self.sockets = sockets;
        self.reload(control).await
    }

    pub async fn set_default_http_socket<C: ProgramControl + ?Sized>(
        &mut self,
        socket: Option<PathBuf>,
        control: &C,
    ) -> Result<(), RouteError> {
        self.default_http_socket = socket;
        self.reload(control).await
    }
}
