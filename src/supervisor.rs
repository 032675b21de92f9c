//! Supervisor: owns the control-plane child process and applies program sets to it

use crate::client::RpcClient;
use crate::error::SupervisorError;
use crate::program::{ControlConfig, ProgramDiff, ProgramSpec};
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long the control plane gets to stop its programs on terminate
const TERMINATE_GRACE: Duration = Duration::from_secs(30);

/// The operations the task orchestrator and the route table need from a
/// process supervisor.
#[async_trait]
pub trait ProgramControl: Send + Sync {
    /// Make the supervised set equal to `programs`; returns what changed
    async fn set_programs(
        &self,
        programs: BTreeMap<String, ProgramSpec>,
    ) -> Result<ProgramDiff, SupervisorError>;

    /// Stop (ignoring "not running") then start a program
    async fn restart(&self, name: &str) -> Result<(), SupervisorError>;

    async fn signal(&self, name: &str, signum: i32) -> Result<(), SupervisorError>;

    /// Whether the program is in the set applied to a running control plane
    fn has_program(&self, name: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Binary that implements the `control-plane` command
    pub executable: PathBuf,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
}

impl SupervisorOptions {
    /// Use the running binary as the control plane
    pub fn current_exe() -> anyhow::Result<Self> {
        Ok(Self {
            executable: std::env::current_exe()?,
            probe_attempts: 20,
            probe_interval: Duration::from_millis(100),
        })
    }
}

/// Owns a control-plane child and its private runtime directory.
///
/// The runtime directory holds the control configuration and the RPC socket,
/// and is where callers place other transient files (proxy config, task
/// scratch dirs). It is removed when the supervisor is dropped.
pub struct Supervisor {
    runtime_dir: TempDir,
    config_path: PathBuf,
    options: SupervisorOptions,
    client: RpcClient,
    programs: RwLock<BTreeMap<String, ProgramSpec>>,
    child: tokio::sync::Mutex<Option<Child>>,
    started: AtomicBool,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> anyhow::Result<Self> {
        let runtime_dir = tempfile::Builder::new().prefix("supervisor_").tempdir()?;
        let config_path = runtime_dir.path().join("control.toml");
        let client = RpcClient::new(runtime_dir.path().join("control.sock"));

        Ok(Self {
            runtime_dir,
            config_path,
            options,
            client,
            programs: RwLock::new(BTreeMap::new()),
            child: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.path()
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// The currently applied program set
    pub fn programs(&self) -> BTreeMap<String, ProgramSpec> {
        self.programs.read().clone()
    }

    fn write_config(&self) -> Result<(), SupervisorError> {
        let config = ControlConfig {
            socket: self.client.socket_path().to_path_buf(),
            programs: self.programs(),
        };
        config.write(&self.config_path).map_err(SupervisorError::Config)
    }

    /// Spawn the control plane and wait until it answers.
    ///
    /// Programs registered before the start are launched by the control plane
    /// itself. Calling this on a started supervisor does nothing.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.is_started() {
            return Ok(());
        }

        self.write_config()?;

        let mut cmd = Command::new(&self.options.executable);
        cmd.arg("control-plane");
        cmd.arg(&self.config_path);
        cmd.current_dir(self.runtime_dir.path());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        info!(
            pid = child.id(),
            runtime_dir = %self.runtime_dir.path().display(),
            "Control plane spawned"
        );

        let attempts = self.options.probe_attempts.max(1);
        let mut last = String::from("no attempt made");
        for attempt in 1..=attempts {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SupervisorError::Unreachable {
                    attempts: attempt,
                    last: format!("control plane exited with {}", status),
                });
            }

            match self.client.version().await {
                Ok(version) => {
                    info!(
                        version = %version.version,
                        api = version.api,
                        attempt,
                        "Control plane is up"
                    );
                    *self.child.lock().await = Some(child);
                    self.started.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Control plane not answering yet");
                    last = e.to_string();
                }
            }
            tokio::time::sleep(self.options.probe_interval).await;
        }

        let _ = child.kill().await;
        Err(SupervisorError::Unreachable { attempts, last })
    }

    async fn add(&self, name: &str) -> Result<(), SupervisorError> {
        self.client.add_process_group(name).await
    }

    /// Stop a program, treating "not running" and "unknown" as success
    async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        match self.client.stop_process(name, true).await {
            Err(SupervisorError::Fault { code, message }) => {
                debug!(program = name, %code, %message, "Stop ignored");
                Ok(())
            }
            other => other,
        }
    }

    async fn remove(&self, name: &str) -> Result<(), SupervisorError> {
        self.stop(name).await?;
        self.client.remove_process_group(name).await
    }

    /// Stop the control plane: SIGTERM, then SIGKILL if it does not exit
    pub async fn terminate(&self) {
        let child = self.child.lock().await.take();
        self.started.store(false, Ordering::SeqCst);

        let Some(mut child) = child else {
            return;
        };

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to control plane");
            // SAFETY: kill(2) has no memory-safety preconditions
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(?status, "Control plane exited"),
            Ok(Err(e)) => warn!(error = %e, "Error waiting for control plane to exit"),
            Err(_) => {
                warn!("Control plane did not exit in time, sending SIGKILL");
                let _ = child.kill().await;
            }
        }
    }

    /// Wait for the control plane to exit on its own
    pub async fn wait(&self) -> std::io::Result<Option<ExitStatus>> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => child.wait().await.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProgramControl for Supervisor {
    /// Registers the set, and when the control plane is up, applies the diff:
    /// new programs are added, changed ones re-registered and stopped, removed
    /// ones stopped and dropped; finally everything not running is started.
    async fn set_programs(
        &self,
        programs: BTreeMap<String, ProgramSpec>,
    ) -> Result<ProgramDiff, SupervisorError> {
        *self.programs.write() = programs;

        if !self.is_started() {
            return Ok(ProgramDiff::default());
        }

        self.write_config()?;
        let diff = self.client.reload_config().await?;

        let added = diff.added.iter().map(|name| self.add(name));
        try_join_all(added).await?;

        let changed = diff.changed.iter().map(|name| async move {
            self.add(name).await?;
            self.stop(name).await
        });
        try_join_all(changed).await?;

        let removed = diff.removed.iter().map(|name| self.remove(name));
        try_join_all(removed).await?;

        for result in self.client.start_all_processes(true).await? {
            if !result.ok {
                warn!(
                    program = %result.name,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Program failed to start"
                );
            }
        }

        info!(
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "Programs applied"
        );

        Ok(diff)
    }

    async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        self.stop(name).await?;
        self.client.start_process(name, true).await
    }

    async fn signal(&self, name: &str, signum: i32) -> Result<(), SupervisorError> {
        self.client.signal_process(name, signum).await
    }

    /// Only a running control plane has programs that can be signalled
    fn has_program(&self, name: &str) -> bool {
        self.is_started() && self.programs.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(executable: &str) -> SupervisorOptions {
        SupervisorOptions {
            executable: PathBuf::from(executable),
            probe_attempts: 3,
            probe_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_set_programs_before_start_only_records() {
        let supervisor = Supervisor::new(options("/nonexistent")).unwrap();

        let mut programs = BTreeMap::new();
        programs.insert("a".to_string(), ProgramSpec::new(["sleep", "1"]));
        let diff = supervisor.set_programs(programs).await.unwrap();

        assert!(diff.is_empty());
        assert!(supervisor.programs().contains_key("a"));
        // Nothing to signal until the control plane runs
        assert!(!supervisor.has_program("a"));
        assert!(!supervisor.is_started());
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_fails_to_spawn() {
        let supervisor = Supervisor::new(options("/nonexistent/ctfgate")).unwrap();
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_start_with_silent_child_is_unreachable() {
        // `true` ignores its arguments and never opens the socket
        let supervisor = Supervisor::new(options("true")).unwrap();
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Unreachable { .. }));
        assert!(!supervisor.is_started());
    }

    #[tokio::test]
    async fn test_runtime_dir_is_private_tempdir() {
        let supervisor = Supervisor::new(options("true")).unwrap();
        let dir = supervisor.runtime_dir().to_path_buf();
        assert!(dir.is_dir());
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("supervisor_"));

        drop(supervisor);
        assert!(!dir.exists());
    }
}
