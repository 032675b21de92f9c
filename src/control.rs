//! Program manager run inside the control-plane process
//!
//! Holds the programs loaded from the control configuration, the groups that
//! are currently registered, and one OS process per registered group. Every
//! spawn gets a monitor task that owns the child, promotes it to `Running`
//! once it survives its start window, and applies the restart policy when it
//! exits.

use crate::error::{ControlError, RpcErrorCode};
use crate::program::{ControlConfig, ProgramDiff, ProgramSpec};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consecutive early exits tolerated before a program is marked fatal
const START_RETRIES: u32 = 3;

/// Backoff added per consecutive early exit
const BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Delay before restarting a program that exited after a successful start
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Interval for polling the state while waiting for a start to settle
const STATE_POLL_INTERVAL_MS: u64 = 50;

/// Lifecycle of a supervised program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramState {
    /// Never started, or stopped on request
    Stopped,
    /// Spawned, start window not elapsed yet
    Starting,
    /// Survived its start window
    Running,
    /// Exited and waiting to be started again
    Backoff,
    /// SIGTERM sent, waiting for exit
    Stopping,
    /// Exited on its own and will not be restarted
    Exited,
    /// Kept dying during its start window
    Fatal,
}

impl ProgramState {
    /// States in which an OS process exists
    pub fn has_process(self) -> bool {
        matches!(
            self,
            ProgramState::Starting | ProgramState::Running | ProgramState::Stopping
        )
    }
}

/// Snapshot of a program for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramStatus {
    pub name: String,
    pub state: ProgramState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

/// Per-program outcome of a start-all call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResult {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A registered group and its (at most one) process
struct ProgramProcess {
    spec: ProgramSpec,
    state: ProgramState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    /// Bumped on every spawn and on cancelled backoffs; monitors of older
    /// spawns leave the record alone.
    epoch: u64,
    /// Flips to true when the current spawn has exited and been recorded
    exited_rx: Option<watch::Receiver<bool>>,
    stop_requested: bool,
    retries: u32,
    exit_code: Option<i32>,
}

impl ProgramProcess {
    fn new(spec: ProgramSpec) -> Self {
        Self {
            spec,
            state: ProgramState::Stopped,
            pid: None,
            started_at: None,
            epoch: 0,
            exited_rx: None,
            stop_requested: false,
            retries: 0,
            exit_code: None,
        }
    }
}

/// What the monitor does after recording an exit
enum AfterExit {
    Idle,
    Restart(Duration),
}

/// Manages the registered programs of the control plane.
///
/// Like the rest of the control plane this is shared behind an `Arc`;
/// methods that spawn monitor tasks take `self: &Arc<Self>`.
pub struct ProgramManager {
    config_path: PathBuf,
    /// Programs as last read from the configuration file
    loaded: RwLock<BTreeMap<String, ProgramSpec>>,
    /// Registered groups keyed by program name
    groups: DashMap<String, Mutex<ProgramProcess>>,
}

impl ProgramManager {
    /// Create a manager with every configured program already registered
    pub fn new(config_path: PathBuf, programs: BTreeMap<String, ProgramSpec>) -> Arc<Self> {
        let groups = DashMap::new();
        for (name, spec) in &programs {
            groups.insert(name.clone(), Mutex::new(ProgramProcess::new(spec.clone())));
        }

        Arc::new(Self {
            config_path,
            loaded: RwLock::new(programs),
            groups,
        })
    }

    pub fn load<P: AsRef<Path>>(config_path: P) -> anyhow::Result<Arc<Self>> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = ControlConfig::load(&config_path)?;
        Ok(Self::new(config_path, config.programs))
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn get_state(&self, name: &str) -> Option<ProgramState> {
        self.groups.get(name).map(|p| p.lock().state)
    }

    pub fn get_pid(&self, name: &str) -> Option<u32> {
        self.groups.get(name).and_then(|p| p.lock().pid)
    }

    pub fn list_programs(&self) -> Vec<ProgramStatus> {
        let mut programs: Vec<ProgramStatus> = self
            .groups
            .iter()
            .map(|entry| {
                let guard = entry.value().lock();
                ProgramStatus {
                    name: entry.key().clone(),
                    state: guard.state,
                    pid: guard.pid,
                    exit_code: guard.exit_code,
                }
            })
            .collect();
        programs.sort_by(|a, b| a.name.cmp(&b.name));
        programs
    }

    /// Re-read the configuration file and compare it with the registered groups.
    ///
    /// Nothing is started or stopped here; the caller applies the diff.
    pub fn reload_config(&self) -> Result<ProgramDiff, ControlError> {
        let config = ControlConfig::load(&self.config_path)
            .map_err(|e| ControlError::new(RpcErrorCode::Failed, format!("{:#}", e)))?;

        let active: BTreeMap<String, ProgramSpec> = self
            .groups
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().spec.clone()))
            .collect();

        let diff = ProgramDiff::compute(&active, &config.programs);
        *self.loaded.write() = config.programs;

        info!(
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "Control configuration reloaded"
        );

        Ok(diff)
    }

    /// Register a loaded program.
    ///
    /// An already registered group whose spec differs from the loaded one is
    /// re-registered in place; the new spec applies from its next start.
    pub fn add_group(&self, name: &str) -> Result<(), ControlError> {
        let spec = self.loaded.read().get(name).cloned().ok_or_else(|| {
            ControlError::new(
                RpcErrorCode::BadName,
                format!("program not in configuration: {}", name),
            )
        })?;

        if let Some(process) = self.groups.get(name) {
            let mut guard = process.lock();
            if guard.spec == spec {
                return Err(ControlError::new(
                    RpcErrorCode::AlreadyAdded,
                    format!("program already added: {}", name),
                ));
            }
            guard.spec = spec;
            info!(program = name, "Program re-registered with new definition");
            return Ok(());
        }

        self.groups
            .insert(name.to_string(), Mutex::new(ProgramProcess::new(spec)));
        info!(program = name, "Program added");
        Ok(())
    }

    /// Unregister a group whose process is not alive
    pub fn remove_group(&self, name: &str) -> Result<(), ControlError> {
        {
            let process = self
                .groups
                .get(name)
                .ok_or_else(|| ControlError::bad_name(name))?;
            let state = process.lock().state;
            if state.has_process() || state == ProgramState::Backoff {
                return Err(ControlError::new(
                    RpcErrorCode::StillRunning,
                    format!("program {} is {:?}", name, state),
                ));
            }
        }

        self.groups.remove(name);
        info!(program = name, "Program removed");
        Ok(())
    }

    /// Start a program.
    ///
    /// With `wait` the call returns once the process survived its start
    /// window, or fails with `ABNORMAL_TERMINATION` if it died during it.
    pub async fn start_process(self: &Arc<Self>, name: &str, wait: bool) -> Result<(), ControlError> {
        let (epoch, start_window) = self.spawn_program(name, None)?;
        if !wait {
            return Ok(());
        }
        self.wait_started(name, epoch, start_window).await
    }

    /// Stop a program: SIGTERM, then SIGKILL after its stop grace period
    pub async fn stop_process(self: &Arc<Self>, name: &str, wait: bool) -> Result<(), ControlError> {
        let (pid, exited_rx, grace_period) = {
            let process = self
                .groups
                .get(name)
                .ok_or_else(|| ControlError::bad_name(name))?;
            let mut guard = process.lock();

            match guard.state {
                ProgramState::Backoff => {
                    // No process alive; cancel the pending restart
                    guard.state = ProgramState::Stopped;
                    guard.stop_requested = true;
                    guard.epoch += 1;
                    info!(program = name, "Pending restart cancelled");
                    return Ok(());
                }
                ProgramState::Starting | ProgramState::Running => {}
                state => {
                    return Err(ControlError::new(
                        RpcErrorCode::NotRunning,
                        format!("program {} is {:?}", name, state),
                    ));
                }
            }

            guard.stop_requested = true;
            guard.state = ProgramState::Stopping;
            (guard.pid, guard.exited_rx.clone(), guard.spec.stop_wait())
        };

        let program = name.to_string();
        let stopper = async move {
            let Some(pid) = pid else { return };
            info!(program = %program, pid, "Sending SIGTERM to program");
            send_signal(pid, libc::SIGTERM);

            let Some(mut exited_rx) = exited_rx else { return };
            let timed_out = tokio::time::timeout(grace_period, exited_rx.wait_for(|exited| *exited))
                .await
                .is_err();
            if timed_out {
                warn!(
                    program = %program,
                    pid,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                send_signal(pid, libc::SIGKILL);
                let _ = exited_rx.wait_for(|exited| *exited).await;
            }
        };

        if wait {
            stopper.await;
        } else {
            tokio::spawn(stopper);
        }

        Ok(())
    }

    /// Deliver a signal to a program's process
    pub fn signal_process(&self, name: &str, signum: i32) -> Result<(), ControlError> {
        if signum <= 0 || signum >= 64 {
            return Err(ControlError::new(
                RpcErrorCode::BadSignal,
                format!("invalid signal number: {}", signum),
            ));
        }

        let process = self
            .groups
            .get(name)
            .ok_or_else(|| ControlError::bad_name(name))?;
        let guard = process.lock();

        match (guard.state.has_process(), guard.pid) {
            (true, Some(pid)) => {
                debug!(program = name, pid, signum, "Signalling program");
                if send_signal(pid, signum) {
                    Ok(())
                } else {
                    Err(ControlError::new(
                        RpcErrorCode::BadSignal,
                        format!("failed to send signal {} to {}", signum, name),
                    ))
                }
            }
            _ => Err(ControlError::new(
                RpcErrorCode::NotRunning,
                format!("program {} is {:?}", name, guard.state),
            )),
        }
    }

    /// Start every registered program that has no live process
    pub async fn start_all(self: &Arc<Self>, wait: bool) -> Vec<StartResult> {
        let mut names: Vec<String> = self
            .groups
            .iter()
            .filter(|entry| {
                let state = entry.value().lock().state;
                !state.has_process() && state != ProgramState::Backoff
            })
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();

        let starts = names.into_iter().map(|name| async move {
            let result = self.start_process(&name, wait).await;
            if let Err(e) = &result {
                warn!(program = %name, error = %e, "Program failed to start");
            }
            StartResult {
                name,
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            }
        });

        futures::future::join_all(starts).await
    }

    /// Stop every program and wait for all of them to exit
    pub async fn stop_all(self: &Arc<Self>) {
        let names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        let stops = names.iter().map(|name| async move {
            if let Err(e) = self.stop_process(name, true).await {
                debug!(program = %name, error = %e, "Not stopped");
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Spawn the program's process and its monitor.
    ///
    /// `retry_of` carries the epoch of a backoff being resumed; a user start
    /// passes `None` and is refused while the program is alive or backing off.
    fn spawn_program(
        self: &Arc<Self>,
        name: &str,
        retry_of: Option<u64>,
    ) -> Result<(u64, Duration), ControlError> {
        let process = self
            .groups
            .get(name)
            .ok_or_else(|| ControlError::bad_name(name))?;
        let mut guard = process.lock();

        match retry_of {
            Some(epoch) => {
                if guard.epoch != epoch || guard.state != ProgramState::Backoff {
                    return Err(ControlError::new(
                        RpcErrorCode::NotRunning,
                        format!("restart of {} was cancelled", name),
                    ));
                }
            }
            None => {
                if guard.state.has_process() || guard.state == ProgramState::Backoff {
                    return Err(ControlError::new(
                        RpcErrorCode::AlreadyStarted,
                        format!("program {} is {:?}", name, guard.state),
                    ));
                }
                guard.retries = 0;
            }
        }

        let spec = guard.spec.clone();
        let mut child = match build_command(&spec).and_then(|mut cmd| {
            cmd.spawn().map_err(|e| {
                ControlError::new(
                    RpcErrorCode::SpawnError,
                    format!("failed to spawn {:?}: {}", spec.exec, e),
                )
            })
        }) {
            Ok(child) => child,
            Err(e) => {
                guard.state = ProgramState::Fatal;
                error!(program = name, error = %e, "Program could not be spawned");
                return Err(e);
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(name.to_string(), pid, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(name.to_string(), pid, "stderr", stderr));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        guard.epoch += 1;
        guard.state = ProgramState::Starting;
        guard.pid = pid;
        guard.started_at = Some(Instant::now());
        guard.exited_rx = Some(exited_rx);
        guard.stop_requested = false;
        let epoch = guard.epoch;
        let start_window = spec.start_window();
        drop(guard);
        drop(process);

        info!(program = name, pid, "Program spawned");

        let manager = Arc::clone(self);
        let program = name.to_string();
        tokio::spawn(async move {
            manager
                .monitor(program, epoch, child, exited_tx, start_window)
                .await;
        });

        Ok((epoch, start_window))
    }

    async fn monitor(
        self: Arc<Self>,
        name: String,
        epoch: u64,
        mut child: Child,
        exited_tx: watch::Sender<bool>,
        start_window: Duration,
    ) {
        let (status, early) = match tokio::time::timeout(start_window, child.wait()).await {
            Ok(status) => (status, true),
            Err(_) => {
                self.mark_running(&name, epoch);
                (child.wait().await, false)
            }
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(program = %name, error = %e, "Error waiting for program to exit");
                None
            }
        };

        let next = self.record_exit(&name, epoch, exit_code, early);
        let _ = exited_tx.send(true);

        if let AfterExit::Restart(delay) = next {
            tokio::time::sleep(delay).await;
            // The epoch is unchanged while the program sits in backoff
            if let Err(e) = self.spawn_program(&name, Some(epoch)) {
                debug!(program = %name, error = %e, "Restart skipped");
            }
        }
    }

    fn mark_running(&self, name: &str, epoch: u64) {
        let Some(process) = self.groups.get(name) else {
            return;
        };
        let mut guard = process.lock();
        if guard.epoch == epoch && guard.state == ProgramState::Starting {
            guard.state = ProgramState::Running;
            guard.retries = 0;
            info!(program = name, pid = guard.pid, "Program entered running state");
        }
    }

    fn record_exit(&self, name: &str, epoch: u64, exit_code: Option<i32>, early: bool) -> AfterExit {
        let Some(process) = self.groups.get(name) else {
            return AfterExit::Idle;
        };
        let mut guard = process.lock();
        if guard.epoch != epoch {
            return AfterExit::Idle;
        }

        guard.pid = None;
        guard.exit_code = exit_code;
        let uptime = guard.started_at.map(|t| t.elapsed()).unwrap_or_default();

        if guard.stop_requested {
            guard.state = ProgramState::Stopped;
            info!(program = name, ?exit_code, "Program stopped");
            return AfterExit::Idle;
        }

        if early {
            guard.retries += 1;
            if guard.retries > START_RETRIES {
                guard.state = ProgramState::Fatal;
                error!(
                    program = name,
                    ?exit_code,
                    retries = START_RETRIES,
                    "Program kept exiting during its start window, giving up"
                );
                return AfterExit::Idle;
            }
            guard.state = ProgramState::Backoff;
            let delay = BACKOFF_STEP * guard.retries;
            warn!(
                program = name,
                ?exit_code,
                uptime_ms = uptime.as_millis() as u64,
                retry = guard.retries,
                "Program exited during its start window"
            );
            return AfterExit::Restart(delay);
        }

        if guard.spec.autorestart.should_restart(exit_code) {
            guard.state = ProgramState::Backoff;
            warn!(program = name, ?exit_code, "Program exited, restarting");
            AfterExit::Restart(RESTART_DELAY)
        } else {
            guard.state = ProgramState::Exited;
            info!(program = name, ?exit_code, "Program exited");
            AfterExit::Idle
        }
    }

    async fn wait_started(&self, name: &str, epoch: u64, start_window: Duration) -> Result<(), ControlError> {
        // The monitor promotes the process right after the window; the slack
        // only matters for a stalled runtime.
        let deadline = Instant::now() + start_window + Duration::from_secs(5);

        loop {
            let current = self.groups.get(name).map(|p| {
                let guard = p.lock();
                (guard.epoch, guard.state, guard.exit_code)
            });

            match current {
                Some((e, ProgramState::Running, _)) if e == epoch => return Ok(()),
                Some((e, ProgramState::Starting, _)) if e == epoch => {}
                Some((_, state, exit_code)) => {
                    return Err(ControlError::new(
                        RpcErrorCode::AbnormalTermination,
                        format!(
                            "program {} did not stay up (state {:?}, exit code {:?})",
                            name, state, exit_code
                        ),
                    ));
                }
                None => return Err(ControlError::bad_name(name)),
            }

            if Instant::now() > deadline {
                return Err(ControlError::new(
                    RpcErrorCode::AbnormalTermination,
                    format!("program {} did not finish starting", name),
                ));
            }
            tokio::time::sleep(Duration::from_millis(STATE_POLL_INTERVAL_MS)).await;
        }
    }
}

fn build_command(spec: &ProgramSpec) -> Result<Command, ControlError> {
    let (program, args) = spec.exec.split_first().ok_or_else(|| {
        ControlError::new(RpcErrorCode::BadArguments, "program has an empty 'exec'")
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    Ok(cmd)
}

/// Returns false when the kernel rejected the signal
fn send_signal(pid: u32, signum: i32) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(pid as libc::pid_t, signum) == 0 }
}

async fn forward_output<R>(program: String, pid: Option<u32>, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(program = %program, pid, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(program = %program, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::AutoRestart;

    fn sleeper() -> ProgramSpec {
        ProgramSpec::new(["sleep", "60"])
            .with_start_secs(0)
            .with_stop_wait_secs(1)
    }

    fn create_test_manager(dir: &Path) -> Arc<ProgramManager> {
        let mut programs = BTreeMap::new();
        programs.insert("sleeper".to_string(), sleeper());
        let config = ControlConfig {
            socket: dir.join("control.sock"),
            programs: programs.clone(),
        };
        let path = dir.join("control.toml");
        config.write(&path).unwrap();
        ProgramManager::new(path, programs)
    }

    fn write_programs(dir: &Path, programs: BTreeMap<String, ProgramSpec>) {
        let config = ControlConfig {
            socket: dir.join("control.sock"),
            programs,
        };
        config.write(dir.join("control.toml")).unwrap();
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = create_test_manager(dir.path());

        assert!(manager.has_group("sleeper"));
        assert_eq!(manager.get_state("sleeper"), Some(ProgramState::Stopped));
        assert_eq!(manager.get_state("unknown"), None);
    }

    #[tokio::test]
    async fn test_start_and_stop_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = create_test_manager(dir.path());

        manager.start_process("sleeper", true).await.unwrap();
        assert_eq!(manager.get_state("sleeper"), Some(ProgramState::Running));
        assert!(manager.get_pid("sleeper").is_some());

        let err = manager.start_process("sleeper", true).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::AlreadyStarted);

        manager.stop_process("sleeper", true).await.unwrap();
        assert_eq!(manager.get_state("sleeper"), Some(ProgramState::Stopped));
        assert_eq!(manager.get_pid("sleeper"), None);

        let err = manager.stop_process("sleeper", true).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NotRunning);
    }

    #[tokio::test]
    async fn test_unknown_program_is_bad_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = create_test_manager(dir.path());

        let err = manager.start_process("nope", true).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::BadName);
        let err = manager.signal_process("nope", libc::SIGHUP).unwrap_err();
        assert_eq!(err.code, RpcErrorCode::BadName);
    }

    #[tokio::test]
    async fn test_remove_running_group_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = create_test_manager(dir.path());

        manager.start_process("sleeper", true).await.unwrap();
        let err = manager.remove_group("sleeper").unwrap_err();
        assert_eq!(err.code, RpcErrorCode::StillRunning);

        manager.stop_process("sleeper", true).await.unwrap();
        manager.remove_group("sleeper").unwrap();
        assert!(!manager.has_group("sleeper"));
    }

    #[tokio::test]
    async fn test_reload_and_reregister() {
        let dir = tempfile::tempdir().unwrap();
        let manager = create_test_manager(dir.path());

        let mut programs = BTreeMap::new();
        programs.insert("sleeper".to_string(), sleeper().with_env("MODE", "new"));
        programs.insert("other".to_string(), sleeper());
        write_programs(dir.path(), programs);

        let diff = manager.reload_config().unwrap();
        assert!(diff.added.contains("other"));
        assert!(diff.changed.contains("sleeper"));
        assert!(diff.removed.is_empty());

        // Changed spec: re-registered in place
        manager.add_group("sleeper").unwrap();
        manager.add_group("other").unwrap();
        let err = manager.add_group("other").unwrap_err();
        assert_eq!(err.code, RpcErrorCode::AlreadyAdded);

        // Nothing left to apply
        let diff = manager.reload_config().unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_early_exit_is_abnormal_termination() {
        let dir = tempfile::tempdir().unwrap();
        let mut programs = BTreeMap::new();
        programs.insert(
            "crasher".to_string(),
            ProgramSpec::new(["sh", "-c", "exit 3"])
                .with_start_secs(1)
                .with_autorestart(AutoRestart::False),
        );
        let manager = ProgramManager::new(dir.path().join("control.toml"), programs);

        let err = manager.start_process("crasher", true).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::AbnormalTermination);

        // Stop the retry loop so the test leaves nothing behind
        let _ = manager.stop_process("crasher", true).await;
    }

    #[tokio::test]
    async fn test_autorestart_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let script = format!("echo run >> {}; sleep 0.3", marker.display());

        let mut programs = BTreeMap::new();
        programs.insert(
            "flappy".to_string(),
            ProgramSpec::new(["sh".to_string(), "-c".to_string(), script])
                .with_start_secs(0)
                .with_stop_wait_secs(1)
                .with_autorestart(AutoRestart::True),
        );
        let manager = ProgramManager::new(dir.path().join("control.toml"), programs);

        manager.start_process("flappy", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let runs = std::fs::read_to_string(&marker).unwrap();
        assert!(runs.lines().count() >= 2, "expected a restart, got {:?}", runs);

        let _ = manager.stop_process("flappy", true).await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let mut programs = BTreeMap::new();
        programs.insert(
            "stubborn".to_string(),
            ProgramSpec::new(["sh", "-c", "trap '' TERM; exec sleep 30"])
                .with_start_secs(0)
                .with_stop_wait_secs(1),
        );
        let manager = ProgramManager::new(dir.path().join("control.toml"), programs);

        manager.start_process("stubborn", true).await.unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        manager.stop_process("stubborn", true).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(manager.get_state("stubborn"), Some(ProgramState::Stopped));
    }

    #[tokio::test]
    async fn test_start_all_and_stop_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut programs = BTreeMap::new();
        programs.insert("a".to_string(), sleeper());
        programs.insert("b".to_string(), sleeper());
        let manager = ProgramManager::new(dir.path().join("control.toml"), programs);

        let results = manager.start_all(true).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.ok));

        // Already running programs are skipped
        assert!(manager.start_all(true).await.is_empty());

        let listed = manager.list_programs();
        assert_eq!(listed[0].name, "a");
        assert!(listed.iter().all(|p| p.state == ProgramState::Running));

        manager.stop_all().await;
        assert!(manager
            .list_programs()
            .iter()
            .all(|p| p.state == ProgramState::Stopped));
    }

    #[tokio::test]
    async fn test_signal_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = create_test_manager(dir.path());

        let err = manager.signal_process("sleeper", libc::SIGHUP).unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NotRunning);

        manager.start_process("sleeper", true).await.unwrap();
        let err = manager.signal_process("sleeper", 0).unwrap_err();
        assert_eq!(err.code, RpcErrorCode::BadSignal);

        // SIGCONT is harmless to sleep
        manager.signal_process("sleeper", libc::SIGCONT).unwrap();

        manager.stop_process("sleeper", true).await.unwrap();
    }
}
