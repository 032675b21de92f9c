//! Task reload orchestrator
//!
//! Rebuilds the task cache, derives one program per task daemon plus the
//! proxy, updates the route table, applies the program set to the supervisor
//! and restarts daemons whose files were touched but whose spec did not change.

use crate::cache::{build_tasks_cache, SharedTasksCache, TasksCache};
use crate::program::{AutoRestart, ProgramDiff, ProgramSpec};
use crate::routes::{RouteTable, SocketKind, SocketSpec};
use crate::supervisor::ProgramControl;
use crate::tasks::{TaskDaemon, TaskSource};
use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const TASK_PROGRAM_PREFIX: &str = "task_";

pub fn task_program_name(task: &str) -> String {
    format!("{}{}", TASK_PROGRAM_PREFIX, task)
}

/// Task name of a daemon program, `None` for other programs
pub fn program_task_name(program: &str) -> Option<&str> {
    program.strip_prefix(TASK_PROGRAM_PREFIX)
}

/// Program running a task daemon: `<exec> <state_dir> <task>` with a private TMPDIR
pub fn daemon_program_spec(daemon: &TaskDaemon, task: &str, tmp_dir: &Path, state_dir: &Path) -> ProgramSpec {
    let mut exec = daemon.exec.clone();
    exec.push(state_dir.display().to_string());
    exec.push(task.to_string());

    // HOME is left alone; container tooling in daemons may need it
    ProgramSpec::new(exec)
        .with_cwd(daemon.cwd.clone())
        .with_env("TMPDIR", tmp_dir.display().to_string())
        .with_autorestart(AutoRestart::True)
}

/// How HTTP traffic reaches the daemons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Virtual hosts by hostname
    Hostnames,
    /// Everything goes to the only daemon's HTTP socket
    SingleTask,
}

/// Outcome of one reload cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub tasks: usize,
    pub diff: ProgramDiff,
    /// Touched programs restarted although their spec did not change
    pub restarted: BTreeSet<String>,
}

pub struct TasksSupervisor<C: ProgramControl> {
    control: Arc<C>,
    source: Box<dyn TaskSource>,
    runtime_dir: PathBuf,
    state_path: PathBuf,
    routes: RouteTable,
    mode: RoutingMode,
    cache: SharedTasksCache,
    daemon_specs: BTreeMap<String, ProgramSpec>,
}

impl<C: ProgramControl> TasksSupervisor<C> {
    pub fn new(
        control: Arc<C>,
        source: Box<dyn TaskSource>,
        runtime_dir: impl Into<PathBuf>,
        state_path: impl Into<PathBuf>,
        routes: RouteTable,
    ) -> Self {
        Self {
            control,
            source,
            runtime_dir: runtime_dir.into(),
            state_path: state_path.into(),
            routes,
            mode: RoutingMode::Hostnames,
            cache: SharedTasksCache::default(),
            daemon_specs: BTreeMap::new(),
        }
    }

    /// Set the routing mode (builder pattern)
    pub fn with_mode(mut self, mode: RoutingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Handle for readers of the current task snapshot
    pub fn cache(&self) -> SharedTasksCache {
        self.cache.clone()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn daemon_specs(&self) -> &BTreeMap<String, ProgramSpec> {
        &self.daemon_specs
    }

    fn task_tmp_dir(&self, task: &str) -> PathBuf {
        self.runtime_dir.join("tasks").join(task)
    }

    fn daemon_spec(&self, task: &str, daemon: &TaskDaemon) -> anyhow::Result<ProgramSpec> {
        let tmp_dir = self.task_tmp_dir(task);
        std::fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("Cannot create {}", tmp_dir.display()))?;
        let state_dir = self.state_path.join(task);
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Cannot create {}", state_dir.display()))?;

        Ok(daemon_program_spec(daemon, task, &tmp_dir, &state_dir))
    }

    fn socket_spec(&self, task: &str, daemon: &TaskDaemon) -> Option<SocketSpec> {
        let socket = daemon.socket.as_ref()?;
        Some(SocketSpec {
            kind: daemon.socket_kind,
            path: self.task_tmp_dir(task).join(socket),
            http_hostnames: daemon.http_hostnames.clone(),
            tcp_port: daemon.tcp_port,
        })
    }

    /// Run one reload cycle for the given batch of touched paths.
    ///
    /// On error the previous cache and daemon specs stay in place.
    pub async fn reload(&mut self, touched: &BTreeSet<PathBuf>) -> anyhow::Result<ReloadReport> {
        let cache = build_tasks_cache(self.source.read_tasks());
        info!(tasks = cache.len(), "Tasks reloaded");

        let mut daemon_specs = BTreeMap::new();
        let mut sockets = Vec::new();
        for (name, task) in &cache.tasks {
            let Some(daemon) = &task.daemon else { continue };
            daemon_specs.insert(name.clone(), self.daemon_spec(name, daemon)?);
            if let Some(socket) = self.socket_spec(name, daemon) {
                sockets.push(socket);
            }
        }

        let touched_programs: BTreeSet<String> = daemon_specs
            .keys()
            .filter(|name| is_touched(&cache, name, touched))
            .map(|name| task_program_name(name))
            .collect();

        let mut programs: BTreeMap<String, ProgramSpec> = daemon_specs
            .iter()
            .map(|(name, spec)| (task_program_name(name), spec.clone()))
            .collect();
        programs.insert(self.routes.program_name().to_string(), self.routes.program_spec());

        // Routes first, so the proxy never points at a socket of a daemon
        // started under an older route set
        let previous_sockets = self.routes.sockets().to_vec();
        self.routes
            .set_sockets(sockets, self.control.as_ref())
            .await
            .context("Route update failed")?;

        let diff = match self.control.set_programs(programs).await {
            Ok(diff) => diff,
            Err(e) => {
                if let Err(restore) = self
                    .routes
                    .set_sockets(previous_sockets, self.control.as_ref())
                    .await
                {
                    error!(error = %restore, "Failed to restore previous routes");
                }
                return Err(anyhow::Error::new(e).context("Applying programs failed"));
            }
        };

        let restarted: BTreeSet<String> = touched_programs
            .into_iter()
            .filter(|name| !diff.contains(name))
            .collect();

        let restarts = restarted.iter().map(|program| {
            let control = Arc::clone(&self.control);
            async move {
                let task = program_task_name(program).unwrap_or(program.as_str());
                info!(task, "Restarting daemon");
                if let Err(e) = control.restart(program).await {
                    warn!(task, error = %e, "Daemon restart failed");
                }
            }
        });
        futures::future::join_all(restarts).await;

        let report = ReloadReport {
            tasks: cache.len(),
            diff,
            restarted,
        };

        self.cache.store(cache);
        self.daemon_specs = daemon_specs;
        self.post_reload().await?;

        Ok(report)
    }

    async fn post_reload(&mut self) -> anyhow::Result<()> {
        if self.mode != RoutingMode::SingleTask {
            return Ok(());
        }

        let default = self
            .routes
            .sockets()
            .first()
            .filter(|s| s.kind == SocketKind::Http)
            .map(|s| s.path.clone());
        self.routes
            .set_default_http_socket(default, self.control.as_ref())
            .await
            .context("Setting the default HTTP socket failed")?;
        Ok(())
    }

    /// Serialise reload cycles: one batch at a time until the batch channel
    /// closes or shutdown is signalled.
    pub async fn run(
        mut self,
        mut batches: mpsc::Receiver<BTreeSet<PathBuf>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                batch = batches.recv() => {
                    let Some(touched) = batch else { break };
                    match self.reload(&touched).await {
                        Ok(report) => info!(
                            tasks = report.tasks,
                            added = report.diff.added.len(),
                            changed = report.diff.changed.len(),
                            removed = report.diff.removed.len(),
                            restarted = report.restarted.len(),
                            "Reload cycle complete"
                        ),
                        Err(e) => error!(error = %format!("{:#}", e), "Reload cycle aborted, previous state kept"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reload loop stopped");
    }
}

fn is_touched(cache: &TasksCache, task: &str, touched: &BTreeSet<PathBuf>) -> bool {
    let Some(task) = cache.get(task) else {
        return false;
    };
    let dir = task.dir();
    touched.iter().any(|path| path.starts_with(dir))
}
