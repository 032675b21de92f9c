//! ctfgate - task daemon supervisor and per-user task generator
//!
//! Usage:
//!   ctfgate serve <config.toml>                    Supervise all task daemons
//!   ctfgate run-daemon [-p PORT] <task.toml>       Run one task's daemon for debugging
//!   ctfgate validate <tasks_dir> [--database PATH] Build and print the task cache
//!   ctfgate generate [-d OUT_DIR] <tasks_dir> <task>
//!                                                  Run a generator once, without a database
//!   ctfgate pregenerate <config.toml> <task> <count>
//!   ctfgate flush <config.toml> <task>
//!   ctfgate control-plane <control.toml>           Internal: the supervised control plane

use anyhow::Context;
use ctfgate::cache::build_tasks_cache;
use ctfgate::config::{Config, WatchConfig};
use ctfgate::control::ProgramManager;
use ctfgate::daemon::{RoutingMode, TasksSupervisor};
use ctfgate::db::Database;
use ctfgate::generate::{run_generator, GenerationCoordinator};
use ctfgate::program::ControlConfig;
use ctfgate::routes::RouteTable;
use ctfgate::rpc::{RpcServer, PKG_NAME, VERSION};
use ctfgate::supervisor::{Supervisor, SupervisorOptions};
use ctfgate::tasks::{read_tasks, DirectoryTaskSource, SingleTaskSource, TaskSource};
use ctfgate::watch::spawn_task_watcher;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Incoming HTTP port of `run-daemon` when none is given
const DEFAULT_DEBUG_PORT: u16 = 8080;

const USAGE: &str = "\
Usage:
  ctfgate serve <config.toml>
  ctfgate run-daemon [-p PORT] <task.toml>
  ctfgate validate <tasks_dir> [--database PATH]
  ctfgate generate [-d OUT_DIR] <tasks_dir> <task>
  ctfgate pregenerate <config.toml> <task> <count>
  ctfgate flush <config.toml> <task>
  ctfgate control-plane <control.toml>";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Serve {
        config: PathBuf,
    },
    ControlPlane {
        config: PathBuf,
    },
    RunDaemon {
        port: u16,
        task: PathBuf,
    },
    Validate {
        tasks: PathBuf,
        database: Option<PathBuf>,
    },
    Generate {
        out_dir: PathBuf,
        tasks: PathBuf,
        name: String,
    },
    Pregenerate {
        config: PathBuf,
        task: String,
        count: usize,
    },
    Flush {
        config: PathBuf,
        task: String,
    },
    Help,
    Version,
}

/// Split `args` into `(options, positionals)`; options take one value each
fn split_options<'a>(
    args: &'a [String],
    known: &[&str],
) -> anyhow::Result<(Vec<(&'a str, &'a str)>, Vec<&'a str>)> {
    let mut options = Vec::new();
    let mut positionals = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.starts_with('-') && arg.len() > 1 {
            if !known.contains(&arg.as_str()) {
                anyhow::bail!("Unknown option: {}", arg);
            }
            let value = iter
                .next()
                .with_context(|| format!("Option {} requires a value", arg))?;
            options.push((arg.as_str(), value.as_str()));
        } else {
            positionals.push(arg.as_str());
        }
    }
    Ok((options, positionals))
}

fn expect_positionals<'a>(positionals: &[&'a str], names: &[&str]) -> anyhow::Result<Vec<&'a str>> {
    if positionals.len() != names.len() {
        anyhow::bail!("Expected arguments: {}", names.join(" "));
    }
    Ok(positionals.to_vec())
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    let Some((command, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),
        "serve" => {
            let (_, pos) = split_options(rest, &[])?;
            let pos = expect_positionals(&pos, &["<config.toml>"])?;
            Ok(Command::Serve {
                config: PathBuf::from(pos[0]),
            })
        }
        "control-plane" => {
            let (_, pos) = split_options(rest, &[])?;
            let pos = expect_positionals(&pos, &["<control.toml>"])?;
            Ok(Command::ControlPlane {
                config: PathBuf::from(pos[0]),
            })
        }
        "run-daemon" => {
            let (opts, pos) = split_options(rest, &["-p", "--port"])?;
            let pos = expect_positionals(&pos, &["<task.toml>"])?;
            let port = match opts.last() {
                Some((_, value)) => value
                    .parse()
                    .with_context(|| format!("Invalid port: {}", value))?,
                None => DEFAULT_DEBUG_PORT,
            };
            Ok(Command::RunDaemon {
                port,
                task: PathBuf::from(pos[0]),
            })
        }
        "validate" => {
            let (opts, pos) = split_options(rest, &["--database"])?;
            let pos = expect_positionals(&pos, &["<tasks_dir>"])?;
            Ok(Command::Validate {
                tasks: PathBuf::from(pos[0]),
                database: opts.last().map(|(_, value)| PathBuf::from(value)),
            })
        }
        "generate" => {
            let (opts, pos) = split_options(rest, &["-d", "--out-dir"])?;
            let pos = expect_positionals(&pos, &["<tasks_dir>", "<task>"])?;
            Ok(Command::Generate {
                out_dir: opts
                    .last()
                    .map(|(_, value)| PathBuf::from(value))
                    .unwrap_or_else(std::env::temp_dir),
                tasks: PathBuf::from(pos[0]),
                name: pos[1].to_string(),
            })
        }
        "pregenerate" => {
            let (_, pos) = split_options(rest, &[])?;
            let pos = expect_positionals(&pos, &["<config.toml>", "<task>", "<count>"])?;
            Ok(Command::Pregenerate {
                config: PathBuf::from(pos[0]),
                task: pos[1].to_string(),
                count: pos[2]
                    .parse()
                    .with_context(|| format!("Invalid count: {}", pos[2]))?,
            })
        }
        "flush" => {
            let (_, pos) = split_options(rest, &[])?;
            let pos = expect_positionals(&pos, &["<config.toml>", "<task>"])?;
            Ok(Command::Flush {
                config: PathBuf::from(pos[0]),
                task: pos[1].to_string(),
            })
        }
        other => anyhow::bail!("Unknown command: {}", other),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ctfgate=info".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(command).await {
        error!(error = %format!("{:#}", e), "Fatal error");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Help => println!("{}", USAGE),
        Command::Version => println!("{} {}", PKG_NAME, VERSION),
        Command::Serve { config } => serve(&config).await?,
        Command::ControlPlane { config } => control_plane(&config).await?,
        Command::RunDaemon { port, task } => run_daemon(port, &task).await?,
        Command::Validate { tasks, database } => validate(&tasks, database.as_deref())?,
        Command::Generate { out_dir, tasks, name } => generate(&out_dir, &tasks, &name).await?,
        Command::Pregenerate { config, task, count } => pregenerate(&config, &task, count).await?,
        Command::Flush { config, task } => flush(&config, &task)?,
    }
    Ok(())
}

/// Everything the supervised task loop needs, independent of where it came from
struct TasksOptions {
    source: Box<dyn TaskSource>,
    state_path: PathBuf,
    http_listen: Option<String>,
    proxy_executable: String,
    supervisor: SupervisorOptions,
    debounce: Duration,
    mode: RoutingMode,
}

async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let _pid_file = match &config.server.pid_file {
        Some(path) => {
            let pid_file = PidFile::create(path)?;
            info!(path = %path.display(), "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let supervisor = match &config.supervisor.control_plane_executable {
        Some(executable) => SupervisorOptions {
            executable: executable.clone(),
            probe_attempts: config.supervisor.probe_attempts,
            probe_interval: config.supervisor.probe_interval(),
        },
        None => SupervisorOptions {
            probe_attempts: config.supervisor.probe_attempts,
            probe_interval: config.supervisor.probe_interval(),
            ..SupervisorOptions::current_exe()?
        },
    };

    let result = run_tasks(TasksOptions {
        source: Box::new(DirectoryTaskSource::new(&config.server.tasks_path)?),
        state_path: config.server.daemons_state_path.clone(),
        http_listen: config.server.http_listen.clone(),
        proxy_executable: config.server.proxy_executable.clone(),
        supervisor,
        debounce: config.watch.debounce(),
        mode: RoutingMode::Hostnames,
    })
    .await;

    if let Some(path) = &config.server.pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    result
}

async fn run_daemon(port: u16, task: &Path) -> anyhow::Result<()> {
    let source = SingleTaskSource::new(task)?;
    let state_dir = tempfile::Builder::new()
        .prefix("ctfgate_run_daemon_")
        .tempdir()?;
    info!(
        state_dir = %state_dir.path().display(),
        port,
        "Created new state directory"
    );

    run_tasks(TasksOptions {
        source: Box::new(source),
        state_path: state_dir.path().to_path_buf(),
        http_listen: Some(port.to_string()),
        proxy_executable: "nginx".to_string(),
        supervisor: SupervisorOptions::current_exe()?,
        debounce: WatchConfig::default().debounce(),
        mode: RoutingMode::SingleTask,
    })
    .await
}

/// Apply the initial task set, start the control plane, then reload on every
/// debounced batch of changes until a shutdown signal or control-plane death.
async fn run_tasks(options: TasksOptions) -> anyhow::Result<()> {
    let supervisor = Arc::new(Supervisor::new(options.supervisor)?);
    let routes = RouteTable::new(
        supervisor.runtime_dir(),
        options.proxy_executable,
        options.http_listen,
    )?;
    // Edits made during the initial load arrive as the first batch
    let (batch_tx, batch_rx) = mpsc::channel(16);
    let _watcher = spawn_task_watcher(options.source.watch_root(), options.debounce, batch_tx)?;

    let mut tasks = TasksSupervisor::new(
        Arc::clone(&supervisor),
        options.source,
        supervisor.runtime_dir(),
        options.state_path,
        routes,
    )
    .with_mode(options.mode);

    // Registers programs only; the control plane launches them on start
    let report = tasks
        .reload(&BTreeSet::new())
        .await
        .context("Initial task load failed")?;
    info!(tasks = report.tasks, "Initial tasks loaded");

    supervisor.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reload_loop = tokio::spawn(tasks.run(batch_rx, shutdown_rx));

    let outcome = tokio::select! {
        signal = wait_for_shutdown_signal() => signal,
        status = supervisor.wait() => match status {
            Ok(status) => Err(anyhow::anyhow!("Control plane exited unexpectedly: {:?}", status)),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to wait for control plane")),
        },
    };

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), reload_loop).await.is_err() {
        warn!("Reload loop did not stop in time");
    }

    info!("Stopping control plane...");
    supervisor.terminate().await;
    info!("Shutdown complete");
    outcome
}

/// Serve the control-plane RPC and run the configured programs until SIGINT/SIGTERM
async fn control_plane(config_path: &Path) -> anyhow::Result<()> {
    let config = ControlConfig::load(config_path)?;
    let manager = ProgramManager::load(config_path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = RpcServer::new(config.socket, Arc::clone(&manager), shutdown_rx);
    // Bound before programs start so the supervisor's probes succeed early
    let listener = server.bind()?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!(error = %e, "Control-plane RPC server error");
        }
    });

    let starter = Arc::clone(&manager);
    tokio::spawn(async move {
        let results = starter.start_all(true).await;
        let failed = results.iter().filter(|r| !r.ok).count();
        info!(programs = results.len(), failed, "Initial programs started");
    });

    wait_for_shutdown_signal().await?;

    info!("Stopping all programs...");
    manager.stop_all().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    Ok(())
}

fn validate(tasks_path: &Path, database: Option<&Path>) -> anyhow::Result<()> {
    let tasks = read_tasks(tasks_path);
    let total = tasks.len();
    let cache = build_tasks_cache(tasks);

    for task in cache.tasks.values() {
        println!(
            "{}: flags={} generator={} daemon={} path={}",
            task.name,
            task.flags.len(),
            task.generator.is_some(),
            task.daemon.is_some(),
            task.path.display()
        );
    }
    info!(read = total, valid = cache.len(), "Tasks validated");

    if let Some(path) = database {
        let db = Database::open(path)?;
        // The flag check reads only the database
        let coordinator = GenerationCoordinator::new(db, PathBuf::new());
        let clashes = coordinator.sanity_check(&cache)?;
        if !clashes.is_empty() {
            anyhow::bail!("{} generated flag(s) clash with static flags", clashes.len());
        }
        info!(database = %path.display(), "No generated flag clashes");
    }

    if cache.len() != total {
        anyhow::bail!("{} of {} task(s) rejected", total - cache.len(), total);
    }
    Ok(())
}

async fn generate(out_dir: &Path, tasks_path: &Path, name: &str) -> anyhow::Result<()> {
    let cache = build_tasks_cache(read_tasks(tasks_path));
    let task = cache
        .get(name)
        .with_context(|| format!("Task {} doesn't exist", name))?;
    let group = cache.generator_group(task);

    let seed = uuid::Uuid::new_v4().to_string();
    let parent_dir = out_dir.join(format!("ctfgate_generate_{}", seed));
    std::fs::create_dir_all(&parent_dir)
        .with_context(|| format!("Cannot create {}", parent_dir.display()))?;
    info!(seed = %seed, output = %parent_dir.display(), "Generating task");

    let outputs = run_generator(&cache, task, &group, &seed, &parent_dir).await?;
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

fn open_coordinator(config_path: &Path) -> anyhow::Result<(Config, GenerationCoordinator)> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let db = Database::open(&config.generation.database_path)?;
    let coordinator = GenerationCoordinator::new(db, config.generation.attachments_path.clone());
    Ok((config, coordinator))
}

async fn pregenerate(config_path: &Path, task: &str, count: usize) -> anyhow::Result<()> {
    let (config, coordinator) = open_coordinator(config_path)?;
    let cache = build_tasks_cache(read_tasks(&config.server.tasks_path));

    coordinator.pregenerate(&cache, task, count).await?;
    let available = coordinator.pregenerated_count(task)?;
    info!(task, generated = count, available, "Pregeneration complete");
    println!("{}", available);
    Ok(())
}

fn flush(config_path: &Path, task: &str) -> anyhow::Result<()> {
    let (config, coordinator) = open_coordinator(config_path)?;
    let cache = build_tasks_cache(read_tasks(&config.server.tasks_path));

    let deleted = coordinator.flush(&cache, task)?;
    println!("{}", deleted);
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

/// PID file handle that maintains an exclusive lock
struct PidFile {
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Truncate only once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting task supervisor");
    info!(
        tasks_path = %config.server.tasks_path.display(),
        daemons_state_path = %config.server.daemons_state_path.display(),
        http_listen = ?config.server.http_listen,
        proxy = %config.server.proxy_executable,
        "Server configuration"
    );
    info!(
        probe_attempts = config.supervisor.probe_attempts,
        probe_interval_ms = config.supervisor.probe_interval_ms,
        debounce_ms = config.watch.debounce_ms,
        "Supervisor settings"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_serve() {
        assert_eq!(
            parse_command(&args(&["serve", "/etc/ctfgate.toml"])).unwrap(),
            Command::Serve {
                config: PathBuf::from("/etc/ctfgate.toml")
            }
        );
        assert!(parse_command(&args(&["serve"])).is_err());
    }

    #[test]
    fn test_parse_run_daemon_port() {
        assert_eq!(
            parse_command(&args(&["run-daemon", "task.toml"])).unwrap(),
            Command::RunDaemon {
                port: DEFAULT_DEBUG_PORT,
                task: PathBuf::from("task.toml")
            }
        );
        assert_eq!(
            parse_command(&args(&["run-daemon", "-p", "9000", "task.toml"])).unwrap(),
            Command::RunDaemon {
                port: 9000,
                task: PathBuf::from("task.toml")
            }
        );
        assert!(parse_command(&args(&["run-daemon", "-p", "http", "task.toml"])).is_err());
        assert!(parse_command(&args(&["run-daemon", "task.toml", "-p"])).is_err());
    }

    #[test]
    fn test_parse_validate_and_generate() {
        assert_eq!(
            parse_command(&args(&["validate", "tasks", "--database", "db.sqlite"])).unwrap(),
            Command::Validate {
                tasks: PathBuf::from("tasks"),
                database: Some(PathBuf::from("db.sqlite"))
            }
        );
        assert_eq!(
            parse_command(&args(&["generate", "-d", "/tmp/out", "tasks", "crypto"])).unwrap(),
            Command::Generate {
                out_dir: PathBuf::from("/tmp/out"),
                tasks: PathBuf::from("tasks"),
                name: "crypto".to_string()
            }
        );
    }

    #[test]
    fn test_parse_organizer_commands() {
        assert_eq!(
            parse_command(&args(&["pregenerate", "c.toml", "web", "10"])).unwrap(),
            Command::Pregenerate {
                config: PathBuf::from("c.toml"),
                task: "web".to_string(),
                count: 10
            }
        );
        assert!(parse_command(&args(&["pregenerate", "c.toml", "web", "many"])).is_err());
        assert_eq!(
            parse_command(&args(&["flush", "c.toml", "web"])).unwrap(),
            Command::Flush {
                config: PathBuf::from("c.toml"),
                task: "web".to_string()
            }
        );
    }

    #[test]
    fn test_parse_help_and_unknown() {
        assert_eq!(parse_command(&[]).unwrap(), Command::Help);
        assert_eq!(parse_command(&args(&["--help"])).unwrap(), Command::Help);
        assert!(parse_command(&args(&["deploy"])).is_err());
        assert!(parse_command(&args(&["validate", "tasks", "--verbose", "x"])).is_err());
    }

    #[test]
    fn test_pid_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/ctfgate.pid");

        let first = PidFile::create(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        // flock locks belong to the open file description, so a second open conflicts
        assert!(PidFile::create(&path).is_err());
        drop(first);
        assert!(PidFile::create(&path).is_ok());
    }
}
