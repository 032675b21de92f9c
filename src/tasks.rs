//! Task definitions read from a directory tree of TOML files
//!
//! Only the fields the supervisor and the generator need are modelled here;
//! everything else in a task file is ignored.

use crate::routes::SocketKind;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tracing::{error, warn};

pub fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// A command line given as one string or as a list of arguments
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawExec {
    Line(String),
    Args(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawGenerator {
    Table {
        exec: RawExec,
        cwd: Option<PathBuf>,
        multi_generator: Option<String>,
    },
    Exec(RawExec),
}

#[derive(Debug, Clone, Deserialize)]
struct RawDaemon {
    exec: RawExec,
    cwd: Option<PathBuf>,
    socket: Option<String>,
    #[serde(default)]
    socket_type: SocketKind,
    http_hostnames: Option<Vec<String>>,
    tcp_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTask {
    name: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    flags: Vec<String>,
    generator: Option<RawGenerator>,
    daemon: Option<RawDaemon>,
}

/// A task's generator program
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskGenerator {
    /// Resolved executable followed by its arguments
    pub exec: Vec<String>,
    pub cwd: PathBuf,
    /// Tasks sharing a key share one generator invocation
    pub multi_generator: Option<String>,
}

/// A task's long-running network service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDaemon {
    pub exec: Vec<String>,
    pub cwd: PathBuf,
    /// Socket file name inside the task's runtime directory
    pub socket: Option<String>,
    pub socket_kind: SocketKind,
    pub http_hostnames: BTreeSet<String>,
    pub tcp_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Path of the definition file
    pub path: PathBuf,
    pub name: String,
    /// Static flags as written in the definition
    pub flags: BTreeSet<String>,
    pub generator: Option<TaskGenerator>,
    pub daemon: Option<TaskDaemon>,
}

impl Task {
    /// Directory holding the task definition; edits anywhere below it touch the task
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("/"))
    }

    pub fn is_dynamic(&self) -> bool {
        self.generator.is_some()
    }
}

/// Lexically normalise a path (`.` and `..` removed) without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn absolute_from(base: &Path, path: &Path) -> PathBuf {
    normalize_path(&base.join(path))
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Split and resolve a command line.
///
/// Bare program names are looked up in `PATH`; anything with a directory part
/// is taken relative to `cwd`.
fn resolve_exec(cwd: &Path, raw: RawExec) -> anyhow::Result<Vec<String>> {
    let mut args = match raw {
        RawExec::Line(line) => shell_words::split(&line)
            .with_context(|| format!("Cannot parse command line: {}", line))?,
        RawExec::Args(args) => args,
    };
    let Some(program) = args.first() else {
        bail!("Executable should be a string or non-empty list of arguments");
    };

    let program_path = Path::new(program);
    let resolved = if program_path.parent().map_or(true, |p| p.as_os_str().is_empty()) {
        find_in_path(program).with_context(|| format!("Executable not found: {}", program))?
    } else {
        let candidate = absolute_from(cwd, program_path);
        if !candidate.is_file() {
            bail!("Executable not found: {}", program);
        }
        candidate
    };

    args[0] = resolved.display().to_string();
    Ok(args)
}

fn convert_generator(base_dir: &Path, raw: RawGenerator) -> anyhow::Result<TaskGenerator> {
    let (exec, cwd, multi_generator) = match raw {
        RawGenerator::Table {
            exec,
            cwd,
            multi_generator,
        } => (exec, cwd, multi_generator),
        RawGenerator::Exec(exec) => (exec, None, None),
    };
    let cwd = match cwd {
        Some(cwd) => absolute_from(base_dir, &cwd),
        None => base_dir.to_path_buf(),
    };
    let exec = resolve_exec(&cwd, exec).context("Invalid generator")?;
    Ok(TaskGenerator {
        exec,
        cwd,
        multi_generator,
    })
}

fn convert_daemon(default_hostname: &str, base_dir: &Path, raw: RawDaemon) -> anyhow::Result<TaskDaemon> {
    let cwd = match raw.cwd {
        Some(cwd) => absolute_from(base_dir, &cwd),
        None => base_dir.to_path_buf(),
    };
    let exec = resolve_exec(&cwd, raw.exec).context("Invalid daemon")?;

    let http_hostnames: BTreeSet<String> = match raw.http_hostnames {
        Some(hostnames) => {
            let count = hostnames.len();
            let set: BTreeSet<String> = hostnames.into_iter().collect();
            if set.len() != count {
                bail!("Repeating HTTP hostname in daemon");
            }
            set
        }
        None => BTreeSet::from([default_hostname.to_string()]),
    };

    match raw.socket_type {
        SocketKind::Tcp if raw.tcp_port.is_none() => {
            bail!("TCP port should be specified for TCP sockets")
        }
        SocketKind::Http if http_hostnames.is_empty() => {
            bail!("No hostnames specified for HTTP socket")
        }
        _ => {}
    }

    Ok(TaskDaemon {
        exec,
        cwd,
        socket: raw.socket,
        socket_kind: raw.socket_type,
        http_hostnames,
        tcp_port: raw.tcp_port,
    })
}

/// Parse one task file. Disabled tasks yield `None`.
pub fn read_task(path: &Path) -> anyhow::Result<Option<Task>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let raw: RawTask =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;

    if raw.disabled {
        return Ok(None);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let absolute = std::path::absolute(path)
        .with_context(|| format!("Cannot resolve {}", path.display()))?;
    let base_dir = absolute.parent().unwrap_or(Path::new("/")).to_path_buf();

    let name = raw.name.unwrap_or_else(|| stem.clone());
    if !is_valid_task_name(&name) {
        bail!("Invalid task name: {:?}", name);
    }

    let generator = raw
        .generator
        .map(|g| convert_generator(&base_dir, g))
        .transpose()?;
    let daemon = raw
        .daemon
        .map(|d| convert_daemon(&stem, &base_dir, d))
        .transpose()?;

    let flags: BTreeSet<String> = raw.flags.into_iter().collect();
    if generator.is_none() && flags.is_empty() {
        bail!("Non-dynamic tasks should have flags defined");
    }

    Ok(Some(Task {
        path: normalize_path(&absolute),
        name,
        flags,
        generator,
        daemon,
    }))
}

fn is_task_file(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !file_name.starts_with('.') && file_name.ends_with(".toml") && path.is_file()
}

/// Walk the tree; a directory with task files is a task directory and is not
/// descended into. Unreadable tasks are logged and skipped.
pub fn read_tasks(root: &Path) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot list task directory");
                continue;
            }
        };
        entries.sort();

        let task_files: Vec<&PathBuf> = entries.iter().filter(|p| is_task_file(p)).collect();
        if task_files.is_empty() {
            // Reverse so that popping visits subdirectories in sorted order
            pending.extend(entries.iter().filter(|p| p.is_dir()).rev().cloned());
            continue;
        }

        for path in task_files {
            match read_task(path) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => error!(path = %path.display(), error = %format!("{:#}", e), "Error while reading task"),
            }
        }
    }

    tasks
}

/// Where task definitions come from
pub trait TaskSource: Send + Sync {
    fn read_tasks(&self) -> Vec<Task>;

    /// Path to watch for changes
    fn watch_root(&self) -> &Path;
}

/// All tasks under a directory tree
#[derive(Debug, Clone)]
pub struct DirectoryTaskSource {
    root: PathBuf,
}

impl DirectoryTaskSource {
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .with_context(|| format!("Tasks directory not found: {}", root.display()))?;
        Ok(Self { root })
    }
}

impl TaskSource for DirectoryTaskSource {
    fn read_tasks(&self) -> Vec<Task> {
        read_tasks(&self.root)
    }

    fn watch_root(&self) -> &Path {
        &self.root
    }
}

/// One task file, for the single-task debug mode
#[derive(Debug, Clone)]
pub struct SingleTaskSource {
    path: PathBuf,
    dir: PathBuf,
}

impl SingleTaskSource {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let path = path
            .canonicalize()
            .with_context(|| format!("Task file not found: {}", path.display()))?;
        let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        Ok(Self { path, dir })
    }
}

impl TaskSource for SingleTaskSource {
    fn read_tasks(&self) -> Vec<Task> {
        match read_task(&self.path) {
            Ok(task) => task.into_iter().collect(),
            Err(e) => {
                error!(path = %self.path.display(), error = %format!("{:#}", e), "Error while reading task");
                Vec::new()
            }
        }
    }

    fn watch_root(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn write_script(path: &Path) {
        write(path, "#!/bin/sh\nexit 0\n");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_task_names() {
        assert!(is_valid_task_name("pwn-1.v2_final"));
        assert!(!is_valid_task_name("pwn 1"));
        assert!(!is_valid_task_name(""));
        assert!(!is_valid_task_name("a/b"));
    }

    #[test]
    fn test_static_task_defaults_name_to_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warmup/warmup.toml");
        write(&path, "flags = [\"flag{a}\"]\ntitle = \"ignored\"\n");

        let task = read_task(&path).unwrap().unwrap();
        assert_eq!(task.name, "warmup");
        assert!(task.flags.contains("flag{a}"));
        assert!(!task.is_dynamic());
        assert_eq!(task.dir(), dir.path().join("warmup"));
    }

    #[test]
    fn test_static_task_without_flags_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.toml");
        write(&path, "name = \"t\"\n");

        let err = read_task(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("should have flags"));
    }

    #[test]
    fn test_disabled_task_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.toml");
        write(&path, "disabled = true\n");

        assert!(read_task(&path).unwrap().is_none());
    }

    #[test]
    fn test_generator_relative_exec_and_string_form() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("gen");
        write_script(&task_dir.join("bin/generate.sh"));
        write(&task_dir.join("gen.toml"), "generator = \"./bin/generate.sh --fast\"\n");

        let task = read_task(&task_dir.join("gen.toml")).unwrap().unwrap();
        let generator = task.generator.unwrap();
        assert_eq!(generator.exec[0], task_dir.join("bin/generate.sh").display().to_string());
        assert_eq!(generator.exec[1], "--fast");
        assert_eq!(generator.cwd, task_dir);
        assert_eq!(generator.multi_generator, None);
    }

    #[test]
    fn test_daemon_defaults_and_path_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web/web.toml");
        write(
            &path,
            r#"
flags = ["flag{web}"]

[daemon]
exec = ["sh", "-c", "sleep 60"]
socket = "app.sock"
"#,
        );

        let task = read_task(&path).unwrap().unwrap();
        let daemon = task.daemon.unwrap();
        assert!(daemon.exec[0].ends_with("/sh"));
        assert_eq!(daemon.socket.as_deref(), Some("app.sock"));
        assert_eq!(daemon.socket_kind, SocketKind::Http);
        assert_eq!(daemon.http_hostnames, BTreeSet::from(["web".to_string()]));
    }

    #[test]
    fn test_tcp_daemon_requires_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pwn.toml");
        write(
            &path,
            r#"
flags = ["flag{pwn}"]

[daemon]
exec = "sleep 60"
socket = "pwn.sock"
socket_type = "tcp"
"#,
        );

        let err = read_task(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("TCP port"));
    }

    #[test]
    fn test_missing_executable_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.toml");
        write(&path, "generator = \"./nope.sh\"\n");

        let err = read_task(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Executable not found"));
    }

    #[test]
    fn test_read_tasks_stops_at_task_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("a/a.toml"), "flags = [\"flag{a}\"]\n");
        // Below a task directory: not a separate task
        write(&root.join("a/nested/inner.toml"), "flags = [\"flag{inner}\"]\n");
        write(&root.join("group/b/b.toml"), "flags = [\"flag{b}\"]\n");
        write(&root.join("group/c/.hidden.toml"), "flags = [\"flag{c}\"]\n");
        write(&root.join("broken/broken.toml"), "flags = 3\n");

        let names: Vec<String> = read_tasks(root).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_single_task_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solo/solo.toml");
        write(&path, "flags = [\"flag{solo}\"]\n");

        let source = SingleTaskSource::new(&path).unwrap();
        assert_eq!(source.read_tasks().len(), 1);
        assert_eq!(
            source.watch_root(),
            dir.path().canonicalize().unwrap().join("solo")
        );
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }
}
