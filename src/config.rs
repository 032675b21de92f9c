use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the task supervisor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Control plane startup and location
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Task tree watching
    #[serde(default)]
    pub watch: WatchConfig,

    /// Dynamic task generation
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Root of the task definition tree
    #[serde(default = "default_tasks_path")]
    pub tasks_path: PathBuf,

    /// Parent of the per-task daemon state directories
    #[serde(default = "default_daemons_state_path")]
    pub daemons_state_path: PathBuf,

    /// Public HTTP listener of the proxy, as an nginx `listen` value
    /// (e.g. "8080" or "unix:/run/ctfgate/http.sock"). No HTTP block when unset.
    pub http_listen: Option<String>,

    /// Reverse proxy binary (default: nginx)
    #[serde(default = "default_proxy_executable")]
    pub proxy_executable: String,

    /// Path to PID file (optional)
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tasks_path: default_tasks_path(),
            daemons_state_path: default_daemons_state_path(),
            http_listen: None,
            proxy_executable: default_proxy_executable(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Version probes before the control plane counts as failed (default: 20)
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Delay between probes in milliseconds (default: 100)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Binary run as `<exe> control-plane <config>`; the running binary when unset
    pub control_plane_executable: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval(),
            control_plane_executable: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Quiet period before a burst of changes triggers a reload (default: 2000)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root of the generated files (per user and pregenerated pool)
    #[serde(default = "default_attachments_path")]
    pub attachments_path: PathBuf,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            attachments_path: default_attachments_path(),
        }
    }
}

// Default value functions
fn default_tasks_path() -> PathBuf {
    PathBuf::from("tasks")
}

fn default_daemons_state_path() -> PathBuf {
    PathBuf::from("state/daemons")
}

fn default_proxy_executable() -> String {
    "nginx".to_string()
}

fn default_probe_attempts() -> u32 {
    20
}

fn default_probe_interval() -> u64 {
    100
}

fn default_debounce() -> u64 {
    2000 // 2 seconds
}

fn default_database_path() -> PathBuf {
    PathBuf::from("state/ctfgate.db")
}

fn default_attachments_path() -> PathBuf {
    PathBuf::from("state/attachments")
}

impl Config {
    /// Load and validate; relative paths are taken from the config file's directory
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.server.tasks_path);
        resolve(&mut self.server.daemons_state_path);
        if let Some(pid_file) = self.server.pid_file.as_mut() {
            resolve(pid_file);
        }
        if let Some(exe) = self.supervisor.control_plane_executable.as_mut() {
            resolve(exe);
        }
        resolve(&mut self.generation.database_path);
        resolve(&mut self.generation.attachments_path);
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.proxy_executable.trim().is_empty() {
            errors.push("server.proxy_executable must not be empty".to_string());
        }
        if let Some(listen) = &self.server.http_listen {
            if listen.trim().is_empty() {
                errors.push("server.http_listen must not be empty when set".to_string());
            }
        }
        if self.supervisor.probe_attempts == 0 {
            errors.push("supervisor.probe_attempts must be greater than 0".to_string());
        }
        if self.watch.debounce_ms == 0 {
            errors.push("watch.debounce_ms must be greater than 0".to_string());
        }
        if self.generation.database_path == self.generation.attachments_path {
            errors.push("generation.database_path and generation.attachments_path must differ".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
tasks_path = "/srv/tasks"
http_listen = "unix:/run/ctfgate/http.sock"
pid_file = "/run/ctfgate.pid"

[supervisor]
probe_attempts = 5
probe_interval_ms = 250

[watch]
debounce_ms = 500

[generation]
database_path = "/srv/state/ctfgate.db"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.tasks_path, PathBuf::from("/srv/tasks"));
        assert_eq!(
            config.server.http_listen.as_deref(),
            Some("unix:/run/ctfgate/http.sock")
        );
        assert_eq!(config.supervisor.probe_attempts, 5);
        assert_eq!(config.supervisor.probe_interval(), Duration::from_millis(250));
        assert_eq!(config.watch.debounce(), Duration::from_millis(500));
        assert_eq!(config.generation.attachments_path, PathBuf::from("state/attachments"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.proxy_executable, "nginx");
        assert_eq!(config.server.http_listen, None);
        assert_eq!(config.supervisor.probe_attempts, 20);
        assert_eq!(config.supervisor.probe_interval_ms, 100);
        assert_eq!(config.watch.debounce_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[server]
proxy_executable = ""

[supervisor]
probe_attempts = 0

[watch]
debounce_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("proxy_executable"));
        assert!(err.contains("probe_attempts"));
        assert!(err.contains("debounce_ms"));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctfgate.toml");
        std::fs::write(
            &path,
            "[server]\ntasks_path = \"tasks\"\npid_file = \"/run/x.pid\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.tasks_path, dir.path().join("tasks"));
        assert_eq!(config.server.pid_file, Some(PathBuf::from("/run/x.pid")));
        assert_eq!(
            config.generation.database_path,
            dir.path().join("state/ctfgate.db")
        );
    }

    #[test]
    fn test_wrong_field_type_is_rejected() {
        assert!(toml::from_str::<Config>("[server]\ntasks_path = 3\n").is_err());
    }
}
