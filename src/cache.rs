//! Validated task snapshot and its atomically swapped holder

use crate::routes::SocketKind;
use crate::tasks::{Task, TaskGenerator};
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, warn};

/// Tasks sharing one generator invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorGroup {
    pub generator: TaskGenerator,
    pub tasks: BTreeSet<String>,
}

/// An immutable, internally consistent view of all valid tasks
#[derive(Debug, Clone, Default)]
pub struct TasksCache {
    pub tasks: BTreeMap<String, Task>,
    /// Lower-cased static flag to the task declaring it
    pub static_flags: HashMap<String, String>,
    /// Multi-generator key to its group
    pub generator_groups: BTreeMap<String, GeneratorGroup>,
}

impl TasksCache {
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sorted names of the tasks generated together with `task` (itself included)
    pub fn generator_group(&self, task: &Task) -> Vec<String> {
        task.generator
            .as_ref()
            .and_then(|g| g.multi_generator.as_ref())
            .and_then(|key| self.generator_groups.get(key))
            .map(|group| group.tasks.iter().cloned().collect())
            .unwrap_or_else(|| vec![task.name.clone()])
    }

    pub fn static_flag_owner(&self, flag: &str) -> Option<&str> {
        self.static_flags.get(flag).map(String::as_str)
    }
}

/// Build a cache, dropping (with an error log) every task that conflicts
/// with one accepted before it.
pub fn build_tasks_cache(tasks: impl IntoIterator<Item = Task>) -> TasksCache {
    // Unique names
    let mut by_name: BTreeMap<String, Task> = BTreeMap::new();
    for task in tasks {
        if let Some(previous) = by_name.get(&task.name) {
            error!(
                task = %task.name,
                path = %task.path.display(),
                previous = %previous.path.display(),
                "Conflicting task name"
            );
            continue;
        }
        by_name.insert(task.name.clone(), task);
    }

    // Static flags: case-insensitive, unique across tasks
    let mut static_flags: HashMap<String, String> = HashMap::new();
    let mut accepted: BTreeMap<String, Task> = BTreeMap::new();
    for (name, mut task) in by_name {
        let mut local: BTreeSet<String> = BTreeSet::new();
        let mut conflict = None;
        for raw in &task.flags {
            let flag = raw.to_lowercase();
            if &flag != raw {
                warn!(task = %name, flag = %raw, "Flag contains uppercase letters; flags are case-insensitive");
            }
            if let Some(owner) = static_flags.get(&flag) {
                conflict = Some((flag, owner.clone()));
                break;
            }
            local.insert(flag);
        }
        if let Some((flag, owner)) = conflict {
            error!(task = %name, other = %owner, flag = %flag, "Conflicting flag");
            continue;
        }
        for flag in &local {
            static_flags.insert(flag.clone(), name.clone());
        }
        task.flags = local;
        accepted.insert(name, task);
    }

    // Multi-generators: identical configuration across the group
    let mut generator_groups: BTreeMap<String, GeneratorGroup> = BTreeMap::new();
    let mut grouped: BTreeMap<String, Task> = BTreeMap::new();
    for (name, task) in accepted {
        if let Some(generator) = &task.generator {
            if let Some(key) = &generator.multi_generator {
                let group = generator_groups
                    .entry(key.clone())
                    .or_insert_with(|| GeneratorGroup {
                        generator: generator.clone(),
                        tasks: BTreeSet::new(),
                    });
                if &group.generator != generator {
                    let others: Vec<&str> = group.tasks.iter().map(String::as_str).collect();
                    error!(
                        task = %name,
                        group = %key,
                        others = %others.join(", "),
                        "Multi-generator options differ from the rest of the group"
                    );
                    continue;
                }
                group.tasks.insert(name.clone());
            }
        }
        grouped.insert(name, task);
    }
    // A group whose first member was dropped above leaves no empty entry
    generator_groups.retain(|_, group| !group.tasks.is_empty());

    // Daemons: unique HTTP hostnames and TCP ports
    let mut hostnames: HashMap<String, String> = HashMap::new();
    let mut ports: HashMap<u16, String> = HashMap::new();
    let mut tasks: BTreeMap<String, Task> = BTreeMap::new();
    for (name, task) in grouped {
        if let Some(daemon) = &task.daemon {
            match daemon.socket_kind {
                SocketKind::Http => {
                    if let Some((hostname, owner)) = daemon
                        .http_hostnames
                        .iter()
                        .find_map(|h| hostnames.get(h).map(|owner| (h, owner)))
                    {
                        error!(task = %name, other = %owner, hostname = %hostname, "Conflicting HTTP hostname");
                        continue;
                    }
                    for hostname in &daemon.http_hostnames {
                        hostnames.insert(hostname.clone(), name.clone());
                    }
                }
                SocketKind::Tcp => {
                    if let Some(port) = daemon.tcp_port {
                        if let Some(owner) = ports.get(&port) {
                            error!(task = %name, other = %owner, port, "Conflicting TCP port");
                            continue;
                        }
                        ports.insert(port, name.clone());
                    }
                }
            }
        }
        tasks.insert(name, task);
    }

    // Later passes may have dropped tasks; keep only survivors
    static_flags.retain(|_, owner| tasks.contains_key(owner));
    for group in generator_groups.values_mut() {
        group.tasks.retain(|name| tasks.contains_key(name));
    }
    generator_groups.retain(|_, group| !group.tasks.is_empty());

    TasksCache {
        tasks,
        static_flags,
        generator_groups,
    }
}

/// Swappable snapshot: readers never see a half-built cache
#[derive(Clone, Default)]
pub struct SharedTasksCache {
    inner: Arc<ArcSwap<TasksCache>>,
}

impl SharedTasksCache {
    pub fn load(&self) -> Arc<TasksCache> {
        self.inner.load_full()
    }

    pub fn store(&self, cache: TasksCache) {
        self.inner.store(Arc::new(cache));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskDaemon;
    use std::path::PathBuf;

    fn task(name: &str, flags: &[&str]) -> Task {
        Task {
            path: PathBuf::from(format!("/tasks/{}/{}.toml", name, name)),
            name: name.to_string(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
            generator: None,
            daemon: None,
        }
    }

    fn generated(name: &str, key: Option<&str>, exec: &str) -> Task {
        let mut t = task(name, &[]);
        t.generator = Some(TaskGenerator {
            exec: vec![exec.to_string()],
            cwd: PathBuf::from("/tasks/gen"),
            multi_generator: key.map(str::to_string),
        });
        t
    }

    fn with_daemon(mut t: Task, kind: SocketKind, hostnames: &[&str], port: Option<u16>) -> Task {
        t.daemon = Some(TaskDaemon {
            exec: vec!["/bin/sleep".to_string(), "60".to_string()],
            cwd: PathBuf::from("/tasks"),
            socket: Some("app.sock".to_string()),
            socket_kind: kind,
            http_hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
            tcp_port: port,
        });
        t
    }

    #[test]
    fn test_duplicate_names_keep_first() {
        let mut second = task("a", &["flag{2}"]);
        second.path = PathBuf::from("/tasks/other/a.toml");
        let cache = build_tasks_cache(vec![task("a", &["flag{1}"]), second]);

        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").unwrap().flags.contains("flag{1}"));
        assert_eq!(cache.static_flag_owner("flag{2}"), None);
    }

    #[test]
    fn test_flags_lowercased_and_conflicts_dropped() {
        let cache = build_tasks_cache(vec![
            task("a", &["FLAG{Shared}"]),
            task("b", &["flag{shared}", "flag{b}"]),
        ]);

        assert!(cache.get("a").unwrap().flags.contains("flag{shared}"));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.static_flag_owner("flag{shared}"), Some("a"));
        assert_eq!(cache.static_flag_owner("flag{b}"), None);
    }

    #[test]
    fn test_generator_groups() {
        let cache = build_tasks_cache(vec![
            generated("crypto2", Some("crypto"), "/gen.sh"),
            generated("crypto1", Some("crypto"), "/gen.sh"),
            generated("crypto3", Some("crypto"), "/other.sh"),
            generated("solo", None, "/gen.sh"),
        ]);

        assert!(cache.get("crypto3").is_none());
        let group = &cache.generator_groups["crypto"];
        assert_eq!(group.tasks.len(), 2);

        let crypto2 = cache.get("crypto2").unwrap();
        assert_eq!(
            cache.generator_group(crypto2),
            vec!["crypto1".to_string(), "crypto2".to_string()]
        );
        let solo = cache.get("solo").unwrap();
        assert_eq!(cache.generator_group(solo), vec!["solo".to_string()]);
    }

    #[test]
    fn test_daemon_conflicts() {
        let cache = build_tasks_cache(vec![
            with_daemon(task("a", &["flag{a}"]), SocketKind::Http, &["web"], None),
            with_daemon(task("b", &["flag{b}"]), SocketKind::Http, &["api", "web"], None),
            with_daemon(task("c", &["flag{c}"]), SocketKind::Tcp, &[], Some(9001)),
            with_daemon(task("d", &["flag{d}"]), SocketKind::Tcp, &[], Some(9001)),
        ]);

        let names: Vec<&str> = cache.tasks.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "c"]);
        // Flags of dropped tasks do not linger
        assert_eq!(cache.static_flag_owner("flag{b}"), None);
        assert_eq!(cache.static_flag_owner("flag{d}"), None);
    }

    #[test]
    fn test_shared_cache_swaps_whole_snapshot() {
        let shared = SharedTasksCache::default();
        assert!(shared.load().is_empty());

        let reader = shared.clone();
        let before = reader.load();
        shared.store(build_tasks_cache(vec![task("a", &["flag{a}"])]));

        assert!(before.is_empty());
        assert_eq!(reader.load().len(), 1);
    }
}
