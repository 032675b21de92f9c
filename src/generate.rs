//! Per-user generation of dynamic task instances
//!
//! A generator runs once per group of tasks sharing a multi-generator key. The
//! database rows are the source of truth for who owns which instance; files
//! live under `<attachments>/<user>/<task>` or, for the pregenerated pool,
//! under `<attachments>/pregenerated/<seed>/<task>`.

use crate::cache::TasksCache;
use crate::db::{ClaimOutcome, Database, GeneratedInstance, UserId};
use crate::error::GenerateError;
use crate::tasks::Task;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

const POOL_DIR: &str = "pregenerated";

/// What a generator reports for one task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOutput {
    pub flags: BTreeSet<String>,
    pub substitutions: serde_json::Map<String, serde_json::Value>,
    pub urls: Vec<String>,
    pub bullets: Vec<String>,
}

/// A generated flag that is also some task's static flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagClash {
    pub task: String,
    pub flag: String,
    pub static_owner: String,
}

/// Lower-case flags and check them against the static flags
fn convert_output(cache: &TasksCache, task: &Task, output: GeneratorOutput) -> Result<GeneratorOutput, GenerateError> {
    if output.flags.is_empty() && task.flags.is_empty() {
        return Err(GenerateError::NoFlags(task.name.clone()));
    }

    let mut flags = BTreeSet::new();
    for raw in output.flags {
        let flag = raw.to_lowercase();
        if flag != raw {
            warn!(task = %task.name, flag = %raw, "Generated flag contains uppercase letters; flags are case-insensitive");
        }
        if cache.static_flag_owner(&flag).is_some() {
            return Err(GenerateError::FlagClash {
                task: task.name.clone(),
                flag,
            });
        }
        flags.insert(flag);
    }

    Ok(GeneratorOutput { flags, ..output })
}

/// Rename, falling back to copy and remove across filesystems
fn move_path(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            copy_recursive(from, to)?;
            if from.is_dir() {
                std::fs::remove_dir_all(from)
            } else {
                std::fs::remove_file(from)
            }
        }
        other => other,
    }
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if !from.is_dir() {
        std::fs::copy(from, to)?;
        return Ok(());
    }
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

/// Sorted (directories, files) directly under `dir`
fn list_entries(dir: &Path) -> std::io::Result<(Vec<String>, Vec<String>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

/// Move a task's `attachments/` (flat files) and `static/` output into `parent_dir/<task>`
fn collect_output(task: &str, from_dir: &Path, parent_dir: &Path) -> std::io::Result<()> {
    let (top_dirs, top_files) = list_entries(from_dir)?;
    for file in top_files {
        warn!(task, file = %file, "Generator created a top-level file; ignored");
    }

    for top_dir in top_dirs {
        let source = from_dir.join(&top_dir);
        match top_dir.as_str() {
            "attachments" => {
                let (dirs, files) = list_entries(&source)?;
                for dir in dirs {
                    warn!(task, dir = %dir, "Generator created a directory as an attachment; ignored");
                }
                if files.is_empty() {
                    continue;
                }
                let target = parent_dir.join(task).join("attachments");
                std::fs::create_dir_all(&target)?;
                for file in files {
                    move_path(&source.join(&file), &target.join(&file))?;
                }
            }
            "static" => {
                let (dirs, files) = list_entries(&source)?;
                if dirs.is_empty() && files.is_empty() {
                    continue;
                }
                let task_dir = parent_dir.join(task);
                std::fs::create_dir_all(&task_dir)?;
                move_path(&source, &task_dir.join("static"))?;
            }
            other => {
                warn!(task, dir = %other, "Generator created an unknown directory; ignored");
            }
        }
    }
    Ok(())
}

fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Run the generator of `initial` for the whole group `tasks` and place its
/// files under `parent_dir/<task>`. Nothing is written to `parent_dir` unless
/// every task's output is valid.
pub async fn run_generator(
    cache: &TasksCache,
    initial: &Task,
    tasks: &[String],
    seed: &str,
    parent_dir: &Path,
) -> Result<BTreeMap<String, GeneratorOutput>, GenerateError> {
    let generator = initial
        .generator
        .as_ref()
        .ok_or_else(|| GenerateError::NotDynamic(initial.name.clone()))?;
    let multi = generator.multi_generator.is_some();

    let root = tempfile::Builder::new().prefix("ctfgate_").tempdir()?;
    let tmp_dir = root.path().join("tmp");
    let out_dir = root.path().join("out");
    std::fs::create_dir(&tmp_dir)?;
    std::fs::create_dir(&out_dir)?;

    let task_out_dir = |name: &str| if multi { out_dir.join(name) } else { out_dir.clone() };
    for name in tasks {
        let dir = task_out_dir(name);
        std::fs::create_dir_all(dir.join("attachments"))?;
        std::fs::create_dir_all(dir.join("static"))?;
    }

    let (program, args) = generator
        .exec
        .split_first()
        .ok_or_else(|| GenerateError::NotDynamic(initial.name.clone()))?;
    let output = Command::new(program)
        .args(args)
        .arg(seed)
        .arg(&out_dir)
        .arg(tasks.join(","))
        .current_dir(&generator.cwd)
        .env("TMPDIR", &tmp_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await?;

    let parsed = if output.status.success() {
        parse_output(cache, initial, tasks, multi, &output.stdout)
    } else {
        Err(GenerateError::ExitStatus(output.status))
    };
    let outputs = match parsed {
        Ok(outputs) => outputs,
        Err(e) => {
            warn!(
                task = %initial.name,
                stdout = %String::from_utf8_lossy(&output.stdout),
                "Generator failed"
            );
            return Err(e);
        }
    };

    for name in tasks {
        collect_output(name, &task_out_dir(name), parent_dir)?;
    }

    Ok(outputs)
}

fn parse_output(
    cache: &TasksCache,
    initial: &Task,
    tasks: &[String],
    multi: bool,
    stdout: &[u8],
) -> Result<BTreeMap<String, GeneratorOutput>, GenerateError> {
    if !multi {
        let output: GeneratorOutput = serde_json::from_slice(stdout)?;
        return Ok(BTreeMap::from([(
            initial.name.clone(),
            convert_output(cache, initial, output)?,
        )]));
    }

    let mut raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(stdout)?;
    let mut outputs = BTreeMap::new();
    for name in tasks {
        let task = cache
            .get(name)
            .ok_or_else(|| GenerateError::UnknownTask(name.clone()))?;
        let value = raw
            .remove(name)
            .ok_or_else(|| GenerateError::MissingOutput(name.clone()))?;
        let output: GeneratorOutput = serde_json::from_value(value)?;
        outputs.insert(name.clone(), convert_output(cache, task, output)?);
    }
    Ok(outputs)
}

/// Obtains or creates generated instances, coordinating through the database
/// with every other process sharing it
#[derive(Clone)]
pub struct GenerationCoordinator {
    db: Database,
    attachments_path: PathBuf,
}

impl GenerationCoordinator {
    pub fn new(db: Database, attachments_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            attachments_path: attachments_path.into(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn user_dir(&self, user_id: UserId) -> PathBuf {
        self.attachments_path.join(user_id.to_string())
    }

    fn pool_dir(&self, seed: &str) -> PathBuf {
        self.attachments_path.join(POOL_DIR).join(seed)
    }

    /// Where an instance's files live
    pub fn instance_dir(&self, instance: &GeneratedInstance) -> PathBuf {
        self.parent_dir(instance.user_id, &instance.random_seed)
            .join(&instance.task_name)
    }

    /// Tasks generated together with `task`, sorted
    fn group<'a>(&self, cache: &'a TasksCache, task: &str) -> Result<(&'a Task, Vec<String>), GenerateError> {
        let task = cache
            .get(task)
            .ok_or_else(|| GenerateError::UnknownTask(task.to_string()))?;
        if !task.is_dynamic() {
            return Err(GenerateError::NotDynamic(task.name.clone()));
        }
        Ok((task, cache.generator_group(task)))
    }

    /// The user's instance of `task`, generating it on first request
    pub async fn get_or_generate(
        &self,
        cache: &TasksCache,
        user_id: UserId,
        task: &str,
    ) -> Result<GeneratedInstance, GenerateError> {
        if let Some(instance) = self.db.find_instance(task, user_id)? {
            return Ok(instance);
        }
        self.generate(cache, Some(user_id), task).await
    }

    /// Generate `task` (and its group) for a user, or for the pool when
    /// `user_id` is `None`. A returned instance that is not finished is being
    /// generated by another requester.
    pub async fn generate(
        &self,
        cache: &TasksCache,
        user_id: Option<UserId>,
        task: &str,
    ) -> Result<GeneratedInstance, GenerateError> {
        let (initial, tasks) = self.group(cache, task)?;
        let seed = Uuid::new_v4().to_string();

        if let Some(user_id) = user_id {
            if let Some(claimed) = self.claim_pregenerated(&tasks, user_id)? {
                if let Some(instance) = claimed.into_iter().find(|i| i.task_name == initial.name) {
                    return Ok(instance);
                }
            }
        }

        let Some(ids) = self.db.create_empty_instances(&tasks, user_id, &seed)? else {
            // A concurrent request for the same user got there first; its
            // files are left alone
            let existing = match user_id {
                Some(user_id) => self.db.find_instance(&initial.name, user_id)?,
                // Pool rows have no owner and never conflict
                None => None,
            };
            return existing.ok_or_else(|| GenerateError::MissingOutput(initial.name.clone()));
        };

        // The rows are ours, so anything left under the task directories is stale
        let parent_dir = self.parent_dir(user_id, &seed);
        self.clean_task_dirs(&parent_dir, &tasks);

        let result = self.generate_in(cache, initial, &tasks, user_id, &seed, &ids).await;
        if result.is_err() {
            self.clean_task_dirs(&parent_dir, &tasks);
            if user_id.is_none() {
                let _ = std::fs::remove_dir(&parent_dir);
            }
        }
        result
    }

    fn clean_task_dirs(&self, parent_dir: &Path, tasks: &[String]) {
        for name in tasks {
            if let Err(e) = remove_dir_if_exists(&parent_dir.join(name)) {
                warn!(task = %name, error = %e, "Failed to remove generated files");
            }
        }
    }

    fn parent_dir(&self, user_id: Option<UserId>, seed: &str) -> PathBuf {
        match user_id {
            Some(user_id) => self.user_dir(user_id),
            None => self.pool_dir(seed),
        }
    }

    async fn generate_in(
        &self,
        cache: &TasksCache,
        initial: &Task,
        tasks: &[String],
        user_id: Option<UserId>,
        seed: &str,
        ids: &BTreeMap<String, i64>,
    ) -> Result<GeneratedInstance, GenerateError> {
        let parent_dir = self.parent_dir(user_id, seed);
        let requester = match user_id {
            Some(user_id) => user_id.to_string(),
            None => "<pregenerated>".to_string(),
        };

        info!(tasks = ?tasks, user = %requester, seed, "Generating dynamic tasks");
        let generated = async {
            std::fs::create_dir_all(&parent_dir)?;
            let outputs = run_generator(cache, initial, tasks, seed, &parent_dir).await?;
            let results: BTreeMap<i64, &GeneratorOutput> = outputs
                .iter()
                .filter_map(|(name, output)| ids.get(name).map(|id| (*id, output)))
                .collect();
            self.db.complete_instances(&results)?;
            Ok::<_, GenerateError>(())
        }
        .await;

        if let Err(source) = generated {
            let all: Vec<i64> = ids.values().copied().collect();
            if let Err(e) = self.db.delete_instances(&all) {
                error!(tasks = ?tasks, error = %format!("{:#}", e), "Failed to roll back generated tasks");
            }
            return Err(GenerateError::Failed {
                tasks: tasks.to_vec(),
                requester,
                source: Box::new(source),
            });
        }
        info!(tasks = ?tasks, user = %requester, "Successfully generated dynamic tasks");

        let initial_id = ids
            .get(&initial.name)
            .copied()
            .ok_or_else(|| GenerateError::MissingOutput(initial.name.clone()))?;

        if user_id.is_none() {
            // Claimed by a user while the generator ran
            if let Some(owner) = self.db.owner_of(initial_id)? {
                self.move_pregenerated(seed, tasks, owner)?;
            }
        }

        self.db
            .find_instance_by_id(initial_id)?
            .ok_or_else(|| GenerateError::MissingOutput(initial.name.clone()))
    }

    /// Take over a pool instance of `tasks` for `user_id`.
    ///
    /// Contended seeds are skipped for the rest of the call, so the loop ends
    /// once every pool seed was tried.
    pub fn claim_pregenerated(
        &self,
        tasks: &[String],
        user_id: UserId,
    ) -> Result<Option<Vec<GeneratedInstance>>, GenerateError> {
        let Some(first) = tasks.first() else {
            return Ok(None);
        };
        let mut skipped: HashSet<String> = HashSet::new();

        loop {
            let Some(seed) = self.db.find_unclaimed_seed(first, &skipped)? else {
                return Ok(None);
            };

            match self.db.claim_seed(&seed, tasks, user_id)? {
                ClaimOutcome::Claimed(instances) => {
                    let finished = instances.iter().all(GeneratedInstance::is_finished);
                    if finished {
                        self.move_pregenerated(&seed, tasks, user_id)?;
                    }
                    info!(tasks = ?tasks, seed = %seed, user = user_id, finished, "Using pregenerated tasks");
                    return Ok(Some(instances));
                }
                ClaimOutcome::AlreadyOwned => {
                    // A concurrent request for this user won; hand back its rows
                    let mut owned = Vec::with_capacity(tasks.len());
                    for name in tasks {
                        if let Some(instance) = self.db.find_instance(name, user_id)? {
                            owned.push(instance);
                        }
                    }
                    return Ok(Some(owned));
                }
                ClaimOutcome::Contended => {
                    skipped.insert(seed);
                }
                ClaimOutcome::Vanished => {}
            }
        }
    }

    /// Move pool files of `seed` to the user. Safe to run from several
    /// claimers at once: already-moved and missing directories are fine.
    pub fn move_pregenerated(&self, seed: &str, tasks: &[String], user_id: UserId) -> std::io::Result<()> {
        let from_parent = self.pool_dir(seed);
        let to_parent = self.user_dir(user_id);
        std::fs::create_dir_all(&to_parent)?;

        for name in tasks {
            match std::fs::rename(from_parent.join(name), to_parent.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) if matches!(e.raw_os_error(), Some(libc::EEXIST) | Some(libc::ENOTEMPTY)) => {}
                Err(e) => return Err(e),
            }
        }

        // Fails while a generator still writes here; that one moves its own files
        let _ = std::fs::remove_dir(&from_parent);
        Ok(())
    }

    /// Fill the pool with `count` instances of `task`
    pub async fn pregenerate(
        &self,
        cache: &TasksCache,
        task: &str,
        count: usize,
    ) -> Result<Vec<GeneratedInstance>, GenerateError> {
        let mut instances = Vec::with_capacity(count);
        for _ in 0..count {
            instances.push(self.generate(cache, None, task).await?);
        }
        Ok(instances)
    }

    pub fn pregenerated_count(&self, task: &str) -> Result<usize, GenerateError> {
        Ok(self.db.pregenerated_count(task)?)
    }

    /// Delete every finished instance of `task`'s group, one at a time.
    /// Returns the number of deleted instances.
    pub fn flush(&self, cache: &TasksCache, task: &str) -> Result<usize, GenerateError> {
        let (_, tasks) = self.group(cache, task)?;
        let instances = self.db.finished_instances(&tasks)?;

        for instance in &instances {
            self.db.delete_instance(instance.id)?;
            let dir = self.instance_dir(instance);
            if let Err(e) = remove_dir_if_exists(&dir) {
                warn!(dir = %dir.display(), error = %e, "Failed to remove generated files");
            }
        }

        info!(tasks = ?tasks, deleted = instances.len(), "Flushed generated tasks");
        Ok(instances.len())
    }

    /// Names of the user's generated attachments for `task`
    pub fn attachments(&self, user_id: UserId, task: &str) -> Result<Vec<String>, GenerateError> {
        let dir = self.user_dir(user_id).join(task).join("attachments");
        match list_entries(&dir) {
            Ok((_, files)) => Ok(files),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Generated flags that are now also static flags of some task
    pub fn sanity_check(&self, cache: &TasksCache) -> Result<Vec<FlagClash>, GenerateError> {
        let mut clashes = Vec::new();
        for (task, flag) in self.db.generated_flags()? {
            if let Some(owner) = cache.static_flag_owner(&flag) {
                error!(task = %task, flag = %flag, static_owner = %owner, "Generated flag clashes with a static flag");
                clashes.push(FlagClash {
                    task,
                    flag,
                    static_owner: owner.to_string(),
                });
            }
        }
        Ok(clashes)
    }
}
