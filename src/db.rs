//! SQLite storage for generated task instances
//!
//! One row per (user, task) instance plus its generated flags. Pool
//! (pregenerated) rows have no user. Several processes may share one database
//! file; claiming pool rows relies on SQLite write locks, not in-process locks.

use crate::generate::GeneratorOutput;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A seed locked by another claimer is skipped, not waited for
const CLAIM_BUSY_TIMEOUT: Duration = Duration::ZERO;

pub type UserId = i64;

/// A generated instance of one task for one user (or for the pool)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedInstance {
    pub id: i64,
    pub task_name: String,
    pub user_id: Option<UserId>,
    pub random_seed: String,
    /// `None` while the generator is still running
    pub substitutions: Option<serde_json::Map<String, serde_json::Value>>,
    pub urls: Option<Vec<String>>,
    pub bullets: Option<Vec<String>>,
    pub created_at: String,
}

impl GeneratedInstance {
    pub fn is_finished(&self) -> bool {
        self.substitutions.is_some()
    }
}

/// Result of one attempt to take over a pool seed
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Rows now belong to the claimer
    Claimed(Vec<GeneratedInstance>),
    /// Another claimer got (some of) the rows first
    Contended,
    /// Claimed, but the rows were deleted right after (failed generation)
    Vanished,
    /// The claimer already owns an instance of one of the tasks
    AlreadyOwned,
}

const INSTANCE_COLUMNS: &str =
    "id, task_name, user_id, random_seed, substitutions, urls, bullets, created_at";

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn row_to_instance(row: &Row) -> rusqlite::Result<GeneratedInstance> {
    Ok(GeneratedInstance {
        id: row.get(0)?,
        task_name: row.get(1)?,
        user_id: row.get(2)?,
        random_seed: row.get(3)?,
        substitutions: json_column(row, 4)?,
        urls: json_column(row, 5)?,
        bullets: json_column(row, 6)?,
        created_at: row.get(7)?,
    })
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_sqlite_code(err: &rusqlite::Error, code: ErrorCode) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == code)
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: generated instances and flags
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: generated tasks");

        // NULL substitutions mark an instance whose generator is still running
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS generated_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                user_id INTEGER,
                random_seed TEXT NOT NULL,
                substitutions TEXT,
                urls TEXT,
                bullets TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(task_name, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_generated_tasks_seed ON generated_tasks(random_seed);
            CREATE INDEX IF NOT EXISTS idx_generated_tasks_pool ON generated_tasks(task_name, user_id);

            CREATE TABLE IF NOT EXISTS generated_flags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES generated_tasks(id) ON DELETE CASCADE,
                flag TEXT NOT NULL UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_generated_flags_task ON generated_flags(task_id);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    // ==================== Instance queries ====================

    pub fn find_instance(&self, task_name: &str, user_id: UserId) -> Result<Option<GeneratedInstance>> {
        let conn = self.conn.lock();
        let instance = conn
            .query_row(
                &format!(
                    "SELECT {} FROM generated_tasks WHERE task_name = ?1 AND user_id = ?2",
                    INSTANCE_COLUMNS
                ),
                params![task_name, user_id],
                row_to_instance,
            )
            .optional()?;
        Ok(instance)
    }

    pub fn find_instance_by_id(&self, id: i64) -> Result<Option<GeneratedInstance>> {
        let conn = self.conn.lock();
        let instance = conn
            .query_row(
                &format!("SELECT {} FROM generated_tasks WHERE id = ?1", INSTANCE_COLUMNS),
                params![id],
                row_to_instance,
            )
            .optional()?;
        Ok(instance)
    }

    /// Some pool seed holding `task_name`, skipping the seeds in `exclude`
    pub fn find_unclaimed_seed(&self, task_name: &str, exclude: &HashSet<String>) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT random_seed FROM generated_tasks
             WHERE task_name = ?1 AND user_id IS NULL
             ORDER BY id",
        )?;
        let seeds = stmt.query_map(params![task_name], |row| row.get::<_, String>(0))?;
        for seed in seeds {
            let seed = seed?;
            if !exclude.contains(&seed) {
                return Ok(Some(seed));
            }
        }
        Ok(None)
    }

    /// Move every pool row of `seed` for `tasks` to `user_id`, all or nothing.
    ///
    /// The write lock is taken up front without waiting; a busy database or
    /// fewer updated rows than tasks means another claimer is (or was) on the
    /// same seed.
    pub fn claim_seed(&self, seed: &str, tasks: &[String], user_id: UserId) -> Result<ClaimOutcome> {
        let mut conn = self.conn.lock();
        conn.busy_timeout(CLAIM_BUSY_TIMEOUT)?;
        let outcome = Self::claim_seed_locked(&mut conn, seed, tasks, user_id);
        conn.busy_timeout(BUSY_TIMEOUT)?;
        outcome
    }

    fn claim_seed_locked(
        conn: &mut Connection,
        seed: &str,
        tasks: &[String],
        user_id: UserId,
    ) -> Result<ClaimOutcome> {
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_sqlite_code(&e, ErrorCode::DatabaseBusy) => return Ok(ClaimOutcome::Contended),
            Err(e) => return Err(e.into()),
        };

        let sql = format!(
            "UPDATE generated_tasks SET user_id = ?1
             WHERE random_seed = ?2 AND user_id IS NULL AND task_name IN ({})",
            placeholders(3, tasks.len())
        );
        let mut values: Vec<&dyn ToSql> = vec![&user_id, &seed];
        values.extend(tasks.iter().map(|t| t as &dyn ToSql));

        let updated = match tx.execute(&sql, values.as_slice()) {
            Ok(updated) => updated,
            Err(e) if is_sqlite_code(&e, ErrorCode::DatabaseBusy) => return Ok(ClaimOutcome::Contended),
            Err(e) if is_sqlite_code(&e, ErrorCode::ConstraintViolation) => return Ok(ClaimOutcome::AlreadyOwned),
            Err(e) => return Err(e.into()),
        };
        if updated < tasks.len() {
            // Dropping the transaction rolls the partial update back
            return Ok(ClaimOutcome::Contended);
        }
        tx.commit()?;

        let sql = format!(
            "SELECT {} FROM generated_tasks WHERE random_seed = ?1 AND task_name IN ({}) ORDER BY task_name",
            INSTANCE_COLUMNS,
            placeholders(2, tasks.len())
        );
        let mut values: Vec<&dyn ToSql> = vec![&seed];
        values.extend(tasks.iter().map(|t| t as &dyn ToSql));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(values.as_slice(), row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if rows.len() < tasks.len() {
            return Ok(ClaimOutcome::Vanished);
        }
        Ok(ClaimOutcome::Claimed(rows))
    }

    /// Insert one empty row per task and commit at once, so racing readers see
    /// "in progress". Returns `None` if the user already has one of these tasks.
    pub fn create_empty_instances(
        &self,
        tasks: &[String],
        user_id: Option<UserId>,
        seed: &str,
    ) -> Result<Option<BTreeMap<String, i64>>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut ids = BTreeMap::new();
        for task in tasks {
            match tx.execute(
                "INSERT INTO generated_tasks (task_name, user_id, random_seed) VALUES (?1, ?2, ?3)",
                params![task, user_id, seed],
            ) {
                Ok(_) => {
                    ids.insert(task.clone(), tx.last_insert_rowid());
                }
                Err(e) if is_sqlite_code(&e, ErrorCode::ConstraintViolation) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit()?;
        Ok(Some(ids))
    }

    /// Store generator results for every instance in one transaction
    pub fn complete_instances(&self, results: &BTreeMap<i64, &GeneratorOutput>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for (id, output) in results {
            for flag in &output.flags {
                tx.execute(
                    "INSERT INTO generated_flags (task_id, flag) VALUES (?1, ?2)",
                    params![id, flag],
                )
                .with_context(|| format!("Failed to store flag for instance {}", id))?;
            }

            let updated = tx.execute(
                "UPDATE generated_tasks SET substitutions = ?1, urls = ?2, bullets = ?3 WHERE id = ?4",
                params![
                    serde_json::to_string(&output.substitutions)?,
                    serde_json::to_string(&output.urls)?,
                    serde_json::to_string(&output.bullets)?,
                    id
                ],
            )?;
            if updated == 0 {
                anyhow::bail!("Instance {} was deleted during generation", id);
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete instances (their flags cascade)
    pub fn delete_instances(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let sql = format!(
            "DELETE FROM generated_tasks WHERE id IN ({})",
            placeholders(1, ids.len())
        );
        let values: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
        Ok(conn.execute(&sql, values.as_slice())?)
    }

    /// Delete one instance and its flags, committing before returning
    pub fn delete_instance(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM generated_flags WHERE task_id = ?1", params![id])?;
        tx.execute("DELETE FROM generated_tasks WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Current owner of an instance; `None` for pool rows and missing rows
    pub fn owner_of(&self, id: i64) -> Result<Option<UserId>> {
        let conn = self.conn.lock();
        let owner = conn
            .query_row(
                "SELECT user_id FROM generated_tasks WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<UserId>>(0),
            )
            .optional()?;
        Ok(owner.flatten())
    }

    /// Finished instances of any of `tasks`
    pub fn finished_instances(&self, tasks: &[String]) -> Result<Vec<GeneratedInstance>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM generated_tasks
             WHERE substitutions IS NOT NULL AND task_name IN ({})
             ORDER BY id",
            INSTANCE_COLUMNS,
            placeholders(1, tasks.len())
        );
        let values: Vec<&dyn ToSql> = tasks.iter().map(|t| t as &dyn ToSql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let instances = stmt
            .query_map(values.as_slice(), row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(instances)
    }

    pub fn pregenerated_count(&self, task_name: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM generated_tasks WHERE task_name = ?1 AND user_id IS NULL",
            params![task_name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn instance_flags(&self, id: i64) -> Result<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT flag FROM generated_flags WHERE task_id = ?1")?;
        let flags = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(flags)
    }

    /// Every generated flag with the task it belongs to
    pub fn generated_flags(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT t.task_name, f.flag FROM generated_flags f
             JOIN generated_tasks t ON f.task_id = t.id
             ORDER BY t.task_name, f.flag",
        )?;
        let flags = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tasks: &[&str]) -> Vec<String> {
        tasks.iter().map(|t| t.to_string()).collect()
    }

    fn output(flags: &[&str]) -> GeneratorOutput {
        GeneratorOutput {
            flags: flags.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/ctfgate.db");

        Database::open(&path).unwrap();
        let db = Database::open(&path).unwrap();
        assert_eq!(db.pregenerated_count("any").unwrap(), 0);
    }

    #[test]
    fn test_empty_instance_is_in_progress_until_completed() {
        let db = Database::open_in_memory().unwrap();
        let ids = db
            .create_empty_instances(&names(&["pwn1"]), Some(1), "seed-1")
            .unwrap()
            .unwrap();
        let id = ids["pwn1"];

        let instance = db.find_instance("pwn1", 1).unwrap().unwrap();
        assert!(!instance.is_finished());
        assert_eq!(instance.random_seed, "seed-1");

        let mut out = output(&["flag{x}"]);
        out.substitutions.insert("port".to_string(), serde_json::json!(1234));
        db.complete_instances(&BTreeMap::from([(id, &out)])).unwrap();

        let instance = db.find_instance_by_id(id).unwrap().unwrap();
        assert!(instance.is_finished());
        assert_eq!(instance.substitutions.unwrap()["port"], 1234);
        assert_eq!(instance.urls, Some(Vec::new()));
        assert_eq!(
            db.instance_flags(id).unwrap(),
            BTreeSet::from(["flag{x}".to_string()])
        );
    }

    #[test]
    fn test_second_instance_for_same_user_is_refused() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .create_empty_instances(&names(&["pwn1"]), Some(1), "a")
            .unwrap()
            .is_some());
        assert!(db
            .create_empty_instances(&names(&["pwn1"]), Some(1), "b")
            .unwrap()
            .is_none());

        // Pool rows have no owner and may repeat
        db.create_empty_instances(&names(&["pwn1"]), None, "c").unwrap().unwrap();
        db.create_empty_instances(&names(&["pwn1"]), None, "d").unwrap().unwrap();
        assert_eq!(db.pregenerated_count("pwn1").unwrap(), 2);
    }

    #[test]
    fn test_claim_seed_outcomes() {
        let db = Database::open_in_memory().unwrap();
        db.create_empty_instances(&names(&["a", "b"]), None, "s1").unwrap().unwrap();

        // Asking for more tasks than the seed holds is contention, nothing changes
        assert_eq!(
            db.claim_seed("s1", &names(&["a", "b", "c"]), 7).unwrap(),
            ClaimOutcome::Contended
        );
        assert_eq!(db.pregenerated_count("a").unwrap(), 1);

        match db.claim_seed("s1", &names(&["a", "b"]), 7).unwrap() {
            ClaimOutcome::Claimed(rows) => {
                assert_eq!(rows.len(), 2);
                assert!(rows.iter().all(|r| r.user_id == Some(7)));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Already taken
        assert_eq!(
            db.claim_seed("s1", &names(&["a", "b"]), 8).unwrap(),
            ClaimOutcome::Contended
        );
        assert_eq!(db.find_unclaimed_seed("a", &HashSet::new()).unwrap(), None);
    }

    #[test]
    fn test_claim_by_existing_owner_changes_nothing() {
        let db = Database::open_in_memory().unwrap();
        db.create_empty_instances(&names(&["a"]), Some(7), "mine").unwrap().unwrap();
        db.create_empty_instances(&names(&["a"]), None, "pool").unwrap().unwrap();

        assert_eq!(
            db.claim_seed("pool", &names(&["a"]), 7).unwrap(),
            ClaimOutcome::AlreadyOwned
        );
        assert_eq!(db.pregenerated_count("a").unwrap(), 1);
        assert_eq!(db.find_instance("a", 7).unwrap().unwrap().random_seed, "mine");
    }

    #[test]
    fn test_claim_skips_locked_database_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let db = Database::open(&path).unwrap();
        db.create_empty_instances(&names(&["a"]), None, "s1").unwrap().unwrap();

        // Another process holds the write lock
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = std::time::Instant::now();
        assert_eq!(
            db.claim_seed("s1", &names(&["a"]), 1).unwrap(),
            ClaimOutcome::Contended
        );
        assert!(started.elapsed() < Duration::from_secs(1));

        other.execute_batch("ROLLBACK").unwrap();
        assert!(matches!(
            db.claim_seed("s1", &names(&["a"]), 1).unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[test]
    fn test_find_unclaimed_seed_skips_excluded() {
        let db = Database::open_in_memory().unwrap();
        db.create_empty_instances(&names(&["a"]), None, "s1").unwrap().unwrap();
        db.create_empty_instances(&names(&["a"]), None, "s2").unwrap().unwrap();

        assert_eq!(
            db.find_unclaimed_seed("a", &HashSet::new()).unwrap().as_deref(),
            Some("s1")
        );
        let exclude = HashSet::from(["s1".to_string()]);
        assert_eq!(db.find_unclaimed_seed("a", &exclude).unwrap().as_deref(), Some("s2"));
    }

    #[test]
    fn test_delete_cascades_to_flags() {
        let db = Database::open_in_memory().unwrap();
        let ids = db
            .create_empty_instances(&names(&["a", "b"]), Some(1), "s")
            .unwrap()
            .unwrap();
        let (out_a, out_b) = (output(&["flag{a}"]), output(&["flag{b}"]));
        db.complete_instances(&BTreeMap::from([(ids["a"], &out_a), (ids["b"], &out_b)]))
            .unwrap();
        assert_eq!(db.generated_flags().unwrap().len(), 2);

        let all: Vec<i64> = ids.values().copied().collect();
        assert_eq!(db.delete_instances(&all).unwrap(), 2);
        assert!(db.generated_flags().unwrap().is_empty());
        assert!(db.find_instance("a", 1).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_generated_flag_rolls_back_whole_batch() {
        let db = Database::open_in_memory().unwrap();
        let first = db.create_empty_instances(&names(&["a"]), Some(1), "s1").unwrap().unwrap();
        let out = output(&["flag{same}"]);
        db.complete_instances(&BTreeMap::from([(first["a"], &out)])).unwrap();

        let second = db
            .create_empty_instances(&names(&["a", "b"]), Some(2), "s2")
            .unwrap()
            .unwrap();
        let out_b = output(&["flag{b}"]);
        let result = db.complete_instances(&BTreeMap::from([(second["a"], &out), (second["b"], &out_b)]));
        assert!(result.is_err());

        assert!(!db.find_instance("b", 2).unwrap().unwrap().is_finished());
        assert!(db.instance_flags(second["b"]).unwrap().is_empty());
    }

    #[test]
    fn test_finished_instances_and_owner() {
        let db = Database::open_in_memory().unwrap();
        let pool = db.create_empty_instances(&names(&["a"]), None, "p").unwrap().unwrap();
        let mine = db.create_empty_instances(&names(&["a"]), Some(3), "m").unwrap().unwrap();
        let out = output(&["flag{m}"]);
        db.complete_instances(&BTreeMap::from([(mine["a"], &out)])).unwrap();

        let finished = db.finished_instances(&names(&["a", "b"])).unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].user_id, Some(3));

        assert_eq!(db.owner_of(pool["a"]).unwrap(), None);
        assert_eq!(db.owner_of(mine["a"]).unwrap(), Some(3));

        db.delete_instance(mine["a"]).unwrap();
        assert!(db.finished_instances(&names(&["a"])).unwrap().is_empty());
    }
}
