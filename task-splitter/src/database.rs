//! SQLite persistence for tasks, workflow runs, and user profiles.
//!
//! This module is the durable backing for everything in the system: the task
//! table the UI reads, the run table the workflow engine owns, and the user
//! profile table. Data survives process restarts, which is what lets any
//! engine instance resume another's runs.
//!
//! # Schema
//!
//! 1. **tasks** - task rows; workflow-created rows also record the
//!    `(run_id, step_index)` that produced them, enforced unique so a
//!    replayed step can never insert a duplicate
//! 2. **tasks_fts** - FTS5 index over task text, kept in sync by triggers
//! 3. **runs** - one row per durable execution; the engine is the only
//!    writer
//! 4. **users** - profile rows keyed by the caller's identity token
//!
//! WAL mode is enabled for concurrent readers, matching how the status
//! poller reads while the engine writes.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use task_splitter_sdk::{Page, PaginationOpts, RunStatus, Task, TaskOwner, UserProfile, WorkflowRun};

use crate::tasks::TaskScope;
use crate::users::ProfileUpdate;

/// Shared handle used by the engine and services. rusqlite connections are
/// not `Sync`, so all access funnels through one mutex; no holder keeps the
/// lock across an await point.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database wrapper for task and run persistence.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers while the engine writes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Wrap into the shared handle the engine and services expect.
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Initialize the schema with all tables, indexes, and FTS triggers.
    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,

                text TEXT NOT NULL,
                is_completed INTEGER NOT NULL DEFAULT 0,

                -- Attribution; NULL owner_token means an unowned row
                owner_token TEXT,
                is_guest INTEGER NOT NULL DEFAULT 0,

                -- Provenance for workflow-created rows; doubles as the
                -- step dedupe key
                run_id TEXT,
                step_index INTEGER,

                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_token);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_run_step
                ON tasks(run_id, step_index) WHERE run_id IS NOT NULL;
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS tasks_fts USING fts5(
                text,
                content='tasks',
                content_rowid='id'
            );

            CREATE TRIGGER IF NOT EXISTS tasks_fts_insert AFTER INSERT ON tasks BEGIN
                INSERT INTO tasks_fts(rowid, text) VALUES (new.id, new.text);
            END;
            CREATE TRIGGER IF NOT EXISTS tasks_fts_delete AFTER DELETE ON tasks BEGIN
                INSERT INTO tasks_fts(tasks_fts, rowid, text) VALUES ('delete', old.id, old.text);
            END;
            CREATE TRIGGER IF NOT EXISTS tasks_fts_update AFTER UPDATE OF text ON tasks BEGIN
                INSERT INTO tasks_fts(tasks_fts, rowid, text) VALUES ('delete', old.id, old.text);
                INSERT INTO tasks_fts(rowid, text) VALUES (new.id, new.text);
            END;
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,

                definition TEXT NOT NULL,
                args_text TEXT NOT NULL,
                owner_token TEXT,
                owner_is_guest INTEGER NOT NULL DEFAULT 0,

                -- State machine
                status TEXT NOT NULL,
                steps TEXT,
                step_cursor INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            "#,
        )?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                token_identifier TEXT NOT NULL UNIQUE,
                first_name TEXT,
                last_name TEXT,
                location TEXT,
                bio TEXT,
                avatar_blob TEXT,
                onboarded INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Insert a user-created task. Always starts incomplete.
    pub fn insert_task(&self, text: &str, owner: Option<&TaskOwner>) -> Result<Task> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO tasks (text, is_completed, owner_token, is_guest, created_at)
             VALUES (?1, 0, ?2, ?3, ?4)",
            params![
                text,
                owner.map(|o| o.token()),
                owner.map(|o| o.is_guest()).unwrap_or(false),
                now.to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?
            .ok_or_else(|| anyhow!("task {} vanished after insert", id))
    }

    /// Fetch a task by id.
    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let task = self
            .conn
            .query_row(
                "SELECT id, text, is_completed, owner_token, is_guest, run_id, step_index, created_at
                 FROM tasks WHERE id = ?1",
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Set a task's completion flag. Returns false if no such task exists.
    pub fn toggle_task(&self, id: i64, is_completed: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE tasks SET is_completed = ?2 WHERE id = ?1",
            params![id, is_completed],
        )?;
        Ok(changed > 0)
    }

    /// Search tasks with keyset pagination.
    ///
    /// A blank query lists by recency; otherwise the query is matched
    /// against the FTS index. Ordering is newest-first in both cases, which
    /// keeps the cursor stable while rows are only appended.
    pub fn search_tasks(
        &self,
        query: &str,
        scope: &TaskScope,
        opts: &PaginationOpts,
    ) -> Result<Page<Task>> {
        let num_items = opts.num_items.clamp(1, 100);

        let mut sql = String::from(
            "SELECT t.id, t.text, t.is_completed, t.owner_token, t.is_guest,
                    t.run_id, t.step_index, t.created_at
             FROM tasks t WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let trimmed = query.trim();
        if !trimmed.is_empty() {
            sql.push_str(" AND t.id IN (SELECT rowid FROM tasks_fts WHERE tasks_fts MATCH ?)");
            args.push(Box::new(fts_match_expr(trimmed)));
        }

        match scope {
            TaskScope::Any => {}
            TaskScope::Mine { owner_token } => {
                sql.push_str(" AND t.owner_token = ? AND t.is_guest = 0");
                args.push(Box::new(owner_token.clone()));
            }
            TaskScope::Guest { guest_token } => {
                sql.push_str(" AND t.owner_token = ? AND t.is_guest = 1");
                args.push(Box::new(guest_token.clone()));
            }
        }

        if let Some(cursor) = opts.cursor {
            sql.push_str(" AND t.id < ?");
            args.push(Box::new(cursor));
        }

        // One extra row tells us whether another page exists
        sql.push_str(" ORDER BY t.id DESC LIMIT ?");
        args.push(Box::new((num_items + 1) as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(&arg_refs[..], task_from_row)?;
        let mut items: Vec<Task> = rows.collect::<rusqlite::Result<_>>()?;

        let is_done = items.len() <= num_items;
        items.truncate(num_items);
        let next_cursor = if is_done {
            None
        } else {
            items.last().map(|t| t.id)
        };

        Ok(Page {
            items,
            next_cursor,
            is_done,
        })
    }

    /// Tasks created by a given run, in step order.
    pub fn tasks_for_run(&self, run_id: &Uuid) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, text, is_completed, owner_token, is_guest, run_id, step_index, created_at
             FROM tasks WHERE run_id = ?1 ORDER BY step_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Reassign every task owned by a guest token to an account token.
    /// Returns the number of rows transferred.
    pub fn transfer_guest_tasks(&self, guest_token: &str, account_token: &str) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE tasks SET owner_token = ?2, is_guest = 0
             WHERE owner_token = ?1 AND is_guest = 1",
            params![guest_token, account_token],
        )?;
        Ok(changed)
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Insert a freshly started run record.
    pub fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        self.conn.execute(
            "INSERT INTO runs (id, definition, args_text, owner_token, owner_is_guest,
                               status, steps, step_cursor, attempts, error,
                               created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.id.to_string(),
                run.definition,
                run.args_text,
                run.owner.as_ref().map(|o| o.token()),
                run.owner.as_ref().map(|o| o.is_guest()).unwrap_or(false),
                run.status.as_str(),
                run.steps
                    .as_ref()
                    .map(|s| serde_json::to_string(s))
                    .transpose()?,
                run.step_cursor,
                run.attempts,
                run.error,
                run.created_at.to_rfc3339(),
                run.created_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch a run by id.
    pub fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, definition, args_text, owner_token, owner_is_guest,
                        status, steps, step_cursor, attempts, error,
                        created_at, completed_at
                 FROM runs WHERE id = ?1",
                params![id.to_string()],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Record the decomposition result and move the run to in-progress.
    /// Only applies while the run is still pending, so a replay is inert.
    pub fn set_run_steps(&self, id: &Uuid, steps: &[String]) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET steps = ?2, status = ?3, step_cursor = 0, attempts = 0,
                             updated_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                id.to_string(),
                serde_json::to_string(steps)?,
                RunStatus::InProgress.as_str(),
                Utc::now().to_rfc3339(),
                RunStatus::Pending.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Apply one step: insert the task row and advance the cursor in a
    /// single transaction. The INSERT OR IGNORE plus the `(run_id,
    /// step_index)` unique index make a replayed step a no-op, and the
    /// cursor only ever moves forward.
    pub fn apply_step(
        &mut self,
        run_id: &Uuid,
        step_index: u32,
        text: &str,
        owner: Option<&TaskOwner>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO tasks
                 (text, is_completed, owner_token, is_guest, run_id, step_index, created_at)
             VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6)",
            params![
                text,
                owner.map(|o| o.token()),
                owner.map(|o| o.is_guest()).unwrap_or(false),
                run_id.to_string(),
                step_index,
                now,
            ],
        )?;
        tx.execute(
            "UPDATE runs SET step_cursor = MAX(step_cursor, ?2), attempts = 0, updated_at = ?3
             WHERE id = ?1",
            params![run_id.to_string(), step_index + 1, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Bump the per-step retry counter; returns the new count.
    pub fn bump_run_attempts(&self, id: &Uuid) -> Result<u32> {
        self.conn.execute(
            "UPDATE runs SET attempts = attempts + 1, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        let attempts = self.conn.query_row(
            "SELECT attempts FROM runs WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Move a run to a terminal failed state. Already-terminal runs are
    /// left untouched, so status never regresses.
    pub fn mark_run_failed(&self, id: &Uuid, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE runs SET status = ?2, error = ?3, updated_at = ?4, completed_at = ?4
             WHERE id = ?1 AND status NOT IN (?5, ?6)",
            params![
                id.to_string(),
                RunStatus::Failed.as_str(),
                error,
                now,
                RunStatus::Completed.as_str(),
                RunStatus::Failed.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Move a run to the terminal completed state, with the same
    /// monotonicity guard as `mark_run_failed`.
    pub fn mark_run_completed(&self, id: &Uuid) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE runs SET status = ?2, updated_at = ?3, completed_at = ?3
             WHERE id = ?1 AND status NOT IN (?4, ?5)",
            params![
                id.to_string(),
                RunStatus::Completed.as_str(),
                now,
                RunStatus::Completed.as_str(),
                RunStatus::Failed.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Ids of all runs that still need an advance (pending or in-progress).
    pub fn load_resumable_runs(&self) -> Result<Vec<Uuid>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM runs WHERE status IN (?1, ?2) ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(
            params![
                RunStatus::Pending.as_str(),
                RunStatus::InProgress.as_str()
            ],
            |row| row.get::<_, String>(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            ids.push(Uuid::parse_str(&raw).map_err(|e| anyhow!("bad run id {}: {}", raw, e))?);
        }
        Ok(ids)
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Update-or-create a profile keyed by the identity token.
    pub fn upsert_profile(&self, token_identifier: &str, update: &ProfileUpdate) -> Result<UserProfile> {
        self.conn.execute(
            "INSERT INTO users (token_identifier, first_name, last_name, location, bio, avatar_blob, onboarded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
             ON CONFLICT(token_identifier) DO UPDATE SET
                 first_name = COALESCE(excluded.first_name, users.first_name),
                 last_name = COALESCE(excluded.last_name, users.last_name),
                 location = COALESCE(excluded.location, users.location),
                 bio = COALESCE(excluded.bio, users.bio),
                 avatar_blob = COALESCE(excluded.avatar_blob, users.avatar_blob)",
            params![
                token_identifier,
                update.first_name,
                update.last_name,
                update.location,
                update.bio,
                update.avatar_blob,
            ],
        )?;
        self.get_profile(token_identifier)?
            .ok_or_else(|| anyhow!("profile for {} vanished after upsert", token_identifier))
    }

    /// Fetch a profile by identity token.
    pub fn get_profile(&self, token_identifier: &str) -> Result<Option<UserProfile>> {
        let profile = self
            .conn
            .query_row(
                "SELECT id, token_identifier, first_name, last_name, location, bio, avatar_blob, onboarded
                 FROM users WHERE token_identifier = ?1",
                params![token_identifier],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    /// Mark a profile as onboarded. Returns false if no such profile.
    pub fn set_onboarded(&self, token_identifier: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET onboarded = 1 WHERE token_identifier = ?1",
            params![token_identifier],
        )?;
        Ok(changed > 0)
    }
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let run_id: Option<String> = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        text: row.get(1)?,
        is_completed: row.get(2)?,
        owner_token: row.get(3)?,
        is_guest: row.get(4)?,
        run_id: run_id.and_then(|s| Uuid::parse_str(&s).ok()),
        step_index: row.get(6)?,
        created_at: parse_timestamp(&created_at, 7)?,
    })
}

fn run_from_row(row: &Row) -> rusqlite::Result<WorkflowRun> {
    let id: String = row.get(0)?;
    let owner_token: Option<String> = row.get(3)?;
    let owner_is_guest: bool = row.get(4)?;
    let status: String = row.get(5)?;
    let steps: Option<String> = row.get(6)?;
    let created_at: String = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;

    let steps = steps
        .map(|raw| {
            serde_json::from_str::<Vec<String>>(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
            })
        })
        .transpose()?;

    Ok(WorkflowRun {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        definition: row.get(1)?,
        args_text: row.get(2)?,
        owner: owner_token.map(|token| {
            if owner_is_guest {
                TaskOwner::Guest { token }
            } else {
                TaskOwner::Account { token }
            }
        }),
        status: RunStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown run status: {}", status).into(),
            )
        })?,
        steps,
        step_cursor: row.get(7)?,
        attempts: row.get(8)?,
        error: row.get(9)?,
        created_at: parse_timestamp(&created_at, 10)?,
        completed_at: completed_at
            .map(|raw| parse_timestamp(&raw, 11))
            .transpose()?,
    })
}

fn profile_from_row(row: &Row) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        id: row.get(0)?,
        token_identifier: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        location: row.get(4)?,
        bio: row.get(5)?,
        avatar_blob: row.get(6)?,
        onboarded: row.get(7)?,
    })
}

fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Quote each whitespace-separated term so user input can never be parsed
/// as FTS5 query syntax. Terms are implicitly AND-ed.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use task_splitter_sdk::SPLIT_TASK_DEFINITION;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db
    }

    fn pending_run(text: &str, owner: Option<TaskOwner>) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::new_v4(),
            definition: SPLIT_TASK_DEFINITION.to_string(),
            args_text: text.to_string(),
            owner,
            status: RunStatus::Pending,
            steps: None,
            step_cursor: 0,
            attempts: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn insert_and_toggle_task() {
        let db = test_db();
        let task = db.insert_task("buy milk", None).unwrap();
        assert!(!task.is_completed);
        assert!(task.owner_token.is_none());

        assert!(db.toggle_task(task.id, true).unwrap());
        let task = db.get_task(task.id).unwrap().unwrap();
        assert!(task.is_completed);

        assert!(!db.toggle_task(9999, true).unwrap());
    }

    #[test]
    fn search_blank_query_lists_recent_first() {
        let db = test_db();
        for i in 0..5 {
            db.insert_task(&format!("task {}", i), None).unwrap();
        }
        let page = db
            .search_tasks("", &TaskScope::Any, &PaginationOpts::first(3))
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.items[0].text, "task 4");
        assert!(!page.is_done);

        let next = db
            .search_tasks(
                "",
                &TaskScope::Any,
                &PaginationOpts::after(page.next_cursor.unwrap(), 3),
            )
            .unwrap();
        assert_eq!(next.items.len(), 2);
        assert!(next.is_done);
        assert_eq!(next.items[1].text, "task 0");
    }

    #[test]
    fn search_matches_full_text() {
        let db = test_db();
        db.insert_task("buy milk at the store", None).unwrap();
        db.insert_task("call the plumber", None).unwrap();
        db.insert_task("buy stamps", None).unwrap();

        let page = db
            .search_tasks("buy", &TaskScope::Any, &PaginationOpts::first(10))
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|t| t.text.contains("buy")));
    }

    #[test]
    fn search_tolerates_fts_syntax_in_query() {
        let db = test_db();
        db.insert_task("quoted \"thing\"", None).unwrap();
        // Must not error even though the input contains FTS metacharacters
        let page = db
            .search_tasks("\"thing\" AND OR *", &TaskScope::Any, &PaginationOpts::first(10))
            .unwrap();
        assert!(page.is_done);
    }

    #[test]
    fn search_scopes_are_disjoint() {
        let db = test_db();
        let guest = TaskOwner::Guest {
            token: "guest:1".to_string(),
        };
        let account = TaskOwner::Account {
            token: "user:1".to_string(),
        };
        db.insert_task("guest task", Some(&guest)).unwrap();
        db.insert_task("account task", Some(&account)).unwrap();
        db.insert_task("unowned task", None).unwrap();

        let mine = db
            .search_tasks(
                "",
                &TaskScope::Mine {
                    owner_token: "user:1".to_string(),
                },
                &PaginationOpts::first(10),
            )
            .unwrap();
        assert_eq!(mine.items.len(), 1);
        assert_eq!(mine.items[0].text, "account task");

        let guest_page = db
            .search_tasks(
                "",
                &TaskScope::Guest {
                    guest_token: "guest:1".to_string(),
                },
                &PaginationOpts::first(10),
            )
            .unwrap();
        assert_eq!(guest_page.items.len(), 1);
        assert!(guest_page.items[0].is_guest);
    }

    #[test]
    fn transfer_rewrites_guest_rows_only() {
        let db = test_db();
        let guest = TaskOwner::Guest {
            token: "guest:1".to_string(),
        };
        db.insert_task("a", Some(&guest)).unwrap();
        db.insert_task("b", Some(&guest)).unwrap();
        db.insert_task("c", None).unwrap();

        let moved = db.transfer_guest_tasks("guest:1", "user:9").unwrap();
        assert_eq!(moved, 2);

        let mine = db
            .search_tasks(
                "",
                &TaskScope::Mine {
                    owner_token: "user:9".to_string(),
                },
                &PaginationOpts::first(10),
            )
            .unwrap();
        assert_eq!(mine.items.len(), 2);
        assert!(mine.items.iter().all(|t| !t.is_guest));

        // Second transfer finds nothing left
        assert_eq!(db.transfer_guest_tasks("guest:1", "user:9").unwrap(), 0);
    }

    #[test]
    fn run_round_trips_through_store() {
        let db = test_db();
        let run = pending_run(
            "plan a party",
            Some(TaskOwner::Account {
                token: "user:1".to_string(),
            }),
        );
        db.insert_run(&run).unwrap();

        let loaded = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.args_text, "plan a party");
        assert_eq!(
            loaded.owner,
            Some(TaskOwner::Account {
                token: "user:1".to_string()
            })
        );
        assert!(loaded.steps.is_none());
    }

    #[test]
    fn apply_step_is_idempotent_and_advances_cursor() {
        let mut db = test_db();
        let run = pending_run("x", None);
        db.insert_run(&run).unwrap();
        db.set_run_steps(&run.id, &["a".to_string(), "b".to_string()])
            .unwrap();

        db.apply_step(&run.id, 0, "a", None).unwrap();
        // Replay of the same step must not duplicate the row or rewind
        db.apply_step(&run.id, 0, "a", None).unwrap();
        db.apply_step(&run.id, 1, "b", None).unwrap();

        let tasks = db.tasks_for_run(&run.id).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].text, "a");
        assert_eq!(tasks[1].text, "b");

        let loaded = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.step_cursor, 2);
    }

    #[test]
    fn terminal_status_never_regresses() {
        let db = test_db();
        let run = pending_run("x", None);
        db.insert_run(&run).unwrap();

        db.mark_run_completed(&run.id).unwrap();
        db.mark_run_failed(&run.id, "late failure").unwrap();

        let loaded = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.error.is_none());
    }

    #[test]
    fn resumable_runs_excludes_terminal() {
        let db = test_db();
        let a = pending_run("a", None);
        let b = pending_run("b", None);
        let c = pending_run("c", None);
        for run in [&a, &b, &c] {
            db.insert_run(run).unwrap();
        }
        db.mark_run_completed(&b.id).unwrap();
        db.mark_run_failed(&c.id, "boom").unwrap();

        let ids = db.load_resumable_runs().unwrap();
        assert_eq!(ids, vec![a.id]);
    }

    #[test]
    fn profile_upsert_merges_fields() {
        let db = test_db();
        let first = ProfileUpdate {
            first_name: Some("Ada".to_string()),
            ..Default::default()
        };
        db.upsert_profile("tok:1", &first).unwrap();

        let second = ProfileUpdate {
            bio: Some("builder".to_string()),
            ..Default::default()
        };
        let profile = db.upsert_profile("tok:1", &second).unwrap();
        assert_eq!(profile.first_name.as_deref(), Some("Ada"));
        assert_eq!(profile.bio.as_deref(), Some("builder"));
        assert!(!profile.onboarded);

        assert!(db.set_onboarded("tok:1").unwrap());
        let profile = db.get_profile("tok:1").unwrap().unwrap();
        assert!(profile.onboarded);
    }
}
