//! User-facing task operations: create, toggle, search, guest transfer,
//! and starting a split run.

use anyhow::{anyhow, Result};
use task_splitter_sdk::{
    EngineResult, Page, PaginationOpts, RunHandle, SplitArgs, Task, TaskOwner,
};

use crate::database::SharedDatabase;
use crate::engine::WorkflowEngine;

/// Closed set of search scopes. Each variant carries exactly the
/// parameters it needs, so there is no dynamically-typed filter surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskScope {
    /// No ownership filter.
    Any,
    /// Tasks owned by an account token.
    Mine { owner_token: String },
    /// Tasks still held by a guest token.
    Guest { guest_token: String },
}

/// Task service shared by the CLI and any embedding client.
pub struct TaskService {
    db: SharedDatabase,
    engine: WorkflowEngine,
}

impl TaskService {
    pub fn new(db: SharedDatabase, engine: WorkflowEngine) -> Self {
        Self { db, engine }
    }

    /// Create a task. New tasks always start incomplete.
    pub fn create(&self, text: &str, owner: Option<&TaskOwner>) -> Result<Task> {
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("task text must not be empty"));
        }
        let db = self.db.lock().unwrap();
        db.insert_task(text, owner)
    }

    /// Set a task's completion flag.
    pub fn toggle(&self, id: i64, is_completed: bool) -> Result<Task> {
        let db = self.db.lock().unwrap();
        if !db.toggle_task(id, is_completed)? {
            return Err(anyhow!("no task with id {}", id));
        }
        db.get_task(id)?
            .ok_or_else(|| anyhow!("no task with id {}", id))
    }

    /// Search within a scope. A blank query lists by recency.
    pub fn search(&self, query: &str, scope: &TaskScope, opts: &PaginationOpts) -> Result<Page<Task>> {
        let db = self.db.lock().unwrap();
        db.search_tasks(query, scope, opts)
    }

    /// Claim every guest-held task for an account. Returns the number of
    /// tasks transferred; calling again is harmless (nothing left to move).
    pub fn transfer_guest_tasks(&self, guest_token: &str, account_token: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        db.transfer_guest_tasks(guest_token, account_token)
    }

    /// Start a split run for a task description. Fire-and-forget: the
    /// returned handle is only good for status polling.
    pub fn split(&self, text: &str, owner: Option<TaskOwner>) -> EngineResult<RunHandle> {
        let mut args = SplitArgs::new(text);
        if let Some(owner) = owner {
            args = args.owned_by(owner);
        }
        self.engine.start(args)
    }
}
