//! Shared vocabulary for the task-splitter engine and its clients.
//!
//! This crate defines the run handle and status types the engine exposes to
//! pollers, the persisted task/run/user models, the error taxonomy, and the
//! `Decomposer` contract the engine consumes. The application crate
//! (`task-splitter`) depends on this; a client only ever needs these types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Re-export async trait for implementors of `Decomposer`
pub use async_trait::async_trait;

/// Name of the built-in split-task pipeline definition.
pub const SPLIT_TASK_DEFINITION: &str = "split-task";

// ============================================================================
// Errors
// ============================================================================

/// Error taxonomy for engine operations.
///
/// `Store` is the only retryable class; the engine re-schedules the failing
/// step with backoff. `Service` is terminal for the run (decomposition calls
/// are not hammered on failure). `Validation` is rejected synchronously at
/// `start`, before any run record exists.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// `start` was called with invalid arguments; no run was created.
    #[error("validation error: {0}")]
    Validation(String),

    /// The decomposition service call failed. Terminal for the run.
    #[error("decomposition service error: {0}")]
    Service(String),

    /// The task store rejected an operation. Transient; retried with backoff.
    #[error("task store error: {0}")]
    Store(String),

    /// A status lookup used a handle the engine does not recognize.
    #[error("unknown run: {0}")]
    UnknownRun(Uuid),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// Handles and status
// ============================================================================

/// Opaque handle returned by `start`, used only for status lookups.
///
/// Callers hold the handle and poll; they can never mutate the run through
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHandle {
    pub id: Uuid,
    pub definition: String,
}

impl RunHandle {
    pub fn new(id: Uuid, definition: String) -> Self {
        Self { id, definition }
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }
}

/// Persisted state-machine status of a run.
///
/// `Completed` and `Failed` are terminal; the engine never moves a run out
/// of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "in_progress" => Some(RunStatus::InProgress),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Status as reported to pollers.
///
/// A `Pending` run reports as `inProgress`: the caller-visible contract has
/// exactly three shapes, and progress is monotonic — once a poller has seen
/// a terminal report it will never see `inProgress` again for that handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusReport {
    InProgress,
    Completed,
    Failed { error: String },
}

impl StatusReport {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusReport::InProgress)
    }
}

// ============================================================================
// Ownership and arguments
// ============================================================================

/// Attribution for a task row or a run.
///
/// The token is an opaque identifier supplied by the caller's identity layer;
/// this crate never interprets it. Guest tokens are device-local identities
/// that can later be claimed by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOwner {
    Guest { token: String },
    Account { token: String },
}

impl TaskOwner {
    pub fn token(&self) -> &str {
        match self {
            TaskOwner::Guest { token } | TaskOwner::Account { token } => token,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, TaskOwner::Guest { .. })
    }
}

/// Arguments captured when a split run starts.
///
/// `owner` is the attribution every task created by the run will carry; a
/// run started with `None` creates unowned rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitArgs {
    pub text: String,
    pub owner: Option<TaskOwner>,
}

impl SplitArgs {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            owner: None,
        }
    }

    pub fn owned_by(mut self, owner: TaskOwner) -> Self {
        self.owner = Some(owner);
        self
    }
}

// ============================================================================
// Models
// ============================================================================

/// A task row.
///
/// `owner_token` is `None` only for unowned rows; `is_guest = true` means
/// `owner_token` holds a guest identifier, not an account identifier.
/// Workflow-created tasks additionally record the run and step that produced
/// them, which doubles as the dedupe key for step replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub text: String,
    pub is_completed: bool,
    pub owner_token: Option<String>,
    pub is_guest: bool,
    pub run_id: Option<Uuid>,
    pub step_index: Option<u32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Persisted state-machine record for one durable execution.
///
/// Owned exclusively by the engine; callers only ever hold the id. `steps`
/// is `None` until the decomposition call has succeeded, after which it is
/// the immutable work queue for the rest of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition: String,
    pub args_text: String,
    pub owner: Option<TaskOwner>,
    pub status: RunStatus,
    pub steps: Option<Vec<String>>,
    pub step_cursor: u32,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WorkflowRun {
    /// Status as a poller sees it.
    pub fn report(&self) -> StatusReport {
        match self.status {
            RunStatus::Pending | RunStatus::InProgress => StatusReport::InProgress,
            RunStatus::Completed => StatusReport::Completed,
            RunStatus::Failed => StatusReport::Failed {
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "run failed".to_string()),
            },
        }
    }
}

/// A user profile row. `avatar_blob` is an opaque storage reference; this
/// system never touches the bytes behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub token_identifier: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub avatar_blob: Option<String>,
    pub onboarded: bool,
}

// ============================================================================
// Pagination
// ============================================================================

/// Pagination options for search queries. `cursor` is opaque to callers:
/// pass back the `next_cursor` from the previous page, or `None` for the
/// first page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginationOpts {
    pub cursor: Option<i64>,
    pub num_items: usize,
}

impl PaginationOpts {
    pub fn first(num_items: usize) -> Self {
        Self {
            cursor: None,
            num_items,
        }
    }

    pub fn after(cursor: i64, num_items: usize) -> Self {
        Self {
            cursor: Some(cursor),
            num_items,
        }
    }
}

/// One page of results. The cursor is stable across calls with the same
/// query as long as the underlying data only grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<i64>,
    pub is_done: bool,
}

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Text decomposition service consumed by the engine.
///
/// Given a task description, returns an ordered list of non-empty sub-step
/// strings. An empty list is valid (the run completes with no created
/// tasks). Implementations fail with `EngineError::Service`, which the
/// engine treats as terminal for the run.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, text: &str) -> EngineResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_serializes_with_type_tag() {
        let json = serde_json::to_string(&StatusReport::InProgress).unwrap();
        assert_eq!(json, r#"{"type":"inProgress"}"#);

        let json = serde_json::to_string(&StatusReport::Failed {
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"failed","error":"boom"}"#);
    }

    #[test]
    fn run_status_round_trips_through_store_form() {
        for status in [
            RunStatus::Pending,
            RunStatus::InProgress,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn pending_reports_as_in_progress() {
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            definition: SPLIT_TASK_DEFINITION.to_string(),
            args_text: "plan a trip".to_string(),
            owner: None,
            status: RunStatus::Pending,
            steps: None,
            step_cursor: 0,
            attempts: 0,
            error: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        assert_eq!(run.report(), StatusReport::InProgress);
    }

    #[test]
    fn failed_report_always_carries_a_message() {
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            definition: SPLIT_TASK_DEFINITION.to_string(),
            args_text: "x".to_string(),
            owner: None,
            status: RunStatus::Failed,
            steps: None,
            step_cursor: 0,
            attempts: 0,
            error: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        match run.report() {
            StatusReport::Failed { error } => assert!(!error.is_empty()),
            other => panic!("expected failed, got {:?}", other),
        }
    }

    #[test]
    fn guest_owner_is_guest() {
        let owner = TaskOwner::Guest {
            token: "guest:abc".to_string(),
        };
        assert!(owner.is_guest());
        assert_eq!(owner.token(), "guest:abc");

        let owner = TaskOwner::Account {
            token: "user:42".to_string(),
        };
        assert!(!owner.is_guest());
    }
}
