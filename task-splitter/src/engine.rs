//! Durable workflow engine for the split-task pipeline.
//!
//! A run is a persisted state-machine record: call the decomposition
//! service once, then apply one task-creation mutation per returned
//! sub-step, in order. Every `advance` is a short unit of work spawned on
//! the runtime; progress is checkpointed to the store before the next unit,
//! so a crashed process loses nothing and any instance can resume via
//! [`WorkflowEngine::recover`].
//!
//! Invariants:
//! - one writer per run at a time (in-flight claim set); different runs
//!   advance independently
//! - the step cursor only moves forward, and only in the same transaction
//!   as the step's insert
//! - terminal states are final; re-advancing a terminal run is a no-op

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;
use uuid::Uuid;

use task_splitter_sdk::{
    Decomposer, EngineError, EngineResult, RunHandle, RunStatus, SplitArgs, StatusReport,
    WorkflowRun, SPLIT_TASK_DEFINITION,
};

use crate::database::SharedDatabase;

/// Bounded backoff for transient store failures.
///
/// Service (decomposition) failures are never retried; this policy only
/// governs step mutations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: base * 2^(attempts-1), capped.
    fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The workflow engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    db: SharedDatabase,
    decomposer: Arc<dyn Decomposer>,
    /// Runs currently being advanced by this process.
    inflight: Mutex<HashSet<Uuid>>,
    retry: RetryPolicy,
}

impl WorkflowEngine {
    pub fn new(db: SharedDatabase, decomposer: Arc<dyn Decomposer>) -> Self {
        Self::with_retry_policy(db, decomposer, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        db: SharedDatabase,
        decomposer: Arc<dyn Decomposer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                db,
                decomposer,
                inflight: Mutex::new(HashSet::new()),
                retry,
            }),
        }
    }

    /// Start a split run. Validates the text, persists a pending run, and
    /// schedules the first advance; returns the handle immediately without
    /// waiting on the decomposition call.
    pub fn start(&self, args: SplitArgs) -> EngineResult<RunHandle> {
        let text = args.text.trim();
        if text.is_empty() {
            return Err(EngineError::Validation(
                "task text must be a non-empty string".to_string(),
            ));
        }

        let run = WorkflowRun {
            id: Uuid::new_v4(),
            definition: SPLIT_TASK_DEFINITION.to_string(),
            args_text: text.to_string(),
            owner: args.owner,
            status: RunStatus::Pending,
            steps: None,
            step_cursor: 0,
            attempts: 0,
            error: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };

        {
            let db = self.inner.db.lock().unwrap();
            db.insert_run(&run).map_err(store_err)?;
        }

        tracing::info!(run_id = %run.id, "split run enqueued");
        self.schedule(run.id, Duration::ZERO);
        Ok(RunHandle::new(run.id, SPLIT_TASK_DEFINITION.to_string()))
    }

    /// Current status for a handle. A pure point read; never mutates, safe
    /// to call concurrently, and reflects only whole-step progress.
    pub fn status(&self, handle: &RunHandle) -> EngineResult<StatusReport> {
        let db = self.inner.db.lock().unwrap();
        let run = db
            .get_run(&handle.id)
            .map_err(store_err)?
            .ok_or(EngineError::UnknownRun(handle.id))?;
        Ok(run.report())
    }

    /// Schedule an advance for every non-terminal run in the store.
    /// Called at startup so this instance picks up runs a crashed process
    /// left behind. Returns how many runs were re-enqueued.
    pub fn recover(&self) -> EngineResult<usize> {
        let ids = {
            let db = self.inner.db.lock().unwrap();
            db.load_resumable_runs().map_err(store_err)?
        };
        for id in &ids {
            tracing::info!(run_id = %id, "resuming run");
            self.schedule(*id, Duration::ZERO);
        }
        Ok(ids.len())
    }

    /// Queue one advance unit on the runtime.
    fn schedule(&self, run_id: Uuid, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                sleep(delay).await;
            }
            engine.advance(run_id).await;
        });
    }

    /// One scheduled unit of work for a run. Claims the run first; if
    /// another advance is already executing it, this one backs off and the
    /// holder finishes the work.
    async fn advance(&self, run_id: Uuid) {
        let _claim = match Claim::acquire(&self.inner.inflight, run_id) {
            Some(claim) => claim,
            None => return,
        };

        if let Err(e) = self.advance_inner(run_id).await {
            // Only store read/write failures outside the step loop land
            // here; the run will be picked up again by a later recover.
            tracing::error!(run_id = %run_id, error = %e, "advance aborted");
        }
    }

    async fn advance_inner(&self, run_id: Uuid) -> EngineResult<()> {
        let run = {
            let db = self.inner.db.lock().unwrap();
            db.get_run(&run_id).map_err(store_err)?
        };
        let run = match run {
            Some(run) => run,
            None => {
                tracing::warn!(run_id = %run_id, "scheduled run not found");
                return Ok(());
            }
        };

        // Terminal runs are never re-executed
        if run.status.is_terminal() {
            return Ok(());
        }

        let steps = match run.steps.clone() {
            Some(steps) => steps,
            None => {
                // Pending: the one action call. No lock is held across the
                // await. If the process dies between the call and the
                // checkpoint below, resume repeats the call (the action is
                // best-effort-once); once the list is recorded it is never
                // requested again.
                match self.inner.decomposer.decompose(&run.args_text).await {
                    Ok(steps) => {
                        let db = self.inner.db.lock().unwrap();
                        db.set_run_steps(&run_id, &steps).map_err(store_err)?;
                        tracing::info!(run_id = %run_id, steps = steps.len(), "decomposition recorded");
                        steps
                    }
                    Err(e) => {
                        // Fail fast: decomposition calls are not retried
                        let db = self.inner.db.lock().unwrap();
                        db.mark_run_failed(&run_id, &e.to_string())
                            .map_err(store_err)?;
                        tracing::warn!(run_id = %run_id, error = %e, "run failed at decomposition");
                        return Ok(());
                    }
                }
            }
        };

        let mut cursor = run.step_cursor;
        while (cursor as usize) < steps.len() {
            let step_text = &steps[cursor as usize];
            let applied = {
                let mut db = self.inner.db.lock().unwrap();
                db.apply_step(&run_id, cursor, step_text, run.owner.as_ref())
            };

            match applied {
                Ok(()) => cursor += 1,
                Err(e) => {
                    let attempts = {
                        let db = self.inner.db.lock().unwrap();
                        db.bump_run_attempts(&run_id).map_err(store_err)?
                    };
                    if attempts >= self.inner.retry.max_attempts {
                        let db = self.inner.db.lock().unwrap();
                        db.mark_run_failed(
                            &run_id,
                            &format!("store retries exhausted at step {}: {}", cursor, e),
                        )
                        .map_err(store_err)?;
                        tracing::warn!(run_id = %run_id, step = cursor, "run failed: store retries exhausted");
                    } else {
                        let delay = self.inner.retry.delay_for(attempts);
                        tracing::warn!(
                            run_id = %run_id,
                            step = cursor,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            "step mutation failed; retrying"
                        );
                        self.schedule(run_id, delay);
                    }
                    return Ok(());
                }
            }
        }

        let db = self.inner.db.lock().unwrap();
        db.mark_run_completed(&run_id).map_err(store_err)?;
        tracing::info!(run_id = %run_id, tasks = steps.len(), "run completed");
        Ok(())
    }
}

fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::Store(e.to_string())
}

/// Single-writer-per-run claim; released on drop.
struct Claim<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> Claim<'a> {
    fn acquire(set: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Option<Self> {
        if set.lock().unwrap().insert(id) {
            Some(Self { set, id })
        } else {
            None
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for(4), Duration::from_millis(500));
        assert_eq!(retry.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let set = Mutex::new(HashSet::new());
        let id = Uuid::new_v4();

        let first = Claim::acquire(&set, id);
        assert!(first.is_some());
        assert!(Claim::acquire(&set, id).is_none());

        drop(first);
        assert!(Claim::acquire(&set, id).is_some());
    }
}
