//! Optimistic local-override cache for task views.
//!
//! A client applies a mutation locally the moment the user acts, tags it
//! pending, and reconciles when the authoritative row arrives: a row that
//! confirms the override clears the pending tag, a row that contradicts it
//! rolls the override back. Pure in-memory bookkeeping; no I/O.

use std::collections::HashMap;

use task_splitter_sdk::Task;

/// A locally applied, not-yet-confirmed mutation.
#[derive(Debug, Clone, PartialEq)]
enum PendingOp {
    Toggle { is_completed: bool },
}

/// Local view of tasks with optimistic overrides layered on top of the
/// last authoritative snapshot.
#[derive(Default)]
pub struct TaskCache {
    authoritative: HashMap<i64, Task>,
    pending: HashMap<i64, PendingOp>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the authoritative snapshot for these rows. Pending
    /// overrides survive until `reconcile` resolves them.
    pub fn ingest(&mut self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.authoritative.insert(task.id, task);
        }
    }

    /// Apply a toggle locally, before the server confirms. Returns false
    /// if the task is not in the cache.
    pub fn toggle_optimistic(&mut self, id: i64, is_completed: bool) -> bool {
        if !self.authoritative.contains_key(&id) {
            return false;
        }
        self.pending.insert(id, PendingOp::Toggle { is_completed });
        true
    }

    /// Reconcile one authoritative update. The override is retired either
    /// way: if the server confirmed it the view is unchanged, and if the
    /// server disagreed the row rolls back to what the server said.
    pub fn reconcile(&mut self, task: Task) {
        self.pending.remove(&task.id);
        self.authoritative.insert(task.id, task);
    }

    /// Whether a task has an unconfirmed local mutation.
    pub fn is_pending(&self, id: i64) -> bool {
        self.pending.contains_key(&id)
    }

    /// A task as the user should see it: authoritative state with any
    /// pending override applied.
    pub fn get(&self, id: i64) -> Option<Task> {
        let mut task = self.authoritative.get(&id)?.clone();
        if let Some(PendingOp::Toggle { is_completed }) = self.pending.get(&id) {
            task.is_completed = *is_completed;
        }
        Some(task)
    }

    /// Merged view of all cached tasks, newest first.
    pub fn snapshot(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .authoritative
            .keys()
            .filter_map(|id| self.get(*id))
            .collect();
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: i64, text: &str, is_completed: bool) -> Task {
        Task {
            id,
            text: text.to_string(),
            is_completed,
            owner_token: None,
            is_guest: false,
            run_id: None,
            step_index: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn optimistic_toggle_shows_immediately() {
        let mut cache = TaskCache::new();
        cache.ingest([task(1, "buy milk", false)]);

        assert!(cache.toggle_optimistic(1, true));
        assert!(cache.is_pending(1));
        assert!(cache.get(1).unwrap().is_completed);
    }

    #[test]
    fn confirmation_retires_the_override() {
        let mut cache = TaskCache::new();
        cache.ingest([task(1, "buy milk", false)]);
        cache.toggle_optimistic(1, true);

        cache.reconcile(task(1, "buy milk", true));
        assert!(!cache.is_pending(1));
        assert!(cache.get(1).unwrap().is_completed);
    }

    #[test]
    fn contradiction_rolls_back_to_server_state() {
        let mut cache = TaskCache::new();
        cache.ingest([task(1, "buy milk", false)]);
        cache.toggle_optimistic(1, true);

        // Server kept the task incomplete
        cache.reconcile(task(1, "buy milk", false));
        assert!(!cache.is_pending(1));
        assert!(!cache.get(1).unwrap().is_completed);
    }

    #[test]
    fn unknown_task_cannot_be_toggled() {
        let mut cache = TaskCache::new();
        assert!(!cache.toggle_optimistic(99, true));
    }

    #[test]
    fn snapshot_is_newest_first_with_overrides() {
        let mut cache = TaskCache::new();
        cache.ingest([task(1, "a", false), task(2, "b", false)]);
        cache.toggle_optimistic(1, true);

        let view = cache.snapshot();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].id, 2);
        assert!(view[1].is_completed);
    }
}
