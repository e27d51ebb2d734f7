//! Per-task retry bookkeeping.
//!
//! The manager owns a thread-safe table from task identifier to retry
//! state. Read operations proceed in parallel; mutations serialize behind
//! the write lock. Snapshots are deep copies and share no mutable
//! sub-structures with the live table.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Retry state for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRetryState {
    pub task_id: String,
    /// Failed attempts so far. Successes do not increment this.
    pub retry_count: u32,
    /// Budget fixed at creation; later `get_or_create` calls never change it.
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Commits produced by each recorded attempt, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commit_counts: Vec<u32>,
    #[serde(default)]
    pub succeeded: bool,
}

impl TaskRetryState {
    fn new(task_id: &str, max_retries: u32) -> Self {
        Self {
            task_id: task_id.to_owned(),
            retry_count: 0,
            max_retries,
            last_error: None,
            commit_counts: Vec::new(),
            succeeded: false,
        }
    }
}

/// Thread-safe table of per-task retry state.
#[derive(Debug, Default)]
pub struct RetryStateManager {
    table: RwLock<HashMap<String, TaskRetryState>>,
}

impl RetryStateManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing state for `task_id`, creating it with the given
    /// budget if absent.
    ///
    /// `max_retries` is set only on creation: a later call with a different
    /// budget returns the existing state unchanged.
    pub fn get_or_create(&self, task_id: &str, max_retries: u32) -> TaskRetryState {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table
            .entry(task_id.to_owned())
            .or_insert_with(|| TaskRetryState::new(task_id, max_retries))
            .clone()
    }

    /// Return the state for `task_id`, never creating one.
    pub fn get(&self, task_id: &str) -> Option<TaskRetryState> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.get(task_id).cloned()
    }

    /// True iff the state exists, has not succeeded, and has retries left.
    pub fn should_retry(&self, task_id: &str) -> bool {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        match table.get(task_id) {
            Some(state) => !state.succeeded && state.retry_count < state.max_retries,
            None => false,
        }
    }

    /// Record the outcome of one attempt. No-op when the state is absent.
    ///
    /// A success sets `succeeded` without touching the retry counter; a
    /// failure increments the counter by one.
    pub fn record_attempt(&self, task_id: &str, success: bool) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = table.get_mut(task_id) {
            if success {
                state.succeeded = true;
            } else {
                state.retry_count += 1;
            }
        }
    }

    /// Append a commit count to the task's sequence, if the state exists.
    pub fn record_commit_count(&self, task_id: &str, count: u32) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = table.get_mut(task_id) {
            state.commit_counts.push(count);
        }
    }

    /// Overwrite the task's last error, if the state exists.
    pub fn set_last_error(&self, task_id: &str, message: impl Into<String>) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = table.get_mut(task_id) {
            state.last_error = Some(message.into());
        }
    }

    /// Tasks that have exhausted their budget without succeeding.
    pub fn failed_tasks(&self) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = table
            .values()
            .filter(|s| !s.succeeded && s.retry_count >= s.max_retries)
            .map(|s| s.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Tasks that have not succeeded but still have retries left.
    pub fn retrying_tasks(&self) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = table
            .values()
            .filter(|s| !s.succeeded && s.retry_count < s.max_retries)
            .map(|s| s.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remove one entry.
    pub fn reset(&self, task_id: &str) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.remove(task_id);
    }

    /// Remove all entries.
    pub fn reset_all(&self) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.clear();
    }

    /// Deep copy of the full table, suitable for persistence.
    pub fn snapshot(&self) -> HashMap<String, TaskRetryState> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.clone()
    }

    /// Replace the table with `entries`, deep-copying each present entry.
    ///
    /// `None` entries (the shape nulls in a hand-edited snapshot file
    /// deserialize into) are skipped silently.
    pub fn load(&self, entries: HashMap<String, Option<TaskRetryState>>) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.clear();
        for (task_id, state) in entries {
            if let Some(state) = state {
                table.insert(task_id, state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_fixes_budget_at_creation() {
        let mgr = RetryStateManager::new();
        let first = mgr.get_or_create("t1", 2);
        assert_eq!(first.max_retries, 2);
        assert_eq!(first.retry_count, 0);
        assert!(!first.succeeded);

        // A different budget on a later call does not overwrite.
        let second = mgr.get_or_create("t1", 9);
        assert_eq!(second.max_retries, 2);
    }

    #[test]
    fn get_never_creates() {
        let mgr = RetryStateManager::new();
        assert!(mgr.get("missing").is_none());
        mgr.get_or_create("t1", 1);
        assert!(mgr.get("t1").is_some());
    }

    #[test]
    fn should_retry_tracks_counter_and_success() {
        let mgr = RetryStateManager::new();
        assert!(!mgr.should_retry("absent"));

        mgr.get_or_create("t1", 2);
        assert!(mgr.should_retry("t1"));

        mgr.record_attempt("t1", false);
        assert!(mgr.should_retry("t1"));
        mgr.record_attempt("t1", false);
        assert!(!mgr.should_retry("t1"));
    }

    #[test]
    fn success_does_not_increment_counter() {
        let mgr = RetryStateManager::new();
        mgr.get_or_create("t1", 2);
        mgr.record_attempt("t1", true);

        let state = mgr.get("t1").unwrap();
        assert!(state.succeeded);
        assert_eq!(state.retry_count, 0);
        assert!(!mgr.should_retry("t1"));
    }

    #[test]
    fn record_on_absent_task_is_noop() {
        let mgr = RetryStateManager::new();
        mgr.record_attempt("ghost", false);
        mgr.record_commit_count("ghost", 4);
        mgr.set_last_error("ghost", "boom");
        assert!(mgr.get("ghost").is_none());
    }

    #[test]
    fn zero_budget_is_immediately_exhausted() {
        let mgr = RetryStateManager::new();
        mgr.get_or_create("t1", 0);
        assert!(!mgr.should_retry("t1"));
        assert_eq!(mgr.failed_tasks(), vec!["t1".to_string()]);
    }

    #[test]
    fn failed_and_retrying_listings_partition_unsucceeded_tasks() {
        let mgr = RetryStateManager::new();
        mgr.get_or_create("exhausted", 1);
        mgr.record_attempt("exhausted", false);
        mgr.get_or_create("in-flight", 3);
        mgr.record_attempt("in-flight", false);
        mgr.get_or_create("done", 1);
        mgr.record_attempt("done", true);

        assert_eq!(mgr.failed_tasks(), vec!["exhausted".to_string()]);
        assert_eq!(mgr.retrying_tasks(), vec!["in-flight".to_string()]);
    }

    #[test]
    fn commit_counts_and_last_error_recorded() {
        let mgr = RetryStateManager::new();
        mgr.get_or_create("t1", 1);
        mgr.record_commit_count("t1", 3);
        mgr.record_commit_count("t1", 0);
        mgr.set_last_error("t1", "first");
        mgr.set_last_error("t1", "second");

        let state = mgr.get("t1").unwrap();
        assert_eq!(state.commit_counts, vec![3, 0]);
        assert_eq!(state.last_error.as_deref(), Some("second"));
    }

    #[test]
    fn reset_and_reset_all() {
        let mgr = RetryStateManager::new();
        mgr.get_or_create("a", 1);
        mgr.get_or_create("b", 1);
        mgr.reset("a");
        assert!(mgr.get("a").is_none());
        assert!(mgr.get("b").is_some());
        mgr.reset_all();
        assert!(mgr.get("b").is_none());
    }

    #[test]
    fn snapshot_load_round_trip_shares_nothing() {
        let mgr = RetryStateManager::new();
        mgr.get_or_create("t1", 2);
        mgr.record_commit_count("t1", 5);
        mgr.record_attempt("t1", false);

        let snapshot = mgr.snapshot();

        // Mutating the live table after the snapshot must not affect it.
        mgr.record_commit_count("t1", 9);
        assert_eq!(snapshot["t1"].commit_counts, vec![5]);

        let restored = RetryStateManager::new();
        restored.load(snapshot.clone().into_iter().map(|(k, v)| (k, Some(v))).collect());
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn load_skips_absent_entries() {
        let mgr = RetryStateManager::new();
        let mut entries: HashMap<String, Option<TaskRetryState>> = HashMap::new();
        entries.insert("null-entry".to_string(), None);
        entries.insert(
            "real".to_string(),
            Some(TaskRetryState::new("real", 1)),
        );
        mgr.load(entries);

        assert!(mgr.get("null-entry").is_none());
        assert!(mgr.get("real").is_some());
    }

    #[test]
    fn concurrent_mutations_are_safe() {
        use std::sync::Arc;

        let mgr = Arc::new(RetryStateManager::new());
        mgr.get_or_create("shared", 1000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        mgr.record_attempt("shared", false);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(mgr.get("shared").unwrap().retry_count, 800);
    }
}
