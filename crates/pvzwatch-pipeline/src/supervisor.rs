use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use pvzwatch_core::types::{Mode, TaskStats, TaskStatus};

/// A point-in-time view of one registry entry.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub mode: Mode,
    pub status: TaskStatus,
    pub stats: TaskStats,
}

struct TaskEntry {
    mode: Mode,
    status: Mutex<TaskStatus>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    messages_scanned: AtomicU64,
    items_found: AtomicU64,
    notifications_sent: AtomicU64,
    last_update: Mutex<DateTime<Utc>>,
}

impl TaskEntry {
    fn touch(&self) {
        *self.last_update.lock().unwrap() = Utc::now();
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            mode: self.mode,
            status: *self.status.lock().unwrap(),
            stats: TaskStats {
                total_messages_scanned: self.messages_scanned.load(Ordering::Relaxed),
                items_found: self.items_found.load(Ordering::Relaxed),
                notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
                last_update: *self.last_update.lock().unwrap(),
            },
        }
    }
}

/// Process-wide registry of monitoring tasks.
///
/// Counter updates are atomic adds; the dashmap keeps entry mutation
/// thread-safe without a global lock.
#[derive(Default)]
pub struct Supervisor {
    tasks: DashMap<Uuid, Arc<TaskEntry>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task in `pending` state; returns its cancellation token.
    pub fn create(&self, task_id: Uuid, mode: Mode) -> CancellationToken {
        let cancel = CancellationToken::new();
        let entry = Arc::new(TaskEntry {
            mode,
            status: Mutex::new(TaskStatus::Pending),
            cancel: cancel.clone(),
            handle: Mutex::new(None),
            messages_scanned: AtomicU64::new(0),
            items_found: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            last_update: Mutex::new(Utc::now()),
        });
        self.tasks.insert(task_id, entry);
        info!(%task_id, %mode, "task registered");
        cancel
    }

    /// Attach the spawned runtime so `stop` can cancel it.
    pub fn attach_runtime(&self, task_id: Uuid, handle: JoinHandle<()>) {
        if let Some(entry) = self.tasks.get(&task_id) {
            *entry.handle.lock().unwrap() = Some(handle);
        }
    }

    pub fn get(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        self.tasks.get(&task_id).map(|e| e.snapshot())
    }

    pub fn stats(&self, task_id: Uuid) -> Option<TaskStats> {
        self.get(task_id).map(|s| s.stats)
    }

    pub fn update_status(&self, task_id: Uuid, status: TaskStatus) {
        if let Some(entry) = self.tasks.get(&task_id) {
            *entry.status.lock().unwrap() = status;
            entry.touch();
            info!(%task_id, %status, "task status updated");
        }
    }

    /// Atomic counter adds; zero deltas are fine.
    pub fn add_stats(&self, task_id: Uuid, scanned: u64, found: u64, sent: u64) {
        if let Some(entry) = self.tasks.get(&task_id) {
            entry.messages_scanned.fetch_add(scanned, Ordering::Relaxed);
            entry.items_found.fetch_add(found, Ordering::Relaxed);
            entry.notifications_sent.fetch_add(sent, Ordering::Relaxed);
            entry.touch();
        }
    }

    /// Fire the cancellation signal, cancel a live runtime handle, and mark
    /// the entry stopped. Returns false for an unknown id.
    pub fn stop(&self, task_id: Uuid) -> bool {
        let Some(entry) = self.tasks.get(&task_id) else {
            return false;
        };
        entry.cancel.cancel();
        if let Some(handle) = entry.handle.lock().unwrap().take() {
            if !handle.is_finished() {
                handle.abort();
            }
        }
        *entry.status.lock().unwrap() = TaskStatus::Stopped;
        entry.touch();
        info!(%task_id, "task stopped");
        true
    }

    pub fn remove(&self, task_id: Uuid) {
        if self.tasks.remove(&task_id).is_some() {
            info!(%task_id, "task removed from registry");
        }
    }

    /// All registered task ids (used by graceful shutdown).
    pub fn task_ids(&self) -> Vec<Uuid> {
        self.tasks.iter().map(|e| *e.key()).collect()
    }

    /// Sweep terminal entries whose last update is older than `max_age`.
    /// Returns the number removed.
    pub fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        let threshold = Utc::now() - max_age;
        let before = self.tasks.len();
        self.tasks.retain(|_, entry| {
            let terminal = entry.status.lock().unwrap().is_terminal();
            let last = *entry.last_update.lock().unwrap();
            !(terminal && last < threshold)
        });
        let removed = before - self.tasks.len();
        if removed > 0 {
            info!(removed, "stale task entries swept");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_and_stats_accumulate() {
        let sup = Supervisor::new();
        let id = Uuid::new_v4();
        sup.create(id, Mode::Worker);

        let snap = sup.get(id).unwrap();
        assert_eq!(snap.status, TaskStatus::Pending);
        assert_eq!(snap.stats.total_messages_scanned, 0);

        sup.add_stats(id, 5, 1, 1);
        sup.add_stats(id, 3, 0, 0);
        let stats = sup.stats(id).unwrap();
        assert_eq!(stats.total_messages_scanned, 8);
        assert_eq!(stats.items_found, 1);
        assert_eq!(stats.notifications_sent, 1);
    }

    #[test]
    fn stop_cancels_token_and_marks_stopped() {
        let sup = Supervisor::new();
        let id = Uuid::new_v4();
        let token = sup.create(id, Mode::Employer);

        assert!(!token.is_cancelled());
        assert!(sup.stop(id));
        assert!(token.is_cancelled());
        assert_eq!(sup.get(id).unwrap().status, TaskStatus::Stopped);

        assert!(!sup.stop(Uuid::new_v4()));
    }

    #[test]
    fn cleanup_sweeps_only_stale_terminal_entries() {
        let sup = Supervisor::new();
        let running = Uuid::new_v4();
        let stopped = Uuid::new_v4();
        sup.create(running, Mode::Worker);
        sup.create(stopped, Mode::Worker);
        sup.update_status(running, TaskStatus::Running);
        sup.update_status(stopped, TaskStatus::Stopped);

        // Nothing is old enough yet.
        assert_eq!(sup.cleanup_old_tasks(Duration::hours(24)), 0);
        // With a zero max-age the terminal entry goes, the running one stays.
        assert_eq!(sup.cleanup_old_tasks(Duration::zero()), 1);
        assert!(sup.get(running).is_some());
        assert!(sup.get(stopped).is_none());
    }
}
