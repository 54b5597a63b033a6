//! Registry of in-flight tasks
//!
//! Each routed task owns its own state; the registry only maps a task id to
//! the handles other callers need (cancellation and the current phase).
//! Entries live exactly as long as the [`TaskGuard`] returned by
//! [`Registry::register`].

use chrono::{DateTime, Utc};
use parley_core::{ParleyError, Result, TaskId, TaskPhase};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handles for one in-flight task
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub cancel: CancellationToken,
    pub phase: TaskPhase,
    pub started_at: DateTime<Utc>,
}

/// Map from task id to in-flight task handles
#[derive(Debug, Clone, Default)]
pub struct Registry {
    tasks: Arc<Mutex<HashMap<TaskId, ActiveTask>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a task id; fails while another task with the same id is active
    pub fn register(&self, task_id: &TaskId) -> Result<TaskGuard> {
        let mut tasks = self.lock();
        if tasks.contains_key(task_id) {
            return Err(ParleyError::DuplicateTask(task_id.clone()));
        }

        let cancel = CancellationToken::new();
        tasks.insert(
            task_id.clone(),
            ActiveTask {
                cancel: cancel.clone(),
                phase: TaskPhase::Collecting,
                started_at: Utc::now(),
            },
        );
        debug!("Registered task {} ({} active)", task_id, tasks.len());

        Ok(TaskGuard {
            reporter: PhaseReporter {
                registry: self.clone(),
                task_id: task_id.clone(),
            },
            cancel,
        })
    }

    /// Request cancellation; false if the task is not active
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.lock().get(task_id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn phase(&self, task_id: &TaskId) -> Option<TaskPhase> {
        self.lock().get(task_id).map(|task| task.phase)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<ActiveTask> {
        self.lock().get(task_id).cloned()
    }

    /// Active task ids, sorted
    pub fn active(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn set_phase(&self, task_id: &TaskId, phase: TaskPhase) {
        if let Some(task) = self.lock().get_mut(task_id) {
            task.phase = phase;
        }
    }

    fn remove(&self, task_id: &TaskId) {
        if self.lock().remove(task_id).is_some() {
            debug!("Released task {}", task_id);
        }
    }

    // Critical sections never panic, so a poisoned map is still consistent
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, ActiveTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Publishes phase changes for one task
#[derive(Debug, Clone)]
pub struct PhaseReporter {
    registry: Registry,
    task_id: TaskId,
}

impl PhaseReporter {
    pub fn report(&self, phase: TaskPhase) {
        debug!("Task {} is {}", self.task_id, phase);
        self.registry.set_phase(&self.task_id, phase);
    }
}

/// Registration of a task; dropping it releases the task id
#[derive(Debug)]
pub struct TaskGuard {
    reporter: PhaseReporter,
    cancel: CancellationToken,
}

impl TaskGuard {
    pub fn task_id(&self) -> &TaskId {
        &self.reporter.task_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_phase(&self, phase: TaskPhase) {
        self.reporter.report(phase);
    }

    pub fn reporter(&self) -> PhaseReporter {
        self.reporter.clone()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.reporter.registry.remove(&self.reporter.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = Registry::new();
        let id = TaskId::new("t-1");

        let guard = registry.register(&id).unwrap();
        assert!(matches!(
            registry.register(&id),
            Err(ParleyError::DuplicateTask(_))
        ));

        drop(guard);
        assert!(registry.register(&id).is_ok());
    }

    #[test]
    fn test_guard_drop_releases_entry() {
        let registry = Registry::new();
        {
            let _a = registry.register(&TaskId::new("t-a")).unwrap();
            let _b = registry.register(&TaskId::new("t-b")).unwrap();
            assert_eq!(
                registry.active(),
                vec![TaskId::new("t-a"), TaskId::new("t-b")]
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_phase_updates_are_visible() {
        let registry = Registry::new();
        let id = TaskId::new("t-1");
        let guard = registry.register(&id).unwrap();
        assert_eq!(registry.phase(&id), Some(TaskPhase::Collecting));

        guard.reporter().report(TaskPhase::Negotiating { round: 2 });
        assert_eq!(registry.phase(&id), Some(TaskPhase::Negotiating { round: 2 }));

        guard.set_phase(TaskPhase::Committing);
        assert_eq!(registry.phase(&id), Some(TaskPhase::Committing));
    }

    #[test]
    fn test_cancel_reaches_the_task_token() {
        let registry = Registry::new();
        let id = TaskId::new("t-1");
        let guard = registry.register(&id).unwrap();

        assert!(!guard.cancel_token().is_cancelled());
        assert!(registry.cancel(&id));
        assert!(guard.cancel_token().is_cancelled());
        assert!(!registry.cancel(&TaskId::new("t-unknown")));
    }

    #[test]
    fn test_reporter_outliving_guard_is_harmless() {
        let registry = Registry::new();
        let id = TaskId::new("t-1");
        let reporter = registry.register(&id).unwrap().reporter();

        reporter.report(TaskPhase::Committing);
        assert_eq!(registry.phase(&id), None);
    }
}
