//! Assignment notifier
//!
//! Publishes the single decision for a task. Commits are idempotent per task
//! id: once delivery has been confirmed, repeating the same decision is a
//! no-op and a different one is refused. Commits for the same task id are
//! serialized, so concurrent callers never post twice.
//!
//! Confirmed decisions stay on record until [`Notifier::forget`] is called.
//! The router answers resubmissions of a decided task from this record, so
//! long-running callers should forget tasks once the submitter has
//! acknowledged the outcome.

use parley_channel::{encode, Assignment, ChannelAdapter, Envelope};
use parley_core::fail_open::{retry_attempts, Backoff};
use parley_core::{AssignmentDecision, ParleyConfig, ParleyError, Result, RetryConfig, TaskId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

pub struct Notifier<C: ChannelAdapter> {
    channel: Arc<C>,
    channel_name: String,
    retry: RetryConfig,
    delivered: Mutex<HashMap<TaskId, AssignmentDecision>>,
    in_flight: Mutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>,
}

impl<C: ChannelAdapter> Notifier<C> {
    pub fn new(channel: Arc<C>, config: &ParleyConfig) -> Self {
        Self {
            channel,
            channel_name: config.channel.name.clone(),
            retry: config.retry.clone(),
            delivered: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Post the decision for `task_id`
    ///
    /// Returns [`ParleyError::CommitFailure`] when every attempt failed; the
    /// message may or may not have reached the channel in that case.
    #[instrument(skip(self, task_id, decision), fields(task_id = %task_id, decision = %decision))]
    pub async fn commit(&self, task_id: &TaskId, decision: &AssignmentDecision) -> Result<()> {
        let slot = self.slot(task_id);
        let result = {
            let _held = slot.lock().await;
            self.commit_locked(task_id, decision).await
        };
        self.release_slot(task_id, slot);
        result
    }

    async fn commit_locked(&self, task_id: &TaskId, decision: &AssignmentDecision) -> Result<()> {
        if let Some(existing) = self.delivered(task_id) {
            if &existing == decision {
                debug!("Decision for task {} already delivered", task_id);
                return Ok(());
            }
            warn!(
                "Refusing to replace decision for task {} ({}) with {}",
                task_id, existing, decision
            );
            return Err(ParleyError::AlreadyCommitted(task_id.clone()));
        }

        let text = encode(&Envelope::Assign(Assignment {
            task_id: task_id.clone(),
            decision: decision.clone(),
        }))
        .map_err(|e| ParleyError::CommitFailure {
            task_id: task_id.clone(),
            reason: e.to_string(),
        })?;

        let posted = retry_attempts(
            "assignment",
            self.retry.commit_attempts,
            Backoff::from_config(&self.retry),
            || self.channel.post(&self.channel_name, &text),
        )
        .await
        .map_err(|e| ParleyError::CommitFailure {
            task_id: task_id.clone(),
            reason: e.to_string(),
        })?;

        self.lock().insert(task_id.clone(), decision.clone());
        info!("Task {} {} (posted at {})", task_id, decision, posted.position);
        Ok(())
    }

    /// The decision confirmed for `task_id`, if any
    pub fn delivered(&self, task_id: &TaskId) -> Option<AssignmentDecision> {
        self.lock().get(task_id).cloned()
    }

    /// Drop the delivery record for `task_id`
    pub fn forget(&self, task_id: &TaskId) -> Option<AssignmentDecision> {
        self.lock().remove(task_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, AssignmentDecision>> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, task_id: &TaskId) -> Arc<AsyncMutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(in_flight.entry(task_id.clone()).or_default())
    }

    /// Drop the per-task lock once no other commit is waiting on it
    fn release_slot(&self, task_id: &TaskId, slot: Arc<AsyncMutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held here
        if Arc::strong_count(&slot) <= 2 {
            in_flight.remove(task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_channel::{decode, FailureMode, FlakyChannel, InMemoryBoard};
    use parley_core::Confidence;

    fn assigned(worker: &str, confidence: u8) -> AssignmentDecision {
        AssignmentDecision::Assigned {
            worker: worker.to_string(),
            confidence: Confidence::new(confidence).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_commit_posts_one_message() {
        let board = InMemoryBoard::new();
        let notifier = Notifier::new(
            Arc::new(board.participant("coordinator")),
            &ParleyConfig::default(),
        );
        let task = TaskId::new("t-1");

        notifier.commit(&task, &assigned("Beta", 75)).await.unwrap();
        notifier.commit(&task, &assigned("Beta", 75)).await.unwrap();

        let transcript = board.transcript("coordination").await;
        assert_eq!(transcript.len(), 1);
        match decode(&transcript[0].text).unwrap() {
            Envelope::Assign(a) => assert_eq!(a.decision, assigned("Beta", 75)),
            other => panic!("Expected assignment, got {:?}", other),
        }
        assert_eq!(notifier.delivered(&task), Some(assigned("Beta", 75)));
    }

    #[tokio::test]
    async fn test_conflicting_commit_is_refused() {
        let board = InMemoryBoard::new();
        let notifier = Notifier::new(
            Arc::new(board.participant("coordinator")),
            &ParleyConfig::default(),
        );
        let task = TaskId::new("t-1");

        notifier.commit(&task, &assigned("Beta", 75)).await.unwrap();
        let err = notifier
            .commit(&task, &assigned("Alpha", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::AlreadyCommitted(_)));
        assert_eq!(board.transcript("coordination").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let board = InMemoryBoard::new();
        let flaky = FlakyChannel::new(board.participant("coordinator"))
            .fail_posts(2, FailureMode::Transient);
        let notifier = Notifier::new(Arc::new(flaky), &ParleyConfig::default());

        notifier
            .commit(&TaskId::new("t-1"), &assigned("Beta", 75))
            .await
            .unwrap();
        assert_eq!(board.transcript("coordination").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_report_unknown_status() {
        let board = InMemoryBoard::new();
        let flaky = Arc::new(
            FlakyChannel::new(board.participant("coordinator"))
                .fail_all_posts_containing("assign", FailureMode::Permanent),
        );
        let notifier = Notifier::new(Arc::clone(&flaky), &ParleyConfig::default());
        let task = TaskId::new("t-1");

        let err = notifier
            .commit(&task, &AssignmentDecision::NoConfidentWorker { highest: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::CommitFailure { .. }));
        assert_eq!(flaky.post_attempts(), 3);
        assert_eq!(notifier.delivered(&task), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_commits_post_once() {
        let board = InMemoryBoard::new();
        let flaky = FlakyChannel::new(board.participant("coordinator"))
            .fail_posts(2, FailureMode::Transient);
        let notifier = Notifier::new(Arc::new(flaky), &ParleyConfig::default());
        let task = TaskId::new("t-1");
        let decision = assigned("Beta", 75);

        let (first, second) = tokio::join!(
            notifier.commit(&task, &decision),
            notifier.commit(&task, &decision)
        );
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(board.transcript("coordination").await.len(), 1);
        assert!(notifier.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forget_releases_record() {
        let board = InMemoryBoard::new();
        let notifier = Notifier::new(
            Arc::new(board.participant("coordinator")),
            &ParleyConfig::default(),
        );
        let task = TaskId::new("t-1");

        notifier.commit(&task, &assigned("Beta", 75)).await.unwrap();
        assert_eq!(notifier.forget(&task), Some(assigned("Beta", 75)));
        assert_eq!(notifier.delivered(&task), None);
    }
}
