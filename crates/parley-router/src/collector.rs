//! Evaluation collector
//!
//! Posts a solicitation and polls the channel for matching `evaluate`
//! messages until the deadline, the roster is complete, or the task is
//! cancelled. Read failures never escape: the deadline always wins and the
//! caller gets whatever accumulated.

use parley_channel::{
    decode, encode, ChannelAdapter, ChannelMessage, Envelope, MessageHandle, ProtocolError,
    Solicitation,
};
use parley_core::fail_open::{retry_until, Backoff};
use parley_core::{
    EvaluationReport, EvaluationSet, MessagePosition, ParleyConfig, ParleyError, Result,
    RetryConfig, TaskDescriptor, TaskId, WorkerId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Gathers evaluation reports from the shared channel
pub struct Collector<C: ChannelAdapter> {
    channel: Arc<C>,
    channel_name: String,
    roster: BTreeSet<WorkerId>,
    retry: RetryConfig,
}

impl<C: ChannelAdapter> Clone for Collector<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            channel_name: self.channel_name.clone(),
            roster: self.roster.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<C: ChannelAdapter> Collector<C> {
    pub fn new(channel: Arc<C>, config: &ParleyConfig) -> Self {
        Self {
            channel,
            channel_name: config.channel.name.clone(),
            roster: config.workers.iter().cloned().collect(),
            retry: config.retry.clone(),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Solicit evaluations for `task` and gather round 0 responses
    ///
    /// Posting the solicitation is retried inside the `timeout` budget; if it
    /// never lands the error is returned. Everything after that is best
    /// effort.
    #[instrument(skip(self, task, cancel), fields(task_id = %task.id))]
    pub async fn collect(
        &self,
        task: &TaskDescriptor,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<EvaluationSet> {
        let deadline = Instant::now() + timeout;
        let text = encode(&Envelope::Solicit(Solicitation {
            task_id: task.id.clone(),
            submitter: task.submitter.clone(),
            text: task.text.clone(),
        }))?;

        let posted = tokio::select! {
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled(task.id.clone())),
            posted = retry_until(
                "solicitation",
                deadline,
                self.backoff(),
                || self.post(&text),
            ) => posted?,
        };
        info!("Solicited evaluations for task {} at {}", task.id, posted.position);

        self.gather_until(&task.id, 0, posted.position, deadline, poll_interval, cancel)
            .await
    }

    /// Gather `round` evaluations posted after `since`
    pub async fn gather(
        &self,
        task_id: &TaskId,
        round: u32,
        since: MessagePosition,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<EvaluationSet> {
        let deadline = Instant::now() + timeout;
        self.gather_until(task_id, round, since, deadline, poll_interval, cancel)
            .await
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff::from_config(&self.retry)
    }

    pub(crate) async fn post(&self, text: &str) -> Result<MessageHandle> {
        self.channel.post(&self.channel_name, text).await
    }

    async fn gather_until(
        &self,
        task_id: &TaskId,
        round: u32,
        since: MessagePosition,
        deadline: Instant,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<EvaluationSet> {
        let mut responses = EvaluationSet::new();
        let mut cursor = since;
        let mut backoff = self.backoff();

        loop {
            if cancel.is_cancelled() {
                return Err(ParleyError::Cancelled(task_id.clone()));
            }

            let delay = match self.channel.read_since(&self.channel_name, cursor).await {
                Ok(messages) => {
                    backoff.reset();
                    debug!(
                        "Poll for task {} round {} returned {} messages",
                        task_id,
                        round,
                        messages.len()
                    );
                    for message in &messages {
                        cursor = cursor.max(message.position);
                        if let Some(report) = parse_report(task_id, round, message) {
                            debug!("{} reported {}% for task {}", report.worker, report.confidence, task_id);
                            responses.insert(report);
                        }
                    }
                    if self.roster_complete(&responses) {
                        debug!("All {} workers reported for task {}", self.roster.len(), task_id);
                        return Ok(responses);
                    }
                    poll_interval
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay().max(poll_interval);
                    warn!("Transient read error for task {}, backing off {:?}: {}", task_id, delay, e);
                    delay
                }
                Err(e) => {
                    warn!("Read failed for task {}: {}", task_id, e);
                    poll_interval
                }
            };

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ParleyError::Cancelled(task_id.clone())),
                _ = tokio::time::sleep(delay.min(deadline - now)) => {}
            }
        }

        Ok(responses)
    }

    fn roster_complete(&self, responses: &EvaluationSet) -> bool {
        !self.roster.is_empty() && self.roster.iter().all(|worker| responses.contains(worker))
    }
}

/// Extract a report for `task_id` and `round`, skipping everything else
pub(crate) fn parse_report(
    task_id: &TaskId,
    round: u32,
    message: &ChannelMessage,
) -> Option<EvaluationReport> {
    match decode(&message.text) {
        Ok(Envelope::Evaluate(eval)) if &eval.task_id == task_id && eval.round == round => {
            Some(EvaluationReport {
                task_id: eval.task_id,
                worker: eval.worker,
                confidence: eval.confidence,
                reasoning: eval.reasoning,
                round: eval.round,
                received_at: message.timestamp,
                position: message.position,
            })
        }
        Ok(_) => None,
        Err(ProtocolError::NotProtocol) => {
            debug!("Ignoring chat at {} from {}", message.position, message.author);
            None
        }
        Err(e) => {
            warn!(
                "Skipping malformed message at {} from {}: {}",
                message.position, message.author, e
            );
            None
        }
    }
}
