//! Negotiation coordinator
//!
//! Runs bounded discussion rounds: each round shows every worker the
//! current evaluations and re-collects. Workers that stay silent keep their
//! previous report. Rounds are strictly sequential.

use parley_channel::{encode, ChannelAdapter, Discussion, Envelope, MessageHandle, PeerEvaluation};
use parley_core::fail_open::retry_until;
use parley_core::{
    EvaluationSet, NegotiationState, ParleyError, Result, RoundRecord, TaskDescriptor, TaskPhase,
    Thresholds,
};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::collector::Collector;
use crate::decision::meets_threshold;
use crate::registry::PhaseReporter;

/// Drives the discussion rounds for one task
pub struct Negotiator<C: ChannelAdapter> {
    collector: Collector<C>,
    poll_interval: Duration,
    round_pause: Duration,
    reporter: Option<PhaseReporter>,
}

impl<C: ChannelAdapter> Negotiator<C> {
    pub fn new(collector: Collector<C>, poll_interval: Duration, round_pause: Duration) -> Self {
        Self {
            collector,
            poll_interval,
            round_pause,
            reporter: None,
        }
    }

    /// Publish the current round to the task registry
    pub fn with_reporter(mut self, reporter: PhaseReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Run up to `max_rounds` rounds, stopping once the best report reaches
    /// the discussion threshold
    ///
    /// Only cancellation is an error. Transient failures posting a prompt
    /// are retried within `round_timeout`; a round whose prompt still cannot
    /// be posted is recorded with no responses and the next round starts.
    #[instrument(skip(self, task, initial, thresholds, cancel), fields(task_id = %task.id))]
    pub async fn negotiate(
        &self,
        task: &TaskDescriptor,
        initial: EvaluationSet,
        max_rounds: u32,
        thresholds: &Thresholds,
        round_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<NegotiationState> {
        let mut state = NegotiationState::new(task.id.clone(), initial);

        for round in 1..=max_rounds {
            if cancel.is_cancelled() {
                return Err(ParleyError::Cancelled(task.id.clone()));
            }
            state.round = round;
            if let Some(reporter) = &self.reporter {
                reporter.report(TaskPhase::Negotiating { round });
            }

            let prompt = Envelope::Discuss(Discussion {
                task_id: task.id.clone(),
                round,
                text: task.text.clone(),
                peers: peers(state.current()),
            });
            let posted = match self.post_prompt(&prompt, round_timeout, cancel).await {
                Ok(handle) => Some(handle),
                Err(ParleyError::Cancelled(id)) => return Err(ParleyError::Cancelled(id)),
                Err(e) => {
                    warn!("Skipping round {} for task {}: prompt not posted: {}", round, task.id, e);
                    None
                }
            };
            let prompt_posted = posted.is_some();

            let responses = match posted {
                Some(handle) => {
                    info!("Round {} of {} for task {}", round, max_rounds, task.id);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ParleyError::Cancelled(task.id.clone())),
                        _ = tokio::time::sleep(self.round_pause) => {}
                    }
                    self.collector
                        .gather(
                            &task.id,
                            round,
                            handle.position,
                            round_timeout,
                            self.poll_interval,
                            cancel,
                        )
                        .await?
                }
                None => EvaluationSet::new(),
            };

            let mut merged = state.current().clone();
            merged.merge(&responses);
            debug!(
                "Round {} for task {}: {} responses, {} workers tracked",
                round,
                task.id,
                responses.len(),
                merged.len()
            );

            let settled = meets_threshold(&merged, thresholds);
            state.history.push(RoundRecord {
                round,
                prompt_posted,
                responses,
                merged,
            });

            if settled {
                info!("Task {} settled after round {}", task.id, round);
                break;
            }
        }

        Ok(state)
    }

    async fn post_prompt(
        &self,
        prompt: &Envelope,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<MessageHandle> {
        let text = encode(prompt)?;
        let deadline = Instant::now() + budget;
        tokio::select! {
            _ = cancel.cancelled() => Err(ParleyError::Cancelled(prompt.task_id().clone())),
            posted = retry_until(
                "discussion_prompt",
                deadline,
                self.collector.backoff(),
                || self.collector.post(&text),
            ) => posted,
        }
    }
}

fn peers(set: &EvaluationSet) -> Vec<PeerEvaluation> {
    set.iter()
        .map(|report| PeerEvaluation {
            worker: report.worker.clone(),
            confidence: report.confidence,
            reasoning: report.reasoning.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_channel::{decode, Evaluation, FailureMode, FlakyChannel, InMemoryBoard};
    use parley_core::{Confidence, EvaluationReport, MessagePosition, ParleyConfig, TaskId};
    use std::sync::Arc;

    fn initial(task_id: &TaskId, bids: &[(&str, u8)]) -> EvaluationSet {
        bids.iter()
            .enumerate()
            .map(|(i, (worker, confidence))| EvaluationReport {
                task_id: task_id.clone(),
                worker: worker.to_string(),
                confidence: Confidence::new(*confidence).unwrap(),
                reasoning: Some(format!("{} thinks {}", worker, confidence)),
                round: 0,
                received_at: chrono::Utc::now(),
                position: MessagePosition(i as u64 + 1),
            })
            .collect()
    }

    fn negotiator<C: ChannelAdapter>(channel: C, workers: &[&str]) -> Negotiator<C> {
        let config = ParleyConfig {
            workers: workers.iter().map(|w| w.to_string()).collect(),
            ..ParleyConfig::default()
        };
        Negotiator::new(
            Collector::new(Arc::new(channel), &config),
            Duration::from_millis(300),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_workers_exhaust_all_rounds() {
        let board = InMemoryBoard::new();
        let task = TaskDescriptor::new("Plan the offsite", "U1");
        let negotiator = negotiator(board.participant("coordinator"), &[]);

        let state = negotiator
            .negotiate(
                &task,
                initial(&task.id, &[("Alpha", 20), ("Beta", 40)]),
                3,
                &Thresholds::default(),
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(state.rounds_run(), 3);
        assert_eq!(state.round, 3);
        // Silence keeps the last report
        assert_eq!(state.current().get("Beta").unwrap().confidence.value(), 40);
        assert_eq!(state.current().len(), 2);

        let prompts: Vec<_> = board
            .transcript("coordination")
            .await
            .into_iter()
            .filter_map(|m| match decode(&m.text) {
                Ok(Envelope::Discuss(d)) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[0].peers.len(), 2);
        assert_eq!(prompts[2].round, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_once_threshold_is_met() {
        let board = InMemoryBoard::new();
        let task = TaskDescriptor::new("Plan the offsite", "U1");
        let negotiator = negotiator(board.participant("coordinator"), &["Alpha", "Beta"]);

        let beta = board.participant("Beta");
        let alpha = board.participant("Alpha");
        let task_id = task.id.clone();
        tokio::spawn(async move {
            // Answer the first discussion prompt as soon as it shows up
            loop {
                let messages = beta.read_since("coordination", MessagePosition::START).await.unwrap();
                if messages.iter().any(|m| m.text.starts_with("parley/1 discuss")) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            for (channel, worker, confidence) in [(&alpha, "Alpha", 20), (&beta, "Beta", 55)] {
                let text = encode(&Envelope::Evaluate(Evaluation {
                    task_id: task_id.clone(),
                    worker: worker.to_string(),
                    round: 1,
                    confidence: Confidence::new(confidence).unwrap(),
                    reasoning: None,
                }))
                .unwrap();
                channel.post("coordination", &text).await.unwrap();
            }
        });

        let state = negotiator
            .negotiate(
                &task,
                initial(&task.id, &[("Alpha", 20), ("Beta", 40)]),
                3,
                &Thresholds::default(),
                Duration::from_secs(4),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(state.rounds_run(), 1);
        assert_eq!(state.current().best().unwrap().worker, "Beta");
        assert_eq!(state.history[0].responses.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unposted_prompt_skips_round() {
        let board = InMemoryBoard::new();
        let flaky = FlakyChannel::new(board.participant("coordinator")).fail_posts_containing(
            "Round: 1",
            1,
            FailureMode::Permanent,
        );
        let task = TaskDescriptor::new("Plan the offsite", "U1");
        let negotiator = negotiator(flaky, &[]);

        let state = negotiator
            .negotiate(
                &task,
                initial(&task.id, &[("Alpha", 20)]),
                2,
                &Thresholds::default(),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(state.rounds_run(), 2);
        assert!(!state.history[0].prompt_posted);
        assert!(state.history[0].responses.is_empty());
        assert!(state.history[1].prompt_posted);
        assert_eq!(board.transcript("coordination").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_prompt_is_retried() {
        let board = InMemoryBoard::new();
        let flaky = Arc::new(
            FlakyChannel::new(board.participant("coordinator")).fail_posts_containing(
                "parley/1 discuss",
                1,
                FailureMode::Transient,
            ),
        );
        let config = ParleyConfig::default();
        let negotiator = Negotiator::new(
            Collector::new(Arc::clone(&flaky), &config),
            Duration::from_millis(300),
            Duration::from_secs(1),
        );
        let task = TaskDescriptor::new("Plan the offsite", "U1");

        let state = negotiator
            .negotiate(
                &task,
                initial(&task.id, &[("Alpha", 20)]),
                1,
                &Thresholds::default(),
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(flaky.post_attempts(), 2);
        assert!(state.history[0].prompt_posted);
        assert_eq!(board.transcript("coordination").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_rounds() {
        let board = InMemoryBoard::new();
        let task = TaskDescriptor::new("Plan the offsite", "U1");
        let negotiator = negotiator(board.participant("coordinator"), &[]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });

        let result = negotiator
            .negotiate(
                &task,
                initial(&task.id, &[("Alpha", 20)]),
                3,
                &Thresholds::default(),
                Duration::from_secs(2),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(ParleyError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_zero_rounds_returns_initial() {
        let board = InMemoryBoard::new();
        let task = TaskDescriptor::new("Plan the offsite", "U1");
        let negotiator = negotiator(board.participant("coordinator"), &[]);
        let set = initial(&task.id, &[("Alpha", 20)]);

        let state = negotiator
            .negotiate(
                &task,
                set.clone(),
                0,
                &Thresholds::default(),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(state.current(), &set);
        assert!(board.transcript("coordination").await.is_empty());
    }
}
