//! Worker side of the bidding protocol
//!
//! A [`WorkerResponder`] watches the channel, answers every solicitation and
//! discussion prompt once, and keeps track of the tasks assigned to it. How
//! a worker scores a task is up to its [`Evaluator`].

use async_trait::async_trait;
use parley_channel::{
    decode, encode, ChannelAdapter, ChannelMessage, Envelope, Evaluation, PeerEvaluation,
};
use parley_core::fail_open::fail_open;
use parley_core::{Confidence, MessagePosition, ParleyError, Result, TaskId};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a worker is asked to score
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub task_id: TaskId,
    /// 0 for the solicitation, 1.. for discussion rounds
    pub round: u32,
    pub text: String,
    /// Current evaluations of every worker; empty in round 0
    pub peers: Vec<PeerEvaluation>,
}

/// A worker's answer to an [`EvaluationRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub confidence: Confidence,
    pub reasoning: Option<String>,
}

/// Scores tasks on behalf of a worker
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// `None` means the worker stays silent this round
    async fn evaluate(&self, request: &EvaluationRequest) -> Option<Verdict>;
}

/// Evaluator that replays a fixed confidence per round
///
/// The last entry repeats for later rounds; `None` entries are silent rounds.
#[derive(Debug, Clone)]
pub struct ScriptedEvaluator {
    script: Vec<Option<Confidence>>,
    delay: Duration,
    reasoning: Option<String>,
}

impl ScriptedEvaluator {
    pub fn new(script: Vec<Option<Confidence>>) -> Self {
        Self {
            script,
            delay: Duration::ZERO,
            reasoning: None,
        }
    }

    /// Parse a comma-separated script such as `20,55` or `10,-,15`
    pub fn parse(script: &str) -> Result<Self> {
        let entries = script
            .split(',')
            .map(str::trim)
            .map(|entry| match entry {
                "-" => Ok(None),
                value => value
                    .parse::<Confidence>()
                    .map(Some)
                    .map_err(ParleyError::Config),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(entries))
    }

    /// Wait this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn confidence_for(&self, round: u32) -> Option<Confidence> {
        self.script
            .get(round as usize)
            .or_else(|| self.script.last())
            .copied()
            .flatten()
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Option<Verdict> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.confidence_for(request.round).map(|confidence| Verdict {
            confidence,
            reasoning: self.reasoning.clone(),
        })
    }
}

/// Polls the channel and answers requests for one worker
pub struct WorkerResponder<C: ChannelAdapter, E: Evaluator> {
    channel: C,
    channel_name: String,
    evaluator: E,
    poll_interval: Duration,
    answered: HashSet<(TaskId, u32)>,
    assigned: Vec<TaskId>,
}

impl<C: ChannelAdapter, E: Evaluator> WorkerResponder<C, E> {
    /// The worker's name is the channel identity it posts under
    pub fn new(channel: C, channel_name: impl Into<String>, evaluator: E) -> Self {
        Self {
            channel,
            channel_name: channel_name.into(),
            evaluator,
            poll_interval: Duration::from_millis(200),
            answered: HashSet::new(),
            assigned: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        self.channel.identity()
    }

    /// Serve requests until `cancel` fires; returns the tasks assigned to
    /// this worker, in the order the decisions were seen
    pub async fn run(mut self, cancel: CancellationToken) -> Vec<TaskId> {
        let mut cursor = MessagePosition::START;
        info!("Worker {} listening on {}", self.name(), self.channel_name);

        while !cancel.is_cancelled() {
            match self.channel.read_since(&self.channel_name, cursor).await {
                Ok(messages) => {
                    for message in messages {
                        cursor = cursor.max(message.position);
                        self.handle(&message).await;
                    }
                }
                Err(e) => warn!("Worker {} failed to read channel: {}", self.name(), e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        debug!("Worker {} stopped", self.name());
        self.assigned
    }

    async fn handle(&mut self, message: &ChannelMessage) {
        let request = match decode(&message.text) {
            Ok(Envelope::Solicit(s)) => EvaluationRequest {
                task_id: s.task_id,
                round: 0,
                text: s.text,
                peers: Vec::new(),
            },
            Ok(Envelope::Discuss(d)) => EvaluationRequest {
                task_id: d.task_id,
                round: d.round,
                text: d.text,
                peers: d.peers,
            },
            Ok(Envelope::Assign(a)) => {
                if a.decision.assigned_worker() == Some(self.name()) {
                    info!("Worker {} was assigned task {}", self.name(), a.task_id);
                    self.assigned.push(a.task_id);
                }
                return;
            }
            Ok(Envelope::Evaluate(_)) | Err(_) => return,
        };

        if !self.answered.insert((request.task_id.clone(), request.round)) {
            return;
        }

        let Some(verdict) = self.evaluator.evaluate(&request).await else {
            debug!(
                "Worker {} stays silent on task {} round {}",
                self.name(),
                request.task_id,
                request.round
            );
            return;
        };

        let reply = Envelope::Evaluate(Evaluation {
            task_id: request.task_id,
            worker: self.name().to_string(),
            round: request.round,
            confidence: verdict.confidence,
            reasoning: verdict.reasoning,
        });
        fail_open("evaluation_reply", || async {
            match encode(&reply) {
                Ok(text) => self.channel.post(&self.channel_name, &text).await,
                Err(e) => Err(ParleyError::from(e)),
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_channel::{Assignment, InMemoryBoard, Solicitation};
    use parley_core::AssignmentDecision;

    fn conf(value: u8) -> Option<Confidence> {
        Confidence::new(value)
    }

    #[test]
    fn test_script_parsing() {
        let script = ScriptedEvaluator::parse("10, -, 15").unwrap();
        assert_eq!(script.confidence_for(0), conf(10));
        assert_eq!(script.confidence_for(1), None);
        assert_eq!(script.confidence_for(2), conf(15));
        // Last entry repeats
        assert_eq!(script.confidence_for(7), conf(15));

        assert!(ScriptedEvaluator::parse("10,abc").is_err());
        assert!(ScriptedEvaluator::parse("120").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_each_round_once_and_tracks_assignments() {
        let board = InMemoryBoard::new();
        let coordinator = board.participant("coordinator");
        let responder = WorkerResponder::new(
            board.participant("Beta"),
            "coordination",
            ScriptedEvaluator::new(vec![conf(40)]).with_reasoning("done it before"),
        );
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(responder.run(cancel.clone()));

        let task_id = TaskId::new("t-1");
        let solicit = encode(&Envelope::Solicit(Solicitation {
            task_id: task_id.clone(),
            submitter: "U1".to_string(),
            text: "Reconcile invoices".to_string(),
        }))
        .unwrap();
        // The same request twice only gets one answer
        coordinator.post("coordination", &solicit).await.unwrap();
        coordinator.post("coordination", &solicit).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let assign = encode(&Envelope::Assign(Assignment {
            task_id: task_id.clone(),
            decision: AssignmentDecision::Assigned {
                worker: "Beta".to_string(),
                confidence: Confidence::new(40).unwrap(),
            },
        }))
        .unwrap();
        coordinator.post("coordination", &assign).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        cancel.cancel();
        let assigned = worker.await.unwrap();
        assert_eq!(assigned, vec![task_id.clone()]);

        let replies: Vec<_> = board
            .transcript("coordination")
            .await
            .into_iter()
            .filter_map(|m| match decode(&m.text) {
                Ok(Envelope::Evaluate(e)) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].worker, "Beta");
        assert_eq!(replies[0].reasoning.as_deref(), Some("done it before"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_rounds_post_nothing() {
        let board = InMemoryBoard::new();
        let responder = WorkerResponder::new(
            board.participant("Alpha"),
            "coordination",
            ScriptedEvaluator::new(vec![None]),
        );
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(responder.run(cancel.clone()));

        let solicit = encode(&Envelope::Solicit(Solicitation {
            task_id: TaskId::new("t-1"),
            submitter: "U1".to_string(),
            text: "Reconcile invoices".to_string(),
        }))
        .unwrap();
        board
            .participant("coordinator")
            .post("coordination", &solicit)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        cancel.cancel();
        assert!(worker.await.unwrap().is_empty());
        assert_eq!(board.transcript("coordination").await.len(), 1);
    }
}
