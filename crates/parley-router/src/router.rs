//! Task router
//!
//! Ties collection, decision, negotiation and commit together for each
//! submitted task. Every task runs independently; the channel and the task
//! registry are the only things tasks share.

use parley_channel::ChannelAdapter;
use parley_core::{
    AssignmentDecision, ParleyConfig, ParleyError, Result, RoutingOutcome, TaskDescriptor,
    TaskId, TaskPhase,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::collector::Collector;
use crate::decision::{decide, finalize, DecisionOutcome};
use crate::negotiation::Negotiator;
use crate::notifier::Notifier;
use crate::registry::{Registry, TaskGuard};

enum Admission {
    Decided(AssignmentDecision),
    Route(TaskGuard),
}

/// Routes tasks to workers over a shared channel
pub struct Router<C: ChannelAdapter> {
    config: Arc<ParleyConfig>,
    collector: Collector<C>,
    notifier: Arc<Notifier<C>>,
    registry: Registry,
}

impl<C: ChannelAdapter> Clone for Router<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            collector: self.collector.clone(),
            notifier: Arc::clone(&self.notifier),
            registry: self.registry.clone(),
        }
    }
}

impl<C: ChannelAdapter + 'static> Router<C> {
    pub fn new(channel: C, config: ParleyConfig) -> Self {
        Self::with_shared_channel(Arc::new(channel), config)
    }

    pub fn with_shared_channel(channel: Arc<C>, config: ParleyConfig) -> Self {
        Self {
            collector: Collector::new(Arc::clone(&channel), &config),
            notifier: Arc::new(Notifier::new(channel, &config)),
            registry: Registry::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ParleyConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier<C> {
        &self.notifier
    }

    /// Route a task to completion
    ///
    /// Returns the committed decision, or [`RoutingOutcome::Cancelled`] if
    /// the task was withdrawn first. A task whose decision was already
    /// delivered gets that decision back without touching the channel. The
    /// only errors are [`ParleyError::InvalidTaskId`],
    /// [`ParleyError::DuplicateTask`] and [`ParleyError::CommitFailure`].
    pub async fn submit_task(&self, task: TaskDescriptor) -> Result<RoutingOutcome> {
        match self.admit(&task)? {
            Admission::Decided(decision) => Ok(RoutingOutcome::Decided(decision)),
            Admission::Route(guard) => self.run(task, guard).await,
        }
    }

    /// Route a task on its own tokio task
    ///
    /// The task is registered before this returns, so it can be cancelled
    /// immediately.
    pub fn spawn(&self, task: TaskDescriptor) -> JoinHandle<Result<RoutingOutcome>> {
        let admission = self.admit(&task);
        let router = self.clone();
        tokio::spawn(async move {
            match admission? {
                Admission::Decided(decision) => Ok(RoutingOutcome::Decided(decision)),
                Admission::Route(guard) => router.run(task, guard).await,
            }
        })
    }

    /// Release the delivery record of a resolved task
    ///
    /// Afterwards the same id may be routed again from scratch.
    pub fn forget(&self, task_id: &TaskId) -> Option<AssignmentDecision> {
        self.notifier.forget(task_id)
    }

    /// Withdraw an in-flight task; false if it is not active
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let found = self.registry.cancel(task_id);
        if found {
            info!("Cancellation requested for task {}", task_id);
        }
        found
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskPhase> {
        self.registry.phase(task_id)
    }

    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.registry.active()
    }

    fn admit(&self, task: &TaskDescriptor) -> Result<Admission> {
        if !task.id.is_valid() {
            return Err(ParleyError::InvalidTaskId(task.id.to_string()));
        }
        if let Some(decision) = self.notifier.delivered(&task.id) {
            info!("Task {} already decided: {}", task.id, decision);
            return Ok(Admission::Decided(decision));
        }
        self.registry.register(&task.id).map(Admission::Route)
    }

    #[instrument(skip(self, task, guard), fields(task_id = %task.id))]
    async fn run(&self, task: TaskDescriptor, guard: TaskGuard) -> Result<RoutingOutcome> {
        info!("Routing task {} from {}", task.id, task.submitter);

        let decision = match self.route(&task, &guard).await {
            Ok(decision) => decision,
            Err(ParleyError::Cancelled(_)) => {
                info!("Task {} cancelled; no decision written", task.id);
                return Ok(RoutingOutcome::Cancelled);
            }
            Err(e) => {
                warn!("Routing failed for task {}: {}", task.id, e);
                AssignmentDecision::Failed {
                    reason: e.to_string(),
                }
            }
        };

        if guard.cancel_token().is_cancelled() {
            info!("Task {} cancelled before commit; no decision written", task.id);
            return Ok(RoutingOutcome::Cancelled);
        }

        guard.set_phase(TaskPhase::Committing);
        self.notifier.commit(&task.id, &decision).await?;
        Ok(RoutingOutcome::Decided(decision))
    }

    async fn route(&self, task: &TaskDescriptor, guard: &TaskGuard) -> Result<AssignmentDecision> {
        let routing = &self.config.routing;
        let thresholds = routing.thresholds();
        let cancel = guard.cancel_token();

        let initial = self
            .collector
            .collect(task, routing.initial_timeout(), routing.poll_interval(), cancel)
            .await?;
        info!(
            "Collected {} evaluations for task {}",
            initial.len(),
            task.id
        );

        let outcome = decide(&initial, &thresholds);
        let negotiate = match outcome {
            DecisionOutcome::Assign(_) => false,
            DecisionOutcome::Negotiate => true,
            DecisionOutcome::NoConfidentWorker => {
                routing.negotiate_below_minimum && !initial.is_empty()
            }
        };
        if !negotiate || routing.max_rounds == 0 {
            return Ok(finalize(&initial, &thresholds));
        }

        let state = Negotiator::new(
            self.collector.clone(),
            routing.poll_interval(),
            routing.round_pause(),
        )
        .with_reporter(guard.reporter())
        .negotiate(
            task,
            initial,
            routing.max_rounds,
            &thresholds,
            routing.round_timeout(),
            cancel,
        )
        .await?;
        info!(
            "Negotiation for task {} ended after {} rounds",
            task.id,
            state.rounds_run()
        );

        Ok(finalize(state.current(), &thresholds))
    }
}
