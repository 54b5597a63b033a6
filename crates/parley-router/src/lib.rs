//! # parley-router
//!
//! Confidence-bidding task routing for Parley.
//!
//! This crate provides:
//! - Evaluation collection over a shared channel
//! - The pure decision engine (assign, negotiate, or give up)
//! - Bounded negotiation rounds with silence-preserving merges
//! - Idempotent assignment commits
//! - The router that runs one tokio task per routed task
//! - A scriptable worker responder for simulations and tests

mod collector;
mod decision;
mod negotiation;
mod notifier;
mod registry;
mod router;
mod worker;

pub use collector::Collector;
pub use decision::{decide, finalize, meets_threshold, DecisionOutcome};
pub use negotiation::Negotiator;
pub use notifier::Notifier;
pub use registry::{ActiveTask, PhaseReporter, Registry, TaskGuard};
pub use router::Router;
pub use worker::{EvaluationRequest, Evaluator, ScriptedEvaluator, Verdict, WorkerResponder};
