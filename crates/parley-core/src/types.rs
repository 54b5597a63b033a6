//! Core type definitions for Parley routing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Task correlation identifier
///
/// Format: t-{8 hex chars} when generated (e.g., t-1a2b3c4d). Any single
/// whitespace-free token is accepted from the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh task id
    pub fn generate() -> Self {
        Self(format!("t-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can be carried in a protocol message
    pub fn is_valid(&self) -> bool {
        is_token(&self.0)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_token(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("Invalid task id: {:?}", s))
        }
    }
}

/// Worker identity as it appears on the channel
pub type WorkerId = String;

/// Whether a string can travel as a single protocol token
pub fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

/// Self-reported suitability score, always within 0..=100
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Confidence(u8);

impl Confidence {
    pub const MAX: u8 = 100;

    pub fn new(value: u8) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    /// Clamp an arbitrary score into range
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(0, Self::MAX as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Confidence {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("Confidence out of range: {}", value))
    }
}

impl TryFrom<u32> for Confidence {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| format!("Confidence out of range: {}", value))
    }
}

impl From<Confidence> for u8 {
    fn from(c: Confidence) -> Self {
        c.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s
            .trim()
            .trim_end_matches('%')
            .parse()
            .map_err(|_| format!("Invalid confidence: {}", s))?;
        Self::try_from(value)
    }
}

/// Position of a message within a channel
///
/// Positions are strictly increasing in write order. `MessagePosition::START`
/// precedes every message, so `read_since(START)` returns the whole channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessagePosition(pub u64);

impl MessagePosition {
    pub const START: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A task submitted for routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Correlation id, stable for the task's lifetime
    pub id: TaskId,
    /// Task text shown to workers
    pub text: String,
    /// Who asked for the work
    pub submitter: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Prior conversation, opaque to routing
    pub context: Vec<String>,
}

impl TaskDescriptor {
    pub fn new(text: impl Into<String>, submitter: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            text: text.into(),
            submitter: submitter.into(),
            created_at: Utc::now(),
            context: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }
}

/// A worker's confidence report for one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub confidence: Confidence,
    pub reasoning: Option<String>,
    /// 0 for the initial solicitation, 1..N for negotiation rounds
    pub round: u32,
    pub received_at: DateTime<Utc>,
    /// Channel position of the report, the final tie-breaker
    pub position: MessagePosition,
}

impl EvaluationReport {
    /// Whether this report beats `other` when choosing a winner
    ///
    /// Higher confidence wins; ties go to the earlier report (received time,
    /// then channel position).
    pub fn outranks(&self, other: &Self) -> bool {
        (
            std::cmp::Reverse(self.confidence),
            self.received_at,
            self.position,
        ) < (
            std::cmp::Reverse(other.confidence),
            other.received_at,
            other.position,
        )
    }

    pub fn bid(&self) -> Bid {
        Bid {
            worker: self.worker.clone(),
            confidence: self.confidence,
        }
    }
}

/// Worker and confidence, without the rest of the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub worker: WorkerId,
    pub confidence: Confidence,
}

impl std::fmt::Display for Bid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}%)", self.worker, self.confidence)
    }
}

/// Latest report per worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSet {
    reports: BTreeMap<WorkerId, EvaluationReport>,
}

impl EvaluationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a report; the later of two reports from one worker wins
    ///
    /// Returns true when the report was stored.
    pub fn insert(&mut self, report: EvaluationReport) -> bool {
        match self.reports.get(&report.worker) {
            Some(existing)
                if (existing.round, existing.position) > (report.round, report.position) =>
            {
                false
            }
            _ => {
                self.reports.insert(report.worker.clone(), report);
                true
            }
        }
    }

    /// Overlay a round's responses; workers absent from `responses` keep
    /// their current report
    pub fn merge(&mut self, responses: &EvaluationSet) {
        for report in responses.iter() {
            self.insert(report.clone());
        }
    }

    /// The winning report, if any
    pub fn best(&self) -> Option<&EvaluationReport> {
        self.reports.values().fold(None, |best, report| match best {
            Some(current) if !report.outranks(current) => Some(current),
            _ => Some(report),
        })
    }

    pub fn get(&self, worker: &str) -> Option<&EvaluationReport> {
        self.reports.get(worker)
    }

    pub fn contains(&self, worker: &str) -> bool {
        self.reports.contains_key(worker)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvaluationReport> {
        self.reports.values()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.reports.keys()
    }
}

impl FromIterator<EvaluationReport> for EvaluationSet {
    fn from_iter<I: IntoIterator<Item = EvaluationReport>>(iter: I) -> Self {
        let mut set = Self::new();
        for report in iter {
            set.insert(report);
        }
        set
    }
}

/// Terminal routing decision for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentDecision {
    /// The task belongs to this worker
    Assigned {
        worker: WorkerId,
        confidence: Confidence,
    },
    /// Nobody reached the minimum confidence
    NoConfidentWorker { highest: Option<Bid> },
    /// Routing broke down before a winner could be chosen
    Failed { reason: String },
}

impl AssignmentDecision {
    pub fn assigned_worker(&self) -> Option<&str> {
        match self {
            Self::Assigned { worker, .. } => Some(worker),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssignmentDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned { worker, confidence } => {
                write!(f, "assigned to {} ({}%)", worker, confidence)
            }
            Self::NoConfidentWorker { highest: Some(bid) } => {
                write!(f, "no confident worker (highest: {})", bid)
            }
            Self::NoConfidentWorker { highest: None } => {
                write!(f, "no confident worker (no responses)")
            }
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// What a submitter gets back from routing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    /// A decision was committed to the channel
    Decided(AssignmentDecision),
    /// The caller withdrew the task; nothing was committed
    Cancelled,
}

/// Observable phase of an in-flight task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Collecting,
    Negotiating { round: u32 },
    Committing,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collecting => write!(f, "collecting"),
            Self::Negotiating { round } => write!(f, "negotiating (round {})", round),
            Self::Committing => write!(f, "committing"),
        }
    }
}

/// One negotiation round, kept for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    /// Whether the discussion prompt reached the channel
    pub prompt_posted: bool,
    /// Reports received during this round only
    pub responses: EvaluationSet,
    /// Decision input after merging this round
    pub merged: EvaluationSet,
}

/// Negotiation progress for a single task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationState {
    pub task_id: TaskId,
    /// Last round started (0 before the first round)
    pub round: u32,
    /// Initial evaluations (round 0)
    pub initial: EvaluationSet,
    /// Rounds in order
    pub history: Vec<RoundRecord>,
    pub started_at: DateTime<Utc>,
}

impl NegotiationState {
    pub fn new(task_id: TaskId, initial: EvaluationSet) -> Self {
        Self {
            task_id,
            round: 0,
            initial,
            history: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Current decision input: the last merged set, or the initial one
    pub fn current(&self) -> &EvaluationSet {
        self.history
            .last()
            .map(|r| &r.merged)
            .unwrap_or(&self.initial)
    }

    pub fn rounds_run(&self) -> usize {
        self.history.len()
    }

    /// Every report received, initial round first
    pub fn all_reports(&self) -> impl Iterator<Item = &EvaluationReport> {
        self.initial
            .iter()
            .chain(self.history.iter().flat_map(|r| r.responses.iter()))
    }
}
