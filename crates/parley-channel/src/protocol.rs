//! Parley wire protocol
//!
//! Every routing message is plain text so it can travel over any chat-like
//! channel. The grammar is strict and versioned:
//!
//! ```text
//! message = header LF *(field LF) [LF body]
//! header  = "parley/1 " kind        ; solicit | discuss | evaluate | assign
//! field   = key ": " value          ; value is a single line
//! ```
//!
//! Text that does not start with `parley/` is ordinary chat and decodes to
//! [`ProtocolError::NotProtocol`]. Anything else that breaks the grammar is
//! malformed and must be skipped by readers, never treated as fatal.

use parley_core::{
    is_token, AssignmentDecision, Bid, Confidence, ParleyError, TaskId, WorkerId,
};
use thiserror::Error;

/// Protocol marker every message starts with
pub const PREFIX: &str = "parley/";

/// Current protocol version
pub const VERSION: u32 = 1;

/// Field keys
pub mod fields {
    pub const TASK_ID: &str = "Task-Id";
    pub const SUBMITTER: &str = "Submitter";
    pub const ROUND: &str = "Round";
    pub const WORKER: &str = "Worker";
    pub const CONFIDENCE: &str = "Confidence";
    pub const PEER: &str = "Peer";
    pub const OUTCOME: &str = "Outcome";
    pub const HIGHEST: &str = "Highest";
    pub const REASON: &str = "Reason";
}

/// Outcome values carried by assignment messages
pub mod outcomes {
    pub const ASSIGNED: &str = "assigned";
    pub const NO_CONFIDENT_WORKER: &str = "no-confident-worker";
    pub const FAILED: &str = "failed";
}

/// Errors produced while encoding or decoding messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("not a parley message")]
    NotProtocol,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("malformed line: {0:?}")]
    MalformedLine(String),

    #[error("unknown field {field} in {kind} message")]
    UnknownField { kind: &'static str, field: String },

    #[error("duplicate field: {0}")]
    DuplicateField(&'static str),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("cannot encode {field}: {value:?} is not a single token")]
    Unencodable { field: &'static str, value: String },
}

impl From<ProtocolError> for ParleyError {
    fn from(e: ProtocolError) -> Self {
        ParleyError::MalformedMessage(e.to_string())
    }
}

/// Request for initial evaluations; always round 0 on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solicitation {
    pub task_id: TaskId,
    pub submitter: String,
    pub text: String,
}

/// A peer's current position, as shown in a discussion prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvaluation {
    pub worker: WorkerId,
    pub confidence: Confidence,
    pub reasoning: Option<String>,
}

/// Negotiation prompt re-soliciting evaluations with peer context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discussion {
    pub task_id: TaskId,
    pub round: u32,
    pub text: String,
    pub peers: Vec<PeerEvaluation>,
}

/// A worker's confidence report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub round: u32,
    pub confidence: Confidence,
    pub reasoning: Option<String>,
}

/// The committed decision for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub decision: AssignmentDecision,
}

/// Any Parley message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Solicit(Solicitation),
    Discuss(Discussion),
    Evaluate(Evaluation),
    Assign(Assignment),
}

impl Envelope {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Solicit(m) => &m.task_id,
            Self::Discuss(m) => &m.task_id,
            Self::Evaluate(m) => &m.task_id,
            Self::Assign(m) => &m.task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Solicit(_) => kinds::SOLICIT,
            Self::Discuss(_) => kinds::DISCUSS,
            Self::Evaluate(_) => kinds::EVALUATE,
            Self::Assign(_) => kinds::ASSIGN,
        }
    }
}

mod kinds {
    pub const SOLICIT: &str = "solicit";
    pub const DISCUSS: &str = "discuss";
    pub const EVALUATE: &str = "evaluate";
    pub const ASSIGN: &str = "assign";
}

/// Encode a message as channel text
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let mut out = Writer::new(envelope.kind());
    out.token(fields::TASK_ID, envelope.task_id().as_str())?;

    match envelope {
        Envelope::Solicit(m) => {
            out.field(fields::ROUND, "0");
            out.field(fields::SUBMITTER, &m.submitter);
            out.body(Some(&m.text));
        }
        Envelope::Discuss(m) => {
            out.field(fields::ROUND, &m.round.to_string());
            for peer in &m.peers {
                check_token(fields::PEER, &peer.worker)?;
                let value = match &peer.reasoning {
                    Some(reasoning) => {
                        format!("{} {} {}", peer.worker, peer.confidence, reasoning)
                    }
                    None => format!("{} {}", peer.worker, peer.confidence),
                };
                out.field(fields::PEER, &value);
            }
            out.body(Some(&m.text));
        }
        Envelope::Evaluate(m) => {
            out.token(fields::WORKER, &m.worker)?;
            out.field(fields::ROUND, &m.round.to_string());
            out.field(fields::CONFIDENCE, &m.confidence.to_string());
            out.body(m.reasoning.as_deref());
        }
        Envelope::Assign(m) => match &m.decision {
            AssignmentDecision::Assigned { worker, confidence } => {
                out.field(fields::OUTCOME, outcomes::ASSIGNED);
                out.token(fields::WORKER, worker)?;
                out.field(fields::CONFIDENCE, &confidence.to_string());
            }
            AssignmentDecision::NoConfidentWorker { highest } => {
                out.field(fields::OUTCOME, outcomes::NO_CONFIDENT_WORKER);
                if let Some(bid) = highest {
                    check_token(fields::HIGHEST, &bid.worker)?;
                    out.field(fields::HIGHEST, &format!("{} {}", bid.worker, bid.confidence));
                }
            }
            AssignmentDecision::Failed { reason } => {
                out.field(fields::OUTCOME, outcomes::FAILED);
                out.field(fields::REASON, reason);
            }
        },
    }

    Ok(out.finish())
}

/// Decode channel text into a message
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let raw = RawMessage::parse(text)?;
    match raw.kind {
        kinds::SOLICIT => {
            raw.allow(&[fields::TASK_ID, fields::ROUND, fields::SUBMITTER])?;
            if raw.round()? != 0 {
                return Err(ProtocolError::InvalidField {
                    field: fields::ROUND,
                    value: raw.require(fields::ROUND)?.to_string(),
                });
            }
            Ok(Envelope::Solicit(Solicitation {
                task_id: raw.task_id()?,
                submitter: raw.require(fields::SUBMITTER)?.to_string(),
                text: raw.body.clone().unwrap_or_default(),
            }))
        }
        kinds::DISCUSS => {
            raw.allow(&[fields::TASK_ID, fields::ROUND, fields::PEER])?;
            let peers = raw
                .all(fields::PEER)
                .map(parse_peer)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Envelope::Discuss(Discussion {
                task_id: raw.task_id()?,
                round: raw.round()?,
                text: raw.body.clone().unwrap_or_default(),
                peers,
            }))
        }
        kinds::EVALUATE => {
            raw.allow(&[
                fields::TASK_ID,
                fields::WORKER,
                fields::ROUND,
                fields::CONFIDENCE,
            ])?;
            Ok(Envelope::Evaluate(Evaluation {
                task_id: raw.task_id()?,
                worker: parse_token(fields::WORKER, raw.require(fields::WORKER)?)?,
                round: raw.round()?,
                confidence: parse_confidence(fields::CONFIDENCE, raw.require(fields::CONFIDENCE)?)?,
                reasoning: raw.body.clone().filter(|b| !b.trim().is_empty()),
            }))
        }
        kinds::ASSIGN => {
            raw.allow(&[
                fields::TASK_ID,
                fields::OUTCOME,
                fields::WORKER,
                fields::CONFIDENCE,
                fields::HIGHEST,
                fields::REASON,
            ])?;
            let decision = match raw.require(fields::OUTCOME)? {
                outcomes::ASSIGNED => AssignmentDecision::Assigned {
                    worker: parse_token(fields::WORKER, raw.require(fields::WORKER)?)?,
                    confidence: parse_confidence(
                        fields::CONFIDENCE,
                        raw.require(fields::CONFIDENCE)?,
                    )?,
                },
                outcomes::NO_CONFIDENT_WORKER => AssignmentDecision::NoConfidentWorker {
                    highest: raw.one(fields::HIGHEST)?.map(parse_bid).transpose()?,
                },
                outcomes::FAILED => AssignmentDecision::Failed {
                    reason: raw.require(fields::REASON)?.to_string(),
                },
                other => {
                    return Err(ProtocolError::InvalidField {
                        field: fields::OUTCOME,
                        value: other.to_string(),
                    })
                }
            };
            Ok(Envelope::Assign(Assignment {
                task_id: raw.task_id()?,
                decision,
            }))
        }
        other => Err(ProtocolError::UnknownKind(other.to_string())),
    }
}

struct Writer {
    out: String,
}

impl Writer {
    fn new(kind: &str) -> Self {
        Self {
            out: format!("{}{} {}\n", PREFIX, VERSION, kind),
        }
    }

    /// Field values are single-line; embedded line breaks become spaces
    fn field(&mut self, key: &str, value: &str) {
        let value: String = value
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        self.out.push_str(key);
        self.out.push_str(": ");
        self.out.push_str(value.trim());
        self.out.push('\n');
    }

    fn token(&mut self, key: &'static str, value: &str) -> Result<(), ProtocolError> {
        check_token(key, value)?;
        self.field(key, value);
        Ok(())
    }

    fn body(&mut self, body: Option<&str>) {
        if let Some(body) = body.filter(|b| !b.is_empty()) {
            self.out.push('\n');
            self.out.push_str(body);
            self.out.push('\n');
        }
    }

    fn finish(self) -> String {
        self.out
    }
}

struct RawMessage<'a> {
    kind: &'a str,
    fields: Vec<(&'a str, &'a str)>,
    body: Option<String>,
}

impl<'a> RawMessage<'a> {
    fn parse(text: &'a str) -> Result<Self, ProtocolError> {
        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        let header = lines.next().unwrap_or_default();
        let rest = header.strip_prefix(PREFIX).ok_or(ProtocolError::NotProtocol)?;
        let (version, kind) = rest
            .split_once(' ')
            .ok_or_else(|| ProtocolError::MalformedLine(header.to_string()))?;
        if version != VERSION.to_string() {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()));
        }
        let kind = match kind.trim() {
            kinds::SOLICIT => kinds::SOLICIT,
            kinds::DISCUSS => kinds::DISCUSS,
            kinds::EVALUATE => kinds::EVALUATE,
            kinds::ASSIGN => kinds::ASSIGN,
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };

        let mut fields = Vec::new();
        let mut body_lines: Option<Vec<&str>> = None;
        for line in lines {
            if let Some(body) = body_lines.as_mut() {
                body.push(line);
                continue;
            }
            if line.is_empty() {
                body_lines = Some(Vec::new());
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| ProtocolError::MalformedLine(line.to_string()))?;
            fields.push((key, value.trim()));
        }

        let body = body_lines
            .map(|lines| lines.join("\n").trim_end_matches('\n').to_string())
            .filter(|b| !b.is_empty());

        Ok(Self { kind, fields, body })
    }

    fn allow(&self, allowed: &[&str]) -> Result<(), ProtocolError> {
        match self.fields.iter().find(|(key, _)| !allowed.contains(key)) {
            Some((key, _)) => Err(ProtocolError::UnknownField {
                kind: self.kind_name(),
                field: key.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            kinds::SOLICIT => kinds::SOLICIT,
            kinds::DISCUSS => kinds::DISCUSS,
            kinds::EVALUATE => kinds::EVALUATE,
            _ => kinds::ASSIGN,
        }
    }

    fn all(&self, key: &'static str) -> impl Iterator<Item = &'a str> + '_ {
        self.fields
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    /// A field that may appear at most once
    fn one(&self, key: &'static str) -> Result<Option<&'a str>, ProtocolError> {
        let mut values = self.all(key);
        let first = values.next();
        if values.next().is_some() {
            return Err(ProtocolError::DuplicateField(key));
        }
        Ok(first)
    }

    fn require(&self, key: &'static str) -> Result<&'a str, ProtocolError> {
        self.one(key)?.ok_or(ProtocolError::MissingField(key))
    }

    fn task_id(&self) -> Result<TaskId, ProtocolError> {
        let value = self.require(fields::TASK_ID)?;
        value.parse().map_err(|_| ProtocolError::InvalidField {
            field: fields::TASK_ID,
            value: value.to_string(),
        })
    }

    fn round(&self) -> Result<u32, ProtocolError> {
        let value = self.require(fields::ROUND)?;
        value.parse().map_err(|_| ProtocolError::InvalidField {
            field: fields::ROUND,
            value: value.to_string(),
        })
    }
}

fn check_token(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if is_token(value) {
        Ok(())
    } else {
        Err(ProtocolError::Unencodable {
            field,
            value: value.to_string(),
        })
    }
}

fn parse_token(field: &'static str, value: &str) -> Result<String, ProtocolError> {
    if is_token(value) {
        Ok(value.to_string())
    } else {
        Err(ProtocolError::InvalidField {
            field,
            value: value.to_string(),
        })
    }
}

/// Confidence on the wire is a bare integer 0..=100
fn parse_confidence(field: &'static str, value: &str) -> Result<Confidence, ProtocolError> {
    let invalid = || ProtocolError::InvalidField {
        field,
        value: value.to_string(),
    };
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let parsed: u32 = value.parse().map_err(|_| invalid())?;
    Confidence::try_from(parsed).map_err(|_| invalid())
}

fn parse_peer(value: &str) -> Result<PeerEvaluation, ProtocolError> {
    let mut parts = value.splitn(3, ' ');
    let worker = parts.next().unwrap_or_default();
    let confidence = parts.next().ok_or_else(|| ProtocolError::InvalidField {
        field: fields::PEER,
        value: value.to_string(),
    })?;
    let reasoning = parts
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    Ok(PeerEvaluation {
        worker: parse_token(fields::PEER, worker)?,
        confidence: parse_confidence(fields::PEER, confidence)?,
        reasoning,
    })
}

fn parse_bid(value: &str) -> Result<Bid, ProtocolError> {
    let (worker, confidence) = value
        .split_once(' ')
        .ok_or_else(|| ProtocolError::InvalidField {
            field: fields::HIGHEST,
            value: value.to_string(),
        })?;
    Ok(Bid {
        worker: parse_token(fields::HIGHEST, worker)?,
        confidence: parse_confidence(fields::HIGHEST, confidence)?,
    })
}
