//! # parley-core
//!
//! Core types for the Parley task router.
//!
//! Parley routes a task to exactly one worker agent by letting workers bid
//! on it over a shared, append-only channel. The coordinator never controls
//! workers directly: it posts a solicitation, reads back confidence reports,
//! negotiates for a bounded number of rounds when the bids are weak, and
//! finally posts a single assignment decision.
//!
//! ## Core Paradigm
//!
//! - Every message on the channel is scoped by a task correlation id
//! - Reports are append-only; a later round supersedes, never erases
//! - Silence is not a withdrawal
//! - Exactly one decision is committed per task

mod error;
pub mod config;
pub mod fail_open;
mod types;

pub use config::{ChannelConfig, ParleyConfig, RetryConfig, RoutingConfig, Thresholds};
pub use error::{ParleyError, Result};
pub use types::*;
