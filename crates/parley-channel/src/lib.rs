//! # parley-channel
//!
//! The shared channel and its wire protocol.
//!
//! This crate provides:
//! - [`ChannelAdapter`], the only transport operations routing depends on
//!   (`post` and `read_since`)
//! - An in-memory board usable by many participants at once
//! - A fault-injecting wrapper for exercising retry paths
//! - The strict, versioned text encoding of every Parley message

mod adapter;
mod flaky;
mod memory;
pub mod protocol;

pub use adapter::{ChannelAdapter, ChannelMessage, MessageHandle};
pub use flaky::{FailureMode, FlakyChannel};
pub use memory::{InMemoryBoard, InMemoryChannel};
pub use protocol::{
    decode, encode, Assignment, Discussion, Envelope, Evaluation, PeerEvaluation, ProtocolError,
    Solicitation,
};
