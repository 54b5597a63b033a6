//! Fault-injecting channel wrapper for exercising retry paths

use async_trait::async_trait;
use parley_core::{MessagePosition, ParleyError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::adapter::{ChannelAdapter, ChannelMessage, MessageHandle};

/// How an injected failure behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Throttling or a network blip; worth retrying
    Transient,
    /// A failure retrying will not fix
    Permanent,
    /// The post reaches the channel but the caller gets a transient error
    Unacknowledged,
}

#[derive(Debug)]
struct Rule {
    pattern: Option<String>,
    /// None = never expires
    remaining: Option<u32>,
    mode: FailureMode,
}

impl Rule {
    fn matches(&self, text: Option<&str>) -> bool {
        match (&self.pattern, text) {
            (None, _) => true,
            (Some(pattern), Some(text)) => text.contains(pattern.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// Wraps any adapter and fails selected operations on demand
pub struct FlakyChannel<C: ChannelAdapter> {
    inner: C,
    read_rules: Mutex<Vec<Rule>>,
    post_rules: Mutex<Vec<Rule>>,
    read_attempts: AtomicU32,
    post_attempts: AtomicU32,
}

impl<C: ChannelAdapter> FlakyChannel<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            read_rules: Mutex::new(Vec::new()),
            post_rules: Mutex::new(Vec::new()),
            read_attempts: AtomicU32::new(0),
            post_attempts: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` reads
    pub fn fail_reads(self, count: u32, mode: FailureMode) -> Self {
        self.push_read_rule(None, Some(count), mode);
        self
    }

    /// Fail every read
    pub fn fail_all_reads(self, mode: FailureMode) -> Self {
        self.push_read_rule(None, None, mode);
        self
    }

    /// Fail the next `count` posts
    pub fn fail_posts(self, count: u32, mode: FailureMode) -> Self {
        self.push_post_rule(None, Some(count), mode);
        self
    }

    /// Fail the next `count` posts whose text contains `pattern`
    pub fn fail_posts_containing(self, pattern: &str, count: u32, mode: FailureMode) -> Self {
        self.push_post_rule(Some(pattern.to_string()), Some(count), mode);
        self
    }

    /// Fail every post whose text contains `pattern`
    pub fn fail_all_posts_containing(self, pattern: &str, mode: FailureMode) -> Self {
        self.push_post_rule(Some(pattern.to_string()), None, mode);
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn read_attempts(&self) -> u32 {
        self.read_attempts.load(Ordering::Relaxed)
    }

    pub fn post_attempts(&self) -> u32 {
        self.post_attempts.load(Ordering::Relaxed)
    }

    fn push_read_rule(&self, pattern: Option<String>, remaining: Option<u32>, mode: FailureMode) {
        if let Ok(mut rules) = self.read_rules.lock() {
            rules.push(Rule {
                pattern,
                remaining,
                mode,
            });
        }
    }

    fn push_post_rule(&self, pattern: Option<String>, remaining: Option<u32>, mode: FailureMode) {
        if let Ok(mut rules) = self.post_rules.lock() {
            rules.push(Rule {
                pattern,
                remaining,
                mode,
            });
        }
    }

    /// Consume the first matching rule, if any
    fn take_failure(rules: &Mutex<Vec<Rule>>, text: Option<&str>) -> Option<FailureMode> {
        let mut rules = rules.lock().ok()?;
        let index = rules.iter().position(|rule| rule.matches(text))?;
        let mode = rules[index].mode;
        let expired = match rules[index].remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if expired {
            rules.remove(index);
        }
        Some(mode)
    }
}

#[async_trait]
impl<C: ChannelAdapter> ChannelAdapter for FlakyChannel<C> {
    fn identity(&self) -> &str {
        self.inner.identity()
    }

    async fn post(&self, channel: &str, text: &str) -> Result<MessageHandle> {
        self.post_attempts.fetch_add(1, Ordering::Relaxed);
        match Self::take_failure(&self.post_rules, Some(text)) {
            None => self.inner.post(channel, text).await,
            Some(FailureMode::Transient) => Err(ParleyError::TransientChannel(
                "injected: ratelimited".to_string(),
            )),
            Some(FailureMode::Permanent) => Err(ParleyError::Channel(
                "injected: channel_not_found".to_string(),
            )),
            Some(FailureMode::Unacknowledged) => {
                self.inner.post(channel, text).await?;
                Err(ParleyError::TransientChannel(
                    "injected: acknowledgement lost".to_string(),
                ))
            }
        }
    }

    async fn read_since(
        &self,
        channel: &str,
        position: MessagePosition,
    ) -> Result<Vec<ChannelMessage>> {
        self.read_attempts.fetch_add(1, Ordering::Relaxed);
        match Self::take_failure(&self.read_rules, None) {
            None => self.inner.read_since(channel, position).await,
            Some(FailureMode::Permanent) => Err(ParleyError::Channel(
                "injected: missing_scope".to_string(),
            )),
            Some(_) => Err(ParleyError::TransientChannel(
                "injected: ratelimited".to_string(),
            )),
        }
    }
}
