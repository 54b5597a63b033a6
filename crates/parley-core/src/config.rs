//! Configuration management for Parley
//!
//! This module provides the routing thresholds, protocol timing, retry budget
//! and channel settings consumed by the router. Values are loaded from
//! `.parley/config.toml` when present and fall back to defaults otherwise.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::Confidence;
use crate::{ParleyError, Result};

/// Repository-level Parley configuration
///
/// Loaded from `.parley/config.toml` in the project root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParleyConfig {
    /// Known workers; collection ends early once all of them have reported
    #[serde(default)]
    pub workers: Vec<String>,

    /// Thresholds and timing of the bidding protocol
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Backoff and commit retry budget
    #[serde(default)]
    pub retry: RetryConfig,

    /// Shared channel settings
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Bidding protocol parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Scores below this never win a task
    #[serde(default = "default_min_confidence")]
    pub min_confidence: u8,

    /// Scores at or above this win without negotiation
    #[serde(default = "default_discussion_threshold")]
    pub discussion_threshold: u8,

    /// Maximum negotiation rounds
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Collection window for the initial solicitation
    #[serde(default = "default_initial_timeout_ms")]
    pub initial_timeout_ms: u64,

    /// Collection window for each negotiation round
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// Delay between channel reads
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause after a discussion prompt before polling starts
    #[serde(default = "default_round_pause_ms")]
    pub round_pause_ms: u64,

    /// Also negotiate when every initial bid is below `min_confidence`
    #[serde(default = "default_negotiate_below_minimum")]
    pub negotiate_below_minimum: bool,
}

/// Retry budget for channel operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff delays never exceed this
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts to post an assignment decision before giving up
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,
}

/// Shared channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel used for solicitation, evaluation and assignment messages
    #[serde(default = "default_channel_name")]
    pub name: String,

    /// Identity the coordinator posts under
    #[serde(default = "default_coordinator_identity")]
    pub coordinator: String,
}

/// The two confidence cut-offs used by the decision engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub min_confidence: Confidence,
    pub discussion_threshold: Confidence,
}

impl Thresholds {
    pub fn new(min_confidence: u8, discussion_threshold: u8) -> Self {
        Self {
            min_confidence: Confidence::saturating(min_confidence as i64),
            discussion_threshold: Confidence::saturating(discussion_threshold as i64),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(default_min_confidence(), default_discussion_threshold())
    }
}

// Default value providers
fn default_min_confidence() -> u8 {
    30
}

fn default_discussion_threshold() -> u8 {
    50
}

fn default_max_rounds() -> u32 {
    3
}

fn default_initial_timeout_ms() -> u64 {
    8_000
}

fn default_round_timeout_ms() -> u64 {
    4_000
}

fn default_poll_interval_ms() -> u64 {
    300
}

fn default_round_pause_ms() -> u64 {
    1_000
}

fn default_negotiate_below_minimum() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_commit_attempts() -> u32 {
    3
}

fn default_channel_name() -> String {
    "coordination".to_string()
}

fn default_coordinator_identity() -> String {
    "coordinator".to_string()
}

impl ParleyConfig {
    /// Load configuration from `.parley/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".parley/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ParleyError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.parley/config.toml`
    pub fn write_default(root: &Path) -> Result<std::path::PathBuf> {
        let config_dir = root.join(".parley");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        std::fs::write(&config_path, Self::default().to_toml()?)?;
        Ok(config_path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ParleyError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject settings that would make routing meaningless
    pub fn validate(&self) -> Result<()> {
        let r = &self.routing;
        if r.discussion_threshold > Confidence::MAX {
            return Err(ParleyError::Config(format!(
                "discussion_threshold {} exceeds {}",
                r.discussion_threshold,
                Confidence::MAX
            )));
        }
        if r.min_confidence > r.discussion_threshold {
            return Err(ParleyError::Config(format!(
                "min_confidence {} is above discussion_threshold {}",
                r.min_confidence, r.discussion_threshold
            )));
        }
        if r.initial_timeout_ms == 0 || r.round_timeout_ms == 0 {
            return Err(ParleyError::Config("timeouts must be non-zero".to_string()));
        }
        if r.poll_interval_ms == 0 {
            return Err(ParleyError::Config("poll_interval_ms must be non-zero".to_string()));
        }
        if self.retry.commit_attempts == 0 {
            return Err(ParleyError::Config("commit_attempts must be at least 1".to_string()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ParleyError::Config(format!(
                "initial_backoff_ms {} is above max_backoff_ms {}",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.channel.name.trim().is_empty() {
            return Err(ParleyError::Config("channel name is empty".to_string()));
        }
        Ok(())
    }
}

impl RoutingConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.min_confidence, self.discussion_threshold)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn round_pause(&self) -> Duration {
        Duration::from_millis(self.round_pause_ms)
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            discussion_threshold: default_discussion_threshold(),
            max_rounds: default_max_rounds(),
            initial_timeout_ms: default_initial_timeout_ms(),
            round_timeout_ms: default_round_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            round_pause_ms: default_round_pause_ms(),
            negotiate_below_minimum: default_negotiate_below_minimum(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            commit_attempts: default_commit_attempts(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: default_channel_name(),
            coordinator: default_coordinator_identity(),
        }
    }
}
