//! Session configuration and the source it is read from at (re)start.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSessionConfig")]
pub struct SessionConfig {
    pub tick_interval_ms: u64,
    pub maze_width: usize,
    pub maze_height: usize,
    pub max_exploration_steps: u32,
    pub max_solving_steps: u32,
    pub max_ended_steps: u32,
    /// Pings without an accepted move before an agent is kicked. 0 disables.
    pub max_idle_ticks: u32,
    /// Frames buffered per agent before it counts as stalled.
    pub outbound_queue: usize,
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            maze_width: 10,
            maze_height: 10,
            max_exploration_steps: 100,
            max_solving_steps: 50,
            max_ended_steps: 1,
            max_idle_ticks: 10,
            outbound_queue: 8,
            seed: None,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn set_maze_size(&mut self, size: usize) {
        self.maze_width = size;
        self.maze_height = size;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 || self.tick_interval_ms > 60_000 {
            return Err(ConfigError::Invalid(format!(
                "tick_interval_ms must be within 1..=60000, got {}",
                self.tick_interval_ms
            )));
        }
        for (name, v) in [("maze_width", self.maze_width), ("maze_height", self.maze_height)] {
            if !(5..=1_000).contains(&v) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 5..=1000, got {v}"
                )));
            }
        }
        if self.max_exploration_steps == 0 || self.max_solving_steps == 0 {
            return Err(ConfigError::Invalid(
                "exploration and solving step budgets must be positive".to_string(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// Accepts `maze_size` as shorthand for a square maze; explicit width/height win.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RawSessionConfig {
    tick_interval_ms: Option<u64>,
    maze_size: Option<usize>,
    maze_width: Option<usize>,
    maze_height: Option<usize>,
    max_exploration_steps: Option<u32>,
    max_solving_steps: Option<u32>,
    max_ended_steps: Option<u32>,
    max_idle_ticks: Option<u32>,
    outbound_queue: Option<usize>,
    seed: Option<u64>,
}

impl From<RawSessionConfig> for SessionConfig {
    fn from(raw: RawSessionConfig) -> Self {
        let d = SessionConfig::default();
        let square = raw.maze_size;
        Self {
            tick_interval_ms: raw.tick_interval_ms.unwrap_or(d.tick_interval_ms),
            maze_width: raw.maze_width.or(square).unwrap_or(d.maze_width),
            maze_height: raw.maze_height.or(square).unwrap_or(d.maze_height),
            max_exploration_steps: raw.max_exploration_steps.unwrap_or(d.max_exploration_steps),
            max_solving_steps: raw.max_solving_steps.unwrap_or(d.max_solving_steps),
            max_ended_steps: raw.max_ended_steps.unwrap_or(d.max_ended_steps),
            max_idle_ticks: raw.max_idle_ticks.unwrap_or(d.max_idle_ticks),
            outbound_queue: raw.outbound_queue.unwrap_or(d.outbound_queue),
            seed: raw.seed,
        }
    }
}

/// Where the coordinator reads its configuration from. Consulted at session
/// start and on every restart, never mid-session.
pub trait ConfigSource: Send + Sync {
    fn session_config(&self) -> SessionConfig;
}

impl ConfigSource for SessionConfig {
    fn session_config(&self) -> SessionConfig {
        self.clone()
    }
}
