//! Wire messages exchanged with agents, one JSON object per frame.

use serde::{Deserialize, Serialize};

use crate::sensor::Sensor;
use crate::vector::{Direction, Vector};

/// What an agent is being asked to do in the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Explore,
    Solve,
    Solved,
}

/// Session → agent, once per tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub tick_id: String,
    pub sensor: Sensor,
    pub position: Vector,
    pub status: AgentStatus,
}

/// Agent → session. Any `moveDirection` outside the four directions fails
/// to decode and the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveMessage {
    pub tick_id: String,
    pub move_direction: Direction,
}

/// Join-time rejection, sent once before the connection closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

/// First line on the raw line transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
}
