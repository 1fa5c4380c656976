#[path = "core/vector.rs"]
pub mod vector;

#[path = "core/sensor.rs"]
pub mod sensor;

#[path = "core/maze.rs"]
pub mod maze;

pub mod config;
pub mod lobby;
pub mod octapod;
pub mod phase;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod validation;

pub use config::{ConfigError, ConfigSource, SessionConfig};
pub use lobby::{Lobby, LobbyHandle, TickOutcome};
pub use maze::Maze;
pub use octapod::{MoveVerdict, Octapod, PingError};
pub use phase::{Phase, PhaseClock, StepLimits};
pub use protocol::{AgentStatus, ErrorMessage, JoinRequest, MoveMessage, PingMessage};
pub use registry::{JoinError, OctapodRegistry, PingSummary, Rejected};
pub use sensor::Sensor;
pub use status::{FanoutSink, LogSink, StatusBoard, StatusSink};
pub use validation::{CharsetValidator, DenyListValidator, IdValidator};
pub use vector::{Direction, Vector};
