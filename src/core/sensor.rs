use serde::{Deserialize, Serialize};

use crate::vector::Direction;

/// Wall occupancy around a cell. `true` means the neighbour is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sensor {
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
}

impl Sensor {
    pub fn is_blocked(&self, direction: Direction) -> bool {
        match direction {
            Direction::Up => self.up,
            Direction::Down => self.down,
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }
}
