// Records printed by the CLI in JSON mode

use serde::{Deserialize, Serialize};

use crate::motor::registers::position_to_degrees;

/// One present-position reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub id: u8,
    pub position: i32,
    pub degrees: f32,
    pub elapsed_ms: u64,
}

impl PositionSample {
    pub fn new(id: u8, position: i32, elapsed_ms: u64) -> Self {
        Self {
            id,
            position,
            degrees: position_to_degrees(position),
            elapsed_ms,
        }
    }
}

/// Outcome of a blocking move
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveReport {
    pub id: u8,
    pub goal: i32,
    pub position: i32,
    pub polls: Option<u64>,
}
