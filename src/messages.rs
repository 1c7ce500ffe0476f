// Define message types for the runtime

use serde::{Deserialize, Serialize};

// Command from teleop/scripts -> runtime, published on roboclaw/<name>/cmd
// Tagged by "op", e.g. {"op": "go_for", "rpm": 60, "revolutions": 2}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MotorCommand {
    SetPower { power_pct: f64 },
    SetRpm { rpm: f64 },
    GoFor { rpm: f64, revolutions: f64 },
    GoTo { rpm: f64, position_revolutions: f64 },
    ResetZeroPosition { offset: f64 },
    Stop,
}

impl MotorCommand {
    /// Name of the operation, for logs
    pub fn op(&self) -> &'static str {
        match self {
            MotorCommand::SetPower { .. } => "set_power",
            MotorCommand::SetRpm { .. } => "set_rpm",
            MotorCommand::GoFor { .. } => "go_for",
            MotorCommand::GoTo { .. } => "go_to",
            MotorCommand::ResetZeroPosition { .. } => "reset_zero_position",
            MotorCommand::Stop => "stop",
        }
    }
}

/// Health of a motor's link to its controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MotorHealth {
    Ok,
    BusError,
}

// State from runtime -> subscribers, published on roboclaw/<name>/state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotorState {
    pub name: String,
    pub health: MotorHealth,
    pub is_powered: bool,
    pub power_pct: f64,
    /// Revolutions; 0 without an encoder
    pub position: f64,
    pub is_moving: bool,
    pub position_reporting: bool,
}

impl MotorState {
    /// State to publish when the controller could not be read
    pub fn faulted(name: &str, position_reporting: bool) -> Self {
        Self {
            name: name.to_string(),
            health: MotorHealth::BusError,
            is_powered: false,
            power_pct: 0.0,
            position: 0.0,
            is_moving: false,
            position_reporting,
        }
    }
}
