// Motor control module for RoboClaw dual-channel DC motor controllers
//
// Provides:
// - RoboClaw packet serial protocol implementation
// - Simulated controller for running without hardware
// - Shared serial lines (several motors per device)
// - High-level motor driver API

mod driver;
pub mod ports;
pub mod roboclaw;
pub mod sim;
pub mod speed;

pub use driver::{MotorError, Properties, RoboclawMotor};
pub use ports::{BusRegistry, SharedBus};
pub use roboclaw::{Channel, RoboclawBus, RoboclawError, DEFAULT_ADDRESS, DEFAULT_BAUDRATE};
pub use sim::SimulatedRoboclaw;
