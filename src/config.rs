// Timeouts, topics, and the JSON component configuration
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::motor::{Channel, DEFAULT_ADDRESS, DEFAULT_BAUDRATE};

// Runtime loop frequency (state publishing)
pub const LOOP_HZ: u64 = 10;

// Zenoh topics: <prefix>/<component name>/{cmd,state}
pub const TOPIC_PREFIX: &str = "roboclaw";
pub const TOPIC_CMD_ALL: &str = "roboclaw/*/cmd"; // commands for every motor

// Serial link
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);
pub const SERIAL_RETRIES: usize = 3;

// How often a running move checks whether it has finished
pub const MOVE_POLL_INTERVAL: Duration = Duration::from_millis(20);

// Slack on top of twice the expected time before an encoder move is abandoned
pub const MOVE_TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

// Component identity handled by this runtime
pub const MODEL: &str = "roboclaw";
pub const COMPONENT_TYPE: &str = "motor";
pub const DEFAULT_NAMESPACE: &str = "rdk";

/// Baud rates the controller can be set to
pub const VALID_BAUD_RATES: [u32; 8] = [460_800, 230_400, 115_200, 57_600, 38_400, 19_200, 9_600, 2_400];

/// Packet serial addresses a controller can be set to
pub const ADDRESS_RANGE: std::ops::RangeInclusive<i64> = 128..=135;

pub fn command_topic(name: &str) -> String {
    format!("{}/{}/cmd", TOPIC_PREFIX, name)
}

pub fn state_topic(name: &str) -> String {
    format!("{}/{}/state", TOPIC_PREFIX, name)
}

/// Errors found while loading or validating a config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{name}: missing required field: 'serial_path'")]
    MissingSerialPath { name: String },

    #[error("{name}: roboclaw motor channel has to be 1 or 2, but is {channel}")]
    InvalidChannel { name: String, channel: i64 },

    #[error("{name}: serial address must be between 128 and 135, but is {address}")]
    InvalidAddress { name: String, address: i64 },

    #[error("{name}: ticks per rotation must be between 0 and 4294967295, but is {ticks}")]
    InvalidTicks { name: String, ticks: i64 },

    #[error("{name}: invalid roboclaw attributes: {source}")]
    InvalidAttributes {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "{name}: baud rate {baud} invalid, must be one of 460800, 230400, 115200, 57600, 38400, 19200, 9600, 2400"
    )]
    InvalidBaudRate { name: String, baud: u32 },

    #[error("{name}: a roboclaw component must have type 'motor', not '{kind}'")]
    WrongType { name: String, kind: String },

    #[error("duplicate component name '{name}'")]
    DuplicateName { name: String },

    #[error(
        "{second}: baud rate {second_baud} on {path} conflicts with {first} ({first_baud}); \
         all motors on one serial line must use the same baud rate"
    )]
    BaudRateMismatch {
        path: String,
        first: String,
        first_baud: u32,
        second: String,
        second_baud: u32,
    },

    #[error("{second}: channel {channel} of controller {address} on {path} is already used by {first}")]
    ChannelInUse {
        path: String,
        address: u8,
        channel: Channel,
        first: String,
        second: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level config document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

/// One entry of the `components` array
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub model: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Raw `attributes` of a roboclaw motor, as written by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoboclawAttributes {
    #[serde(default)]
    pub serial_path: String,
    #[serde(default = "default_baud_rate")]
    pub serial_baud_rate: u32,
    #[serde(default)]
    pub motor_channel: i64,
    #[serde(default = "default_address")]
    pub address: i64,
    #[serde(default)]
    pub ticks_per_rotation: i64,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_address() -> i64 {
    DEFAULT_ADDRESS as i64
}

/// A validated roboclaw motor, ready to be built
#[derive(Debug, Clone, PartialEq)]
pub struct MotorConfig {
    pub name: String,
    pub serial_path: String,
    pub baud_rate: u32,
    pub channel: Channel,
    pub address: u8,
    /// 0 when no encoder is wired
    pub ticks_per_rotation: u32,
}

impl RoboclawAttributes {
    /// Check the attributes of one component and resolve defaults
    pub fn validate(&self, name: &str) -> Result<MotorConfig> {
        let channel = Channel::from_number(self.motor_channel).ok_or_else(|| {
            ConfigError::InvalidChannel {
                name: name.to_string(),
                channel: self.motor_channel,
            }
        })?;

        if self.serial_path.is_empty() {
            return Err(ConfigError::MissingSerialPath {
                name: name.to_string(),
            });
        }

        // 0 means unset
        let address = if self.address == 0 {
            DEFAULT_ADDRESS as i64
        } else {
            self.address
        };
        if !ADDRESS_RANGE.contains(&address) {
            return Err(ConfigError::InvalidAddress {
                name: name.to_string(),
                address,
            });
        }

        let Ok(ticks_per_rotation) = u32::try_from(self.ticks_per_rotation) else {
            return Err(ConfigError::InvalidTicks {
                name: name.to_string(),
                ticks: self.ticks_per_rotation,
            });
        };

        if !VALID_BAUD_RATES.contains(&self.serial_baud_rate) {
            return Err(ConfigError::InvalidBaudRate {
                name: name.to_string(),
                baud: self.serial_baud_rate,
            });
        }

        Ok(MotorConfig {
            name: name.to_string(),
            serial_path: self.serial_path.clone(),
            baud_rate: self.serial_baud_rate,
            channel,
            address: address as u8,
            ticks_per_rotation,
        })
    }
}

impl ComponentConfig {
    pub fn is_roboclaw(&self) -> bool {
        self.model == MODEL || self.model.ends_with(&format!(":{}", MODEL))
    }

    /// Parse and validate this component as a roboclaw motor
    pub fn roboclaw_motor(&self) -> Result<MotorConfig> {
        if self.kind != COMPONENT_TYPE {
            return Err(ConfigError::WrongType {
                name: self.name.clone(),
                kind: self.kind.clone(),
            });
        }
        let raw = if self.attributes.is_null() {
            serde_json::json!({})
        } else {
            self.attributes.clone()
        };
        let attributes: RoboclawAttributes =
            serde_json::from_value(raw).map_err(|source| ConfigError::InvalidAttributes {
                name: self.name.clone(),
                source,
            })?;
        attributes.validate(&self.name)
    }
}

impl RobotConfig {
    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validate every roboclaw motor and the constraints between them
    pub fn motors(&self) -> Result<Vec<MotorConfig>> {
        let mut names = HashSet::new();
        for component in &self.components {
            if !names.insert(component.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: component.name.clone(),
                });
            }
        }

        let mut motors = Vec::new();
        for component in &self.components {
            if !component.is_roboclaw() {
                debug!(
                    "Skipping component {} (model {})",
                    component.name, component.model
                );
                continue;
            }
            motors.push(component.roboclaw_motor()?);
        }

        check_shared_lines(&motors)?;
        Ok(motors)
    }
}

/// Motors sharing a serial path must agree on baud rate and not reuse a channel
fn check_shared_lines(motors: &[MotorConfig]) -> Result<()> {
    let mut line_baud: HashMap<&str, &MotorConfig> = HashMap::new();
    let mut channels: HashMap<(&str, u8, Channel), &MotorConfig> = HashMap::new();

    for motor in motors {
        let path = motor.serial_path.as_str();

        if let Some(first) = line_baud.get(path) {
            if first.baud_rate != motor.baud_rate {
                return Err(ConfigError::BaudRateMismatch {
                    path: path.to_string(),
                    first: first.name.clone(),
                    first_baud: first.baud_rate,
                    second: motor.name.clone(),
                    second_baud: motor.baud_rate,
                });
            }
        } else {
            line_baud.insert(path, motor);
        }

        if let Some(first) = channels.insert((path, motor.address, motor.channel), motor) {
            return Err(ConfigError::ChannelInUse {
                path: path.to_string(),
                address: motor.address,
                channel: motor.channel,
                first: first.name.clone(),
                second: motor.name.clone(),
            });
        }
    }
    Ok(())
}
