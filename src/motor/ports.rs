// Shared serial lines
//
// Several motors (two channels per controller, up to eight controllers) can
// sit on one serial device. Each device is opened once and shared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::driver::MotorError;
use super::roboclaw::RoboclawBus;
use super::sim::SimulatedRoboclaw;

/// A bus shared by every motor on one serial device
#[derive(Clone)]
pub struct SharedBus {
    path: Arc<str>,
    bus: Arc<Mutex<RoboclawBus>>,
}

impl SharedBus {
    pub fn new(path: &str, bus: RoboclawBus) -> Self {
        Self {
            path: Arc::from(path),
            bus: Arc::new(Mutex::new(bus)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Exclusive access for one transaction
    pub fn lock(&self) -> Result<MutexGuard<'_, RoboclawBus>, MotorError> {
        self.bus.lock().map_err(|_| MotorError::BusPoisoned {
            path: self.path.to_string(),
        })
    }
}

/// Opens each serial device once and hands out shared handles to it
#[derive(Default)]
pub struct BusRegistry {
    buses: HashMap<String, (u32, SharedBus)>,
    simulate: bool,
}

impl BusRegistry {
    /// Registry that opens real serial devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that backs every path with a simulated controller line
    pub fn simulated() -> Self {
        Self {
            buses: HashMap::new(),
            simulate: true,
        }
    }

    /// Get the bus for `path`, opening it at `baud_rate` if needed.
    ///
    /// Baud rate belongs to the line, not to a motor: asking for an open
    /// line at a different rate is an error.
    pub fn acquire(&mut self, path: &str, baud_rate: u32) -> Result<SharedBus, MotorError> {
        if let Some((open_baud, bus)) = self.buses.get(path) {
            if *open_baud != baud_rate {
                return Err(MotorError::BaudRateMismatch {
                    path: path.to_string(),
                    open: *open_baud,
                    requested: baud_rate,
                });
            }
            return Ok(bus.clone());
        }

        let bus = if self.simulate {
            info!("Simulating RoboClaw line {} at {} baud", path, baud_rate);
            RoboclawBus::with_transport(Box::new(SimulatedRoboclaw::new()))
        } else {
            info!("Opening RoboClaw line {} at {} baud", path, baud_rate);
            RoboclawBus::open(path, baud_rate)?
        };
        let shared = SharedBus::new(path, bus);
        self.buses
            .insert(path.to_string(), (baud_rate, shared.clone()));
        Ok(shared)
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }
}
