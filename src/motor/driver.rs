// High-level motor driver for one RoboClaw channel
//
// Combines the packet serial bus and speed math into the standard motor API:
// power, rpm, relative and absolute moves, position and zeroing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::ports::SharedBus;
use super::roboclaw::{Channel, RoboclawError, BUFFER_IDLE};
use super::speed::{
    check_speed, clamp_rpm, duty_to_power, expected_move_time, go_for_math, power_to_duty,
    revolutions_to_ticks, rpm_to_qpps, ticks_to_revolutions, SpeedCheck, MAX_RPM,
};
use crate::config::{MotorConfig, MOVE_POLL_INTERVAL, MOVE_TIMEOUT_MARGIN};
use crate::messages::{MotorCommand, MotorHealth, MotorState};

/// Error types for motor operations
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error(transparent)]
    Bus(#[from] RoboclawError),

    #[error("Cannot move motor for 0 revolutions")]
    ZeroRevolutions,

    #[error("Cannot move motor at an RPM that is nearly 0")]
    ZeroRpm,

    #[error("roboclaw needs an encoder connected to use {operation}")]
    EncoderRequired { operation: &'static str },

    #[error("{path} is already open at {open} baud, cannot use it at {requested}")]
    BaudRateMismatch {
        path: String,
        open: u32,
        requested: u32,
    },

    #[error("serial line {path} is unusable after a panic in another motor")]
    BusPoisoned { path: String },
    #[error("move did not finish within {timeout:?}")]
    MoveTimedOut { timeout: Duration },
}

pub type Result<T> = std::result::Result<T, MotorError>;

/// Static capabilities of a motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties {
    pub position_reporting: bool,
}

/// How a long-running move ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveEnd {
    Finished,
    Superseded,
    TimedOut(Duration),
}

/// One motor: a channel on a controller on a serial line
pub struct RoboclawMotor {
    name: String,
    bus: SharedBus,
    address: u8,
    channel: Channel,
    ticks_per_rotation: u32,
    max_rpm: f64,
    poll_interval: Duration,
    // bumped by every command; a move stops waiting once it no longer owns it
    generation: AtomicU64,
}

impl RoboclawMotor {
    pub fn new(config: &MotorConfig, bus: SharedBus) -> Self {
        info!(
            "Motor {}: controller {} channel {} on {} ({} ticks/rotation)",
            config.name, config.address, config.channel, config.serial_path, config.ticks_per_rotation
        );
        Self {
            name: config.name.clone(),
            bus,
            address: config.address,
            channel: config.channel,
            ticks_per_rotation: config.ticks_per_rotation,
            max_rpm: MAX_RPM,
            poll_interval: MOVE_POLL_INTERVAL,
            generation: AtomicU64::new(0),
        }
    }

    /// Override how often running moves are polled
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn has_encoder(&self) -> bool {
        self.ticks_per_rotation != 0
    }

    /// Start a new operation, superseding any move in progress
    fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, op: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == op
    }

    fn log_speed_check(&self, rpm: f64) -> SpeedCheck {
        let check = check_speed(rpm, self.max_rpm);
        if let Some(warning) = check.warning(self.max_rpm) {
            warn!("{}: {}", self.name, warning);
        }
        check
    }

    fn write_power(&self, power: f64) -> Result<()> {
        let duty = power_to_duty(power);
        self.bus.lock()?.duty(self.address, self.channel, duty)?;
        Ok(())
    }

    // === Motor API ===

    /// Drive at a fraction of full power, clamped to -1..=1
    pub fn set_power(&self, power: f64) -> Result<()> {
        self.begin();
        self.power_now(power)
    }

    fn power_now(&self, power: f64) -> Result<()> {
        debug!("{}: set power {}", self.name, power);
        self.write_power(power)
    }

    /// Run continuously at `rpm`.
    ///
    /// Without an encoder the speed is approximated from `MAX_RPM`; power and
    /// speed are not linear so this is only a rough estimate.
    pub fn set_rpm(&self, rpm: f64) -> Result<()> {
        self.begin();
        self.rpm_now(rpm)
    }

    fn rpm_now(&self, rpm: f64) -> Result<()> {
        if self.log_speed_check(rpm) == SpeedCheck::NearlyZero {
            return self.write_power(0.0);
        }

        if !self.has_encoder() {
            warn!(
                "{}: speed is an estimation based on the max rpm ({}), connect encoders for accuracy",
                self.name, self.max_rpm
            );
            let rpm = clamp_rpm(rpm, self.max_rpm);
            return self.write_power(rpm / self.max_rpm);
        }

        let qpps = rpm_to_qpps(rpm, self.ticks_per_rotation);
        self.bus.lock()?.speed(self.address, self.channel, qpps)?;
        Ok(())
    }

    /// Turn `revolutions` at `rpm`, blocking until done. Negative rpm or
    /// revolutions reverse direction (both negative runs forwards).
    ///
    /// Returns early without stopping if another command takes over the motor.
    pub fn go_for(&self, rpm: f64, revolutions: f64) -> Result<()> {
        let op = self.begin();
        self.go_for_op(op, rpm, revolutions)
    }

    fn go_for_op(&self, op: u64, rpm: f64, revolutions: f64) -> Result<()> {
        if revolutions == 0.0 {
            return Err(MotorError::ZeroRevolutions);
        }
        if self.log_speed_check(rpm) == SpeedCheck::NearlyZero {
            return Err(MotorError::ZeroRpm);
        }

        let end = if self.has_encoder() {
            let direction = if rpm * revolutions < 0.0 { -1 } else { 1 };
            let qpps = rpm_to_qpps(rpm.abs(), self.ticks_per_rotation) * direction;
            if qpps == 0 {
                return Err(MotorError::ZeroRpm);
            }
            let distance = revolutions_to_ticks(revolutions, self.ticks_per_rotation);
            if distance == 0 {
                return Err(MotorError::ZeroRevolutions);
            }
            let timeout = expected_move_time(distance, qpps)
                .saturating_mul(2)
                .saturating_add(MOVE_TIMEOUT_MARGIN);
            debug!("{}: go for {} counts at {} qpps", self.name, distance, qpps);
            self.bus
                .lock()?
                .speed_distance(self.address, self.channel, qpps, distance, true)?;
            self.wait_for_buffer(op, timeout)?
        } else {
            let rpm = clamp_rpm(rpm, self.max_rpm);
            let (power, duration) = go_for_math(rpm, revolutions, self.max_rpm);
            info!(
                "{}: distance traveled is a time based estimation with max rpm = {}, connect encoders for accuracy",
                self.name, self.max_rpm
            );
            self.write_power(power)?;
            self.wait_for(op, duration)
        };

        match end {
            MoveEnd::Finished => self.write_power(0.0),
            MoveEnd::Superseded => {
                debug!("{}: move superseded", self.name);
                Ok(())
            }
            MoveEnd::TimedOut(timeout) => {
                warn!("{}: move did not finish within {:?}, stopping", self.name, timeout);
                self.write_power(0.0)?;
                Err(MotorError::MoveTimedOut { timeout })
            }
        }
    }

    /// Move to an absolute position (in revolutions) at `|rpm|`. Needs an encoder.
    pub fn go_to(&self, rpm: f64, position_revolutions: f64) -> Result<()> {
        let op = self.begin();
        self.go_to_op(op, rpm, position_revolutions)
    }

    fn go_to_op(&self, op: u64, rpm: f64, position_revolutions: f64) -> Result<()> {
        if !self.has_encoder() {
            return Err(MotorError::EncoderRequired { operation: "GoTo" });
        }

        let current = self.position()?;
        let delta = position_revolutions - current;
        if revolutions_to_ticks(delta, self.ticks_per_rotation) == 0 {
            debug!("{}: already at {}", self.name, position_revolutions);
            return Ok(());
        }
        self.go_for_op(op, rpm.abs(), delta)
    }

    /// Make the current position read as `-offset` revolutions. Needs an encoder.
    pub fn reset_zero_position(&self, offset: f64) -> Result<()> {
        self.begin();
        self.reset_zero_now(offset)
    }

    fn reset_zero_now(&self, offset: f64) -> Result<()> {
        if !self.has_encoder() {
            return Err(MotorError::EncoderRequired {
                operation: "ResetZeroPosition",
            });
        }
        let count = (-offset * self.ticks_per_rotation as f64).round() as i32;
        self.bus
            .lock()?
            .set_encoder(self.address, self.channel, count)?;
        Ok(())
    }

    /// Position in revolutions; always 0 without an encoder
    pub fn position(&self) -> Result<f64> {
        if !self.has_encoder() {
            return Ok(0.0);
        }
        let reading = self.bus.lock()?.read_encoder(self.address, self.channel)?;
        Ok(ticks_to_revolutions(reading.count, self.ticks_per_rotation))
    }

    pub fn properties(&self) -> Properties {
        Properties {
            position_reporting: self.has_encoder(),
        }
    }

    /// Whether the channel is driven, and at what fraction of full power
    pub fn is_powered(&self) -> Result<(bool, f64)> {
        let (pwm1, pwm2) = self.bus.lock()?.read_pwms(self.address)?;
        let pwm = match self.channel {
            Channel::M1 => pwm1,
            Channel::M2 => pwm2,
        };
        Ok((pwm != 0, duty_to_power(pwm)))
    }

    pub fn is_moving(&self) -> Result<bool> {
        Ok(self.is_powered()?.0)
    }

    /// Cut power and cancel any move in progress
    pub fn stop(&self) -> Result<()> {
        self.begin();
        debug!("{}: stop", self.name);
        self.write_power(0.0)
    }

    // === Queued commands ===

    /// Claim the motor for a command that will run later through
    /// [`run_reserved`](Self::run_reserved). Cancels any move in progress.
    pub fn reserve(&self) -> u64 {
        self.begin()
    }

    /// Run a command claimed with [`reserve`](Self::reserve), in claim order.
    ///
    /// A move whose claim was overtaken before it started is skipped.
    pub fn run_reserved(&self, op: u64, cmd: MotorCommand) -> Result<()> {
        match cmd {
            MotorCommand::SetPower { power_pct } => self.power_now(power_pct),
            MotorCommand::SetRpm { rpm } => self.rpm_now(rpm),
            MotorCommand::ResetZeroPosition { offset } => self.reset_zero_now(offset),
            MotorCommand::Stop => {
                debug!("{}: stop", self.name);
                self.write_power(0.0)
            }
            MotorCommand::GoFor { .. } | MotorCommand::GoTo { .. } if !self.is_current(op) => {
                debug!("{}: skipping superseded {}", self.name, cmd.op());
                Ok(())
            }
            MotorCommand::GoFor { rpm, revolutions } => self.go_for_op(op, rpm, revolutions),
            MotorCommand::GoTo {
                rpm,
                position_revolutions,
            } => self.go_to_op(op, rpm, position_revolutions),
        }
    }

    /// Snapshot for publishing
    pub fn state(&self) -> MotorState {
        let read = || -> Result<MotorState> {
            let (is_powered, power_pct) = self.is_powered()?;
            Ok(MotorState {
                name: self.name.clone(),
                health: MotorHealth::Ok,
                is_powered,
                power_pct,
                position: self.position()?,
                is_moving: is_powered,
                position_reporting: self.has_encoder(),
            })
        };
        read().unwrap_or_else(|e| {
            warn!("{}: failed to read state: {}", self.name, e);
            MotorState::faulted(&self.name, self.has_encoder())
        })
    }

    // === Waiting ===

    /// Sleep for `duration` unless superseded first
    fn wait_for(&self, op: u64, duration: Duration) -> MoveEnd {
        let deadline = Instant::now() + duration;
        loop {
            if !self.is_current(op) {
                return MoveEnd::Superseded;
            }
            let now = Instant::now();
            if now >= deadline {
                return MoveEnd::Finished;
            }
            sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Poll until this channel's command buffer drains, giving up after `timeout`
    fn wait_for_buffer(&self, op: u64, timeout: Duration) -> Result<MoveEnd> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if !self.is_current(op) {
                return Ok(MoveEnd::Superseded);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(MoveEnd::TimedOut(timeout));
            }
            let (m1, m2) = self.bus.lock()?.read_buffers(self.address)?;
            let depth = match self.channel {
                Channel::M1 => m1,
                Channel::M2 => m2,
            };
            if depth == BUFFER_IDLE {
                return Ok(MoveEnd::Finished);
            }
            sleep(self.poll_interval);
        }
    }
}

impl Drop for RoboclawMotor {
    fn drop(&mut self) {
        // Try to stop the motor when the driver is dropped
        if let Err(e) = self.stop() {
            warn!("{}: failed to stop motor on drop: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::ports::{BusRegistry, SharedBus};
    use crate::motor::roboclaw::{crc16, Command, RoboclawBus, Transport};
    use crate::motor::sim::SimulatedRoboclaw;
    use std::io::{self, Read, Write};
    use std::sync::Arc;
    use std::thread;

    /// Controller whose command buffers never drain
    struct StuckBuffers {
        sim: SimulatedRoboclaw,
        reply: Vec<u8>,
    }

    impl Read for StuckBuffers {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.reply.is_empty() {
                return self.sim.read(buf);
            }
            let n = buf.len().min(self.reply.len());
            buf[..n].copy_from_slice(&self.reply[..n]);
            self.reply.drain(..n);
            Ok(n)
        }
    }

    impl Write for StuckBuffers {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.len() == 2 && buf[1] == Command::ReadBuffers as u8 {
                let crc = crc16(&[buf[0], buf[1], 0, 0]);
                self.reply = vec![0, 0];
                self.reply.extend_from_slice(&crc.to_be_bytes());
                return Ok(buf.len());
            }
            self.sim.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for StuckBuffers {
        fn clear_input(&mut self) -> io::Result<()> {
            self.reply.clear();
            self.sim.clear_input()
        }
    }

    fn motor_config(name: &str, channel: Channel, ticks: u32) -> MotorConfig {
        MotorConfig {
            name: name.to_string(),
            serial_path: "/dev/ttySIM".to_string(),
            baud_rate: 38_400,
            channel,
            address: 128,
            ticks_per_rotation: ticks,
        }
    }

    fn motor(registry: &mut BusRegistry, channel: Channel, ticks: u32) -> RoboclawMotor {
        let bus = registry.acquire("/dev/ttySIM", 38_400).unwrap();
        RoboclawMotor::new(&motor_config("m", channel, ticks), bus)
            .with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_set_power_and_is_powered() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M2, 0);

        m.set_power(0.5).unwrap();
        let (on, power) = m.is_powered().unwrap();
        assert!(on);
        assert!((power - 0.5).abs() < 1e-3);
        assert!(m.is_moving().unwrap());

        m.set_power(-3.0).unwrap();
        let (_, power) = m.is_powered().unwrap();
        assert!((power + 1.0).abs() < 1e-9);

        m.stop().unwrap();
        assert_eq!(m.is_powered().unwrap(), (false, 0.0));
    }

    #[test]
    fn test_channels_are_independent() {
        let mut registry = BusRegistry::simulated();
        let m1 = motor(&mut registry, Channel::M1, 0);
        let m2 = motor(&mut registry, Channel::M2, 0);

        m1.set_power(0.25).unwrap();
        assert!(m1.is_powered().unwrap().0);
        assert!(!m2.is_powered().unwrap().0);
    }

    #[test]
    fn test_properties_and_position_without_encoder() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M1, 0);
        assert!(!m.properties().position_reporting);
        assert_eq!(m.position().unwrap(), 0.0);
        assert!(matches!(
            m.go_to(100.0, 1.0),
            Err(MotorError::EncoderRequired { .. })
        ));
        assert!(matches!(
            m.reset_zero_position(1.0),
            Err(MotorError::EncoderRequired { .. })
        ));
    }

    #[test]
    fn test_go_for_rejects_zero() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M1, 1000);
        assert!(matches!(m.go_for(100.0, 0.0), Err(MotorError::ZeroRevolutions)));
        assert!(matches!(m.go_for(0.01, 1.0), Err(MotorError::ZeroRpm)));
    }

    #[test]
    fn test_go_for_rejects_requests_below_encoder_resolution() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M1, 100);

        // 0.2 rpm on 100 ticks/rotation is 0 counts per second
        assert!(matches!(m.go_for(0.2, 1.0), Err(MotorError::ZeroRpm)));
        // 0.004 revolutions is 0 counts
        assert!(matches!(m.go_for(60.0, 0.004), Err(MotorError::ZeroRevolutions)));
        assert_eq!(m.position().unwrap(), 0.0);
        assert!(!m.is_moving().unwrap());
    }

    #[test]
    fn test_go_for_gives_up_on_stuck_move() {
        let line = StuckBuffers {
            sim: SimulatedRoboclaw::new(),
            reply: Vec::new(),
        };
        let bus = SharedBus::new("/dev/ttySTUCK", RoboclawBus::with_transport(Box::new(line)));
        let m = RoboclawMotor::new(&motor_config("m", Channel::M1, 100), bus)
            .with_poll_interval(Duration::from_millis(5));

        // 1 rev at 200 rpm is expected to take 0.3 s
        let start = Instant::now();
        let err = m.go_for(200.0, 1.0).unwrap_err();
        assert!(matches!(err, MotorError::MoveTimedOut { .. }));
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!m.is_powered().unwrap().0);
    }

    #[test]
    fn test_go_for_with_encoder() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M1, 1000);
        assert!(m.properties().position_reporting);

        m.go_for(120.0, 2.0).unwrap();
        assert!((m.position().unwrap() - 2.0).abs() < 1e-9);
        assert!(!m.is_moving().unwrap());

        // Negative revolutions run backwards
        m.go_for(120.0, -0.5).unwrap();
        assert!((m.position().unwrap() - 1.5).abs() < 1e-9);

        // Both negative run forwards
        m.go_for(-120.0, -0.5).unwrap();
        assert!((m.position().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_go_to_and_reset_zero() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M2, 500);

        m.go_to(-200.0, 3.0).unwrap();
        assert!((m.position().unwrap() - 3.0).abs() < 1e-9);

        m.go_to(200.0, 1.0).unwrap();
        assert!((m.position().unwrap() - 1.0).abs() < 1e-9);

        // already there
        m.go_to(200.0, 1.0).unwrap();

        m.reset_zero_position(0.0).unwrap();
        assert_eq!(m.position().unwrap(), 0.0);
        m.reset_zero_position(2.0).unwrap();
        assert!((m.position().unwrap() + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_go_for_without_encoder_is_timed() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M1, 0);

        // 250 rpm for 0.05 rev = 12 ms
        let start = Instant::now();
        m.go_for(250.0, 0.05).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(12));
        assert!(!m.is_powered().unwrap().0);
    }

    #[test]
    fn test_set_rpm() {
        let mut registry = BusRegistry::simulated();
        let open_loop = motor(&mut registry, Channel::M1, 0);
        open_loop.set_rpm(125.0).unwrap();
        let (_, power) = open_loop.is_powered().unwrap();
        assert!((power - 0.5).abs() < 1e-3);

        // clamped to max rpm
        open_loop.set_rpm(-1000.0).unwrap();
        let (_, power) = open_loop.is_powered().unwrap();
        assert!((power + 1.0).abs() < 1e-9);

        // nearly zero stops
        open_loop.set_rpm(0.0).unwrap();
        assert!(!open_loop.is_powered().unwrap().0);

        let closed_loop = motor(&mut registry, Channel::M2, 600);
        closed_loop.set_rpm(60.0).unwrap();
        assert!(closed_loop.is_moving().unwrap());
        let speed = registry
            .acquire("/dev/ttySIM", 38_400)
            .unwrap()
            .lock()
            .unwrap()
            .read_speed(128, Channel::M2)
            .unwrap();
        assert_eq!(speed, 600);
    }

    #[test]
    fn test_stop_supersedes_running_move() {
        let mut registry = BusRegistry::simulated();
        let bus = registry.acquire("/dev/ttySIM", 38_400).unwrap();
        let m = Arc::new(
            RoboclawMotor::new(&motor_config("m", Channel::M1, 0), bus)
                .with_poll_interval(Duration::from_millis(1)),
        );

        let mover = Arc::clone(&m);
        let start = Instant::now();
        // 10 revolutions at 250 rpm would take 2.4 s
        let handle = thread::spawn(move || mover.go_for(250.0, 10.0));
        thread::sleep(Duration::from_millis(30));
        m.stop().unwrap();

        handle.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!m.is_powered().unwrap().0);
    }

    #[test]
    fn test_overtaken_reserved_move_is_skipped() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M1, 100);

        let go = m.reserve();
        let power = m.reserve();
        m.run_reserved(go, MotorCommand::GoFor { rpm: 60.0, revolutions: 5.0 })
            .unwrap();
        assert_eq!(m.position().unwrap(), 0.0);

        m.run_reserved(power, MotorCommand::SetPower { power_pct: 0.3 })
            .unwrap();
        assert!(m.is_powered().unwrap().0);

        // the latest claim runs its move to the end
        let go = m.reserve();
        m.run_reserved(go, MotorCommand::GoFor { rpm: 60.0, revolutions: 1.0 })
            .unwrap();
        assert!((m.position().unwrap() - 1.0).abs() < 1e-9);
        assert!(!m.is_powered().unwrap().0);
    }

    #[test]
    fn test_state_snapshot() {
        let mut registry = BusRegistry::simulated();
        let m = motor(&mut registry, Channel::M1, 100);
        m.set_power(0.2).unwrap();
        let state = m.state();
        assert_eq!(state.name, "m");
        assert_eq!(state.health, MotorHealth::Ok);
        assert!(state.is_powered);
        assert!(state.position_reporting);
    }

    #[test]
    fn test_state_reports_fault() {
        let mut registry = BusRegistry::simulated();
        let bus = registry.acquire("/dev/ttySIM", 38_400).unwrap();
        let mut config = motor_config("lost", Channel::M1, 0);
        // nothing answers at 0x90
        config.address = 0x90;
        let m = RoboclawMotor::new(&config, bus);
        let state = m.state();
        assert_eq!(state.health, MotorHealth::BusError);
        assert!(!state.is_powered);
    }
}
