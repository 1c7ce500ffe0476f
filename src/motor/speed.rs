// Speed and distance math for a single RoboClaw channel
// Converts between rpm, power fraction, duty cycle and encoder counts.

use std::time::Duration;

use super::roboclaw::DUTY_SCALE;

/// Speed assumed at full power when no encoder is wired (rough bench figure)
pub const MAX_RPM: f64 = 250.0;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Below this an rpm request is treated as zero
const NEARLY_ZERO_RPM: f64 = 0.1;

/// Result of checking a requested speed against the motor's limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedCheck {
    Ok,
    NearlyZero,
    NearlyMax,
}

impl SpeedCheck {
    /// Warning to log for this check, if any
    pub fn warning(&self, max_rpm: f64) -> Option<String> {
        match self {
            SpeedCheck::Ok => None,
            SpeedCheck::NearlyZero => Some("motor speed is nearly 0 rev_per_min".to_string()),
            SpeedCheck::NearlyMax => Some(format!(
                "motor speed is nearly the max rev_per_min ({})",
                max_rpm
            )),
        }
    }
}

pub fn check_speed(rpm: f64, max_rpm: f64) -> SpeedCheck {
    let speed = rpm.abs();
    if speed < NEARLY_ZERO_RPM {
        SpeedCheck::NearlyZero
    } else if max_rpm > 0.0 && speed > max_rpm - NEARLY_ZERO_RPM {
        SpeedCheck::NearlyMax
    } else {
        SpeedCheck::Ok
    }
}

pub fn clamp_rpm(rpm: f64, max_rpm: f64) -> f64 {
    rpm.clamp(-max_rpm, max_rpm)
}

pub fn clamp_power(power: f64) -> f64 {
    power.clamp(-1.0, 1.0)
}

/// Power fraction (-1..=1) to a duty command, clamping out of range input
pub fn power_to_duty(power: f64) -> i16 {
    (clamp_power(power) * DUTY_SCALE as f64) as i16
}

pub fn duty_to_power(duty: i16) -> f64 {
    duty as f64 / DUTY_SCALE as f64
}

/// Open-loop plan for moving `revolutions` at `rpm` without an encoder.
///
/// Returns the signed power and how long to hold it. Direction is the sign of
/// `rpm * revolutions`, so a negative count with a positive rpm runs backwards.
pub fn go_for_math(rpm: f64, revolutions: f64, max_rpm: f64) -> (f64, Duration) {
    let direction = if rpm * revolutions < 0.0 { -1.0 } else { 1.0 };
    let power = rpm.abs() / max_rpm * direction;
    let wait_ms = (revolutions / rpm).abs() * MS_PER_MINUTE;
    (power, Duration::from_secs_f64(wait_ms / 1000.0))
}

/// rpm to encoder counts per second
pub fn rpm_to_qpps(rpm: f64, ticks_per_rotation: u32) -> i32 {
    let qpps = (rpm * ticks_per_rotation as f64 / 60.0).round();
    qpps.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Absolute encoder distance covered by `revolutions`
pub fn revolutions_to_ticks(revolutions: f64, ticks_per_rotation: u32) -> u32 {
    let ticks = (revolutions * ticks_per_rotation as f64).abs().round();
    ticks.min(u32::MAX as f64) as u32
}

/// Time an encoder move of `distance` counts takes at `qpps`
pub fn expected_move_time(distance: u32, qpps: i32) -> Duration {
    if qpps == 0 {
        return Duration::MAX;
    }
    Duration::from_secs_f64(distance as f64 / qpps.unsigned_abs() as f64)
}

pub fn ticks_to_revolutions(ticks: i32, ticks_per_rotation: u32) -> f64 {
    if ticks_per_rotation == 0 {
        return 0.0;
    }
    ticks as f64 / ticks_per_rotation as f64
}
