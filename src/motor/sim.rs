// Simulated RoboClaw controller
//
// Speaks packet serial over an in-memory byte stream so the bus and motor
// driver can run without hardware (tests and `--simulate`). Every read
// transaction advances simulated motion by one step.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use tracing::trace;

use super::roboclaw::{crc16, Command, Transport, BUFFER_IDLE, DUTY_SCALE};

/// Addresses a controller can be configured for
const ADDRESS_RANGE: std::ops::RangeInclusive<u8> = 0x80..=0x87;

/// Simulation steps per second of motion
const STEPS_PER_SECOND: i32 = 50;

/// Duty reported while a closed-loop speed command is running
const CLOSED_LOOP_DUTY: i16 = DUTY_SCALE / 2;

/// Battery voltage reported, in tenths of a volt
const BATTERY_DECIVOLTS: u16 = 123;

const VERSION: &str = "USB RoboClaw 2x7a v4.1.34 (simulated)\n";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Drive {
    Idle,
    Duty(i16),
    Speed(i32),
    Distance { qpps: i32, remaining: u32 },
}

#[derive(Debug, Clone, Copy)]
struct ChannelState {
    drive: Drive,
    encoder: i32,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            drive: Drive::Idle,
            encoder: 0,
        }
    }
}

impl ChannelState {
    fn step(&mut self) {
        match self.drive {
            Drive::Speed(qpps) => {
                self.encoder = self.encoder.wrapping_add(qpps / STEPS_PER_SECOND);
            }
            Drive::Distance { qpps, remaining } => {
                let step = ((qpps.unsigned_abs() / STEPS_PER_SECOND as u32).max(1)).min(remaining);
                let signed = if qpps < 0 { -(step as i32) } else { step as i32 };
                self.encoder = self.encoder.wrapping_add(signed);
                let remaining = remaining - step;
                self.drive = if remaining == 0 {
                    Drive::Idle
                } else {
                    Drive::Distance { qpps, remaining }
                };
            }
            Drive::Idle | Drive::Duty(_) => {}
        }
    }

    fn pwm(&self) -> i16 {
        match self.drive {
            Drive::Idle => 0,
            Drive::Duty(duty) => duty,
            Drive::Speed(qpps) | Drive::Distance { qpps, .. } => {
                CLOSED_LOOP_DUTY * qpps.signum() as i16
            }
        }
    }

    fn speed(&self) -> i32 {
        match self.drive {
            Drive::Speed(qpps) | Drive::Distance { qpps, .. } => qpps,
            _ => 0,
        }
    }

    fn buffer(&self) -> u8 {
        match self.drive {
            Drive::Distance { .. } => 0,
            _ => BUFFER_IDLE,
        }
    }
}

#[derive(Debug, Default)]
struct Controller {
    m1: ChannelState,
    m2: ChannelState,
}

impl Controller {
    fn step(&mut self) {
        self.m1.step();
        self.m2.step();
    }
}

/// In-memory controller(s) on a simulated serial line
#[derive(Debug)]
pub struct SimulatedRoboclaw {
    controllers: HashMap<u8, Controller>,
    /// Accept any valid address, creating controllers on first use
    any_address: bool,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
}

impl Default for SimulatedRoboclaw {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRoboclaw {
    /// A line where every address in 128..=135 has a controller
    pub fn new() -> Self {
        Self {
            controllers: HashMap::new(),
            any_address: true,
            rx: Vec::new(),
            tx: VecDeque::new(),
        }
    }

    /// A line with controllers only at the given addresses
    pub fn with_addresses(addresses: &[u8]) -> Self {
        Self {
            controllers: addresses
                .iter()
                .map(|&a| (a, Controller::default()))
                .collect(),
            any_address: false,
            rx: Vec::new(),
            tx: VecDeque::new(),
        }
    }

    fn controller(&mut self, address: u8) -> Option<&mut Controller> {
        if self.any_address && ADDRESS_RANGE.contains(&address) {
            return Some(self.controllers.entry(address).or_default());
        }
        self.controllers.get_mut(&address)
    }

    /// Consume complete packets from the receive buffer
    fn process(&mut self) {
        while self.rx.len() >= 2 {
            let address = self.rx[0];
            let Some(command) = Command::from_u8(self.rx[1]) else {
                trace!("sim: unknown command {}, dropping input", self.rx[1]);
                self.rx.clear();
                return;
            };

            match command.write_payload_len() {
                Some(len) => {
                    let total = 2 + len + 2;
                    if self.rx.len() < total {
                        return;
                    }
                    let packet: Vec<u8> = self.rx.drain(..total).collect();
                    let crc = u16::from_be_bytes([packet[total - 2], packet[total - 1]]);
                    if crc16(&packet[..total - 2]) != crc {
                        trace!("sim: bad crc on {:?}", command);
                        continue;
                    }
                    if self.apply_write(address, command, &packet[2..2 + len]) {
                        self.tx.push_back(0xFF);
                    }
                }
                None => {
                    self.rx.drain(..2);
                    if let Some(payload) = self.answer_read(address, command) {
                        let mut checked = vec![address, command as u8];
                        checked.extend_from_slice(&payload);
                        let crc = crc16(&checked);
                        self.tx.extend(payload);
                        self.tx.extend(crc.to_be_bytes());
                    }
                }
            }
        }
    }

    fn apply_write(&mut self, address: u8, command: Command, payload: &[u8]) -> bool {
        let Some(ctl) = self.controller(address) else {
            return false;
        };
        let be_i32 = |b: &[u8]| i32::from_be_bytes([b[0], b[1], b[2], b[3]]);

        match command {
            Command::DutyM1 | Command::DutyM2 => {
                let duty = i16::from_be_bytes([payload[0], payload[1]]);
                let ch = if command == Command::DutyM1 { &mut ctl.m1 } else { &mut ctl.m2 };
                ch.drive = if duty == 0 { Drive::Idle } else { Drive::Duty(duty) };
            }
            Command::SpeedM1 | Command::SpeedM2 => {
                let qpps = be_i32(payload);
                let ch = if command == Command::SpeedM1 { &mut ctl.m1 } else { &mut ctl.m2 };
                ch.drive = if qpps == 0 { Drive::Idle } else { Drive::Speed(qpps) };
            }
            Command::SpeedDistanceM1 | Command::SpeedDistanceM2 => {
                let qpps = be_i32(payload);
                let distance = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                let ch = if command == Command::SpeedDistanceM1 {
                    &mut ctl.m1
                } else {
                    &mut ctl.m2
                };
                ch.drive = if qpps == 0 || distance == 0 {
                    Drive::Idle
                } else {
                    Drive::Distance {
                        qpps,
                        remaining: distance,
                    }
                };
            }
            Command::SetEncM1 => ctl.m1.encoder = be_i32(payload),
            Command::SetEncM2 => ctl.m2.encoder = be_i32(payload),
            Command::ResetEncoders => {
                ctl.m1.encoder = 0;
                ctl.m2.encoder = 0;
            }
            _ => return false,
        }
        true
    }

    fn answer_read(&mut self, address: u8, command: Command) -> Option<Vec<u8>> {
        let ctl = self.controller(address)?;
        ctl.step();

        let encoder = |ch: &ChannelState| {
            let mut out = ch.encoder.to_be_bytes().to_vec();
            out.push(if ch.encoder < 0 { 0x02 } else { 0x00 });
            out
        };
        let speed = |ch: &ChannelState| {
            let qpps = ch.speed();
            let mut out = qpps.unsigned_abs().to_be_bytes().to_vec();
            out.push(if qpps < 0 { 0x01 } else { 0x00 });
            out
        };

        let payload = match command {
            Command::ReadEncM1 => encoder(&ctl.m1),
            Command::ReadEncM2 => encoder(&ctl.m2),
            Command::ReadSpeedM1 => speed(&ctl.m1),
            Command::ReadSpeedM2 => speed(&ctl.m2),
            Command::ReadPwms => {
                let mut out = ctl.m1.pwm().to_be_bytes().to_vec();
                out.extend(ctl.m2.pwm().to_be_bytes());
                out
            }
            Command::ReadBuffers => vec![ctl.m1.buffer(), ctl.m2.buffer()],
            Command::ReadMainBattery => BATTERY_DECIVOLTS.to_be_bytes().to_vec(),
            Command::ReadError => 0u32.to_be_bytes().to_vec(),
            Command::ReadVersion => {
                let mut out = VERSION.as_bytes().to_vec();
                out.push(0);
                out
            }
            _ => return None,
        };
        Some(payload)
    }
}

impl Read for SimulatedRoboclaw {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.tx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
        }
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedRoboclaw {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rx.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for SimulatedRoboclaw {
    fn clear_input(&mut self) -> io::Result<()> {
        self.tx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::roboclaw::build_packet;

    #[test]
    fn test_write_is_acked() {
        let mut sim = SimulatedRoboclaw::new();
        sim.write_all(&build_packet(0x80, Command::DutyM1, &100i16.to_be_bytes()))
            .unwrap();
        let mut ack = [0u8; 1];
        sim.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], 0xFF);
    }

    #[test]
    fn test_bad_crc_is_ignored() {
        let mut sim = SimulatedRoboclaw::new();
        let mut packet = build_packet(0x80, Command::DutyM1, &100i16.to_be_bytes());
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        sim.write_all(&packet).unwrap();

        let mut ack = [0u8; 1];
        let err = sim.read_exact(&mut ack).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_split_writes_reassemble() {
        let mut sim = SimulatedRoboclaw::new();
        let packet = build_packet(0x80, Command::SetEncM1, &42i32.to_be_bytes());
        let (a, b) = packet.split_at(3);
        sim.write_all(a).unwrap();
        assert!(sim.tx.is_empty());
        sim.write_all(b).unwrap();
        assert_eq!(sim.tx.pop_front(), Some(0xFF));
        assert_eq!(sim.controllers[&0x80].m1.encoder, 42);
    }

    #[test]
    fn test_out_of_range_address_is_silent() {
        let mut sim = SimulatedRoboclaw::new();
        sim.write_all(&[0x10, Command::ReadPwms as u8]).unwrap();
        assert!(sim.tx.is_empty());
    }

    #[test]
    fn test_distance_move_counts_down() {
        let mut ch = ChannelState {
            drive: Drive::Distance {
                qpps: 100,
                remaining: 5,
            },
            encoder: 0,
        };
        // 100 qpps / 50 steps = 2 counts per step
        ch.step();
        assert_eq!(ch.encoder, 2);
        ch.step();
        ch.step();
        assert_eq!(ch.encoder, 5);
        assert_eq!(ch.drive, Drive::Idle);
        assert_eq!(ch.pwm(), 0);
        assert_eq!(ch.buffer(), BUFFER_IDLE);
    }
}
