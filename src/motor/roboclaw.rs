// RoboClaw packet serial protocol implementation
//
// Write: [address, command, payload..., crc_hi, crc_lo] -> controller answers 0xFF
// Read:  [address, command] -> controller answers [payload..., crc_hi, crc_lo]
// The CRC of a read reply covers address, command and payload.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::{SERIAL_RETRIES, SERIAL_TIMEOUT};

/// Factory default packet serial address
pub const DEFAULT_ADDRESS: u8 = 0x80;

/// Factory default baud rate
pub const DEFAULT_BAUDRATE: u32 = 38_400;

/// Full scale duty cycle value (100% power)
pub const DUTY_SCALE: i16 = 32_767;

/// Buffer status reported when a channel has nothing queued or running
pub const BUFFER_IDLE: u8 = 0x80;

/// Ack byte returned after a successful write command
const ACK: u8 = 0xFF;

/// Longest version string the controller will send
const MAX_VERSION_LEN: usize = 48;

/// Command set (the subset used by the motor driver and diagnostics)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadEncM1 = 16,
    ReadEncM2 = 17,
    ReadSpeedM1 = 18,
    ReadSpeedM2 = 19,
    ResetEncoders = 20,
    ReadVersion = 21,
    SetEncM1 = 22,
    SetEncM2 = 23,
    ReadMainBattery = 24,
    DutyM1 = 32,
    DutyM2 = 33,
    SpeedM1 = 35,
    SpeedM2 = 36,
    SpeedDistanceM1 = 41,
    SpeedDistanceM2 = 42,
    ReadBuffers = 47,
    ReadPwms = 48,
    ReadError = 90,
}

impl Command {
    pub fn from_u8(code: u8) -> Option<Self> {
        use Command::*;
        let cmd = match code {
            16 => ReadEncM1,
            17 => ReadEncM2,
            18 => ReadSpeedM1,
            19 => ReadSpeedM2,
            20 => ResetEncoders,
            21 => ReadVersion,
            22 => SetEncM1,
            23 => SetEncM2,
            24 => ReadMainBattery,
            32 => DutyM1,
            33 => DutyM2,
            35 => SpeedM1,
            36 => SpeedM2,
            41 => SpeedDistanceM1,
            42 => SpeedDistanceM2,
            47 => ReadBuffers,
            48 => ReadPwms,
            90 => ReadError,
            _ => return None,
        };
        Some(cmd)
    }

    /// Payload length of a write command, `None` for read commands
    pub fn write_payload_len(self) -> Option<usize> {
        use Command::*;
        match self {
            ResetEncoders => Some(0),
            DutyM1 | DutyM2 => Some(2),
            SetEncM1 | SetEncM2 | SpeedM1 | SpeedM2 => Some(4),
            SpeedDistanceM1 | SpeedDistanceM2 => Some(9),
            _ => None,
        }
    }
}

/// One of the two output channels of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    M1,
    M2,
}

impl Channel {
    pub fn from_number(n: i64) -> Option<Self> {
        match n {
            1 => Some(Channel::M1),
            2 => Some(Channel::M2),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Channel::M1 => 1,
            Channel::M2 => 2,
        }
    }

    fn pick(self, m1: Command, m2: Command) -> Command {
        match self {
            Channel::M1 => m1,
            Channel::M2 => m2,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.number())
    }
}

/// Error types for RoboClaw communication
#[derive(Debug, thiserror::Error)]
pub enum RoboclawError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout waiting for response from controller {address}")]
    Timeout { address: u8 },

    #[error("Checksum mismatch in reply from controller {address}")]
    ChecksumMismatch { address: u8 },

    #[error("Controller {address} did not acknowledge write (got 0x{byte:02X})")]
    NoAck { address: u8, byte: u8 },

    #[error("Invalid response from controller {address}: {reason}")]
    InvalidResponse { address: u8, reason: String },
}

impl RoboclawError {
    /// Errors worth another attempt on a noisy line
    fn is_transient(&self) -> bool {
        matches!(
            self,
            RoboclawError::Timeout { .. }
                | RoboclawError::ChecksumMismatch { .. }
                | RoboclawError::NoAck { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RoboclawError>;

/// Byte stream a bus talks over: a serial port or the simulated controller
pub trait Transport: Read + Write + Send {
    /// Drop any stale bytes waiting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Encoder count plus the status byte sent with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderReading {
    pub count: i32,
    /// bit0 underflow, bit1 direction (1 = backwards), bit2 overflow
    pub status: u8,
}

/// CRC16-CCITT (poly 0x1021, init 0) as used by packet serial
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ ((byte as u16) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Build a write packet with trailing CRC
pub fn build_packet(address: u8, command: Command, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + payload.len());
    packet.push(address);
    packet.push(command as u8);
    packet.extend_from_slice(payload);
    let crc = crc16(&packet);
    packet.extend_from_slice(&crc.to_be_bytes());
    packet
}

/// RoboClaw bus - handles serial communication with one or more controllers
/// sharing a single line
pub struct RoboclawBus {
    port: Box<dyn Transport>,
    retries: usize,
}

impl RoboclawBus {
    /// Open a serial device at the given baud rate
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(timeout_for_baud(baudrate))
            .open()?;
        debug!("Opened {} at {} baud", port_name, baudrate);
        Ok(Self::with_transport(Box::new(port)))
    }

    /// Wrap an already-open transport
    pub fn with_transport(port: Box<dyn Transport>) -> Self {
        Self {
            port,
            retries: SERIAL_RETRIES,
        }
    }

    fn map_read_err(address: u8, e: io::Error) -> RoboclawError {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => {
                RoboclawError::Timeout { address }
            }
            _ => RoboclawError::Io(e),
        }
    }

    /// Run one transaction, retrying transient failures
    fn transact<T>(
        &mut self,
        address: u8,
        command: Command,
        mut attempt: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt(self) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && tries < self.retries => {
                    warn!(
                        "{:?} to controller {} failed ({}), retrying",
                        command, address, e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.clear_input()?;
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, address: u8) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.port
            .read_exact(&mut byte)
            .map_err(|e| Self::map_read_err(address, e))?;
        Ok(byte[0])
    }

    /// Send a write command and wait for the ack byte
    fn write_command(&mut self, address: u8, command: Command, payload: &[u8]) -> Result<()> {
        let packet = build_packet(address, command, payload);
        trace!("-> {:02X?}", packet);
        self.transact(address, command, |bus| {
            bus.send(&packet)?;
            let byte = bus.read_byte(address)?;
            if byte != ACK {
                return Err(RoboclawError::NoAck { address, byte });
            }
            Ok(())
        })
    }

    /// Send a read command and return its `len` payload bytes (CRC checked)
    fn read_command(&mut self, address: u8, command: Command, len: usize) -> Result<Vec<u8>> {
        self.transact(address, command, |bus| {
            bus.send(&[address, command as u8])?;

            let mut reply = vec![0u8; len + 2];
            bus.port
                .read_exact(&mut reply)
                .map_err(|e| Self::map_read_err(address, e))?;
            trace!("<- {:02X?}", reply);

            let (payload, crc_bytes) = reply.split_at(len);
            let mut checked = vec![address, command as u8];
            checked.extend_from_slice(payload);
            if crc16(&checked) != u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]) {
                return Err(RoboclawError::ChecksumMismatch { address });
            }
            Ok(payload.to_vec())
        })
    }

    // === Write commands ===

    /// Drive a channel with a signed duty cycle (-32767..=32767)
    pub fn duty(&mut self, address: u8, channel: Channel, duty: i16) -> Result<()> {
        debug!("Duty {} on controller {}: {}", channel, address, duty);
        let cmd = channel.pick(Command::DutyM1, Command::DutyM2);
        self.write_command(address, cmd, &duty.to_be_bytes())
    }

    /// Run a channel at a signed speed in encoder counts per second
    pub fn speed(&mut self, address: u8, channel: Channel, qpps: i32) -> Result<()> {
        debug!("Speed {} on controller {}: {} qpps", channel, address, qpps);
        let cmd = channel.pick(Command::SpeedM1, Command::SpeedM2);
        self.write_command(address, cmd, &qpps.to_be_bytes())
    }

    /// Run a channel at `qpps` until it has covered `distance` counts.
    /// With `immediate` the move replaces whatever is running; otherwise it
    /// is queued behind the current buffered command.
    pub fn speed_distance(
        &mut self,
        address: u8,
        channel: Channel,
        qpps: i32,
        distance: u32,
        immediate: bool,
    ) -> Result<()> {
        debug!(
            "SpeedDistance {} on controller {}: {} qpps for {} counts",
            channel, address, qpps, distance
        );
        let cmd = channel.pick(Command::SpeedDistanceM1, Command::SpeedDistanceM2);
        let mut payload = Vec::with_capacity(9);
        payload.extend_from_slice(&qpps.to_be_bytes());
        payload.extend_from_slice(&distance.to_be_bytes());
        payload.push(immediate as u8);
        self.write_command(address, cmd, &payload)
    }

    /// Overwrite a channel's encoder count
    pub fn set_encoder(&mut self, address: u8, channel: Channel, count: i32) -> Result<()> {
        debug!("Set encoder {} on controller {} to {}", channel, address, count);
        let cmd = channel.pick(Command::SetEncM1, Command::SetEncM2);
        self.write_command(address, cmd, &count.to_be_bytes())
    }

    /// Zero both encoder counts
    pub fn reset_encoders(&mut self, address: u8) -> Result<()> {
        self.write_command(address, Command::ResetEncoders, &[])
    }

    // === Read commands ===

    pub fn read_encoder(&mut self, address: u8, channel: Channel) -> Result<EncoderReading> {
        let cmd = channel.pick(Command::ReadEncM1, Command::ReadEncM2);
        let data = self.read_command(address, cmd, 5)?;
        Ok(EncoderReading {
            count: i32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            status: data[4],
        })
    }

    /// Measured speed in counts per second, negative when running backwards
    pub fn read_speed(&mut self, address: u8, channel: Channel) -> Result<i32> {
        let cmd = channel.pick(Command::ReadSpeedM1, Command::ReadSpeedM2);
        let data = self.read_command(address, cmd, 5)?;
        let raw = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(if data[4] & 0x01 != 0 {
            raw.saturating_abs().wrapping_neg()
        } else {
            raw
        })
    }

    /// Current duty cycles of both channels
    pub fn read_pwms(&mut self, address: u8) -> Result<(i16, i16)> {
        let data = self.read_command(address, Command::ReadPwms, 4)?;
        Ok((
            i16::from_be_bytes([data[0], data[1]]),
            i16::from_be_bytes([data[2], data[3]]),
        ))
    }

    /// Command buffer depth of both channels (`BUFFER_IDLE` when idle)
    pub fn read_buffers(&mut self, address: u8) -> Result<(u8, u8)> {
        let data = self.read_command(address, Command::ReadBuffers, 2)?;
        Ok((data[0], data[1]))
    }

    /// Main battery voltage in volts
    pub fn read_main_battery(&mut self, address: u8) -> Result<f32> {
        let data = self.read_command(address, Command::ReadMainBattery, 2)?;
        Ok(u16::from_be_bytes([data[0], data[1]]) as f32 / 10.0)
    }

    /// Raw error/warning status word
    pub fn read_error(&mut self, address: u8) -> Result<u32> {
        let data = self.read_command(address, Command::ReadError, 4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Firmware version string (null terminated on the wire)
    pub fn read_version(&mut self, address: u8) -> Result<String> {
        let command = Command::ReadVersion;
        self.transact(address, command, |bus| {
            bus.send(&[address, command as u8])?;

            let mut text = Vec::new();
            let mut checked = vec![address, command as u8];
            loop {
                let byte = bus.read_byte(address)?;
                checked.push(byte);
                if byte == 0 {
                    break;
                }
                if text.len() == MAX_VERSION_LEN {
                    return Err(RoboclawError::InvalidResponse {
                        address,
                        reason: "unterminated version string".to_string(),
                    });
                }
                text.push(byte);
            }

            let crc = u16::from_be_bytes([bus.read_byte(address)?, bus.read_byte(address)?]);
            if crc16(&checked) != crc {
                return Err(RoboclawError::ChecksumMismatch { address });
            }
            Ok(String::from_utf8_lossy(&text).trim_end().to_string())
        })
    }
}

/// Serial timeout long enough for the biggest reply at a given baud rate
pub fn timeout_for_baud(baudrate: u32) -> Duration {
    // 10 bits per byte on the wire, 64 bytes worst case
    let wire = Duration::from_micros(640_000_000 / baudrate.max(1) as u64);
    SERIAL_TIMEOUT.max(wire)
}
