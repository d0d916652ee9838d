//! Single-flight RTU master for the relay boards
//!
//! One request is on the wire at a time. The link moves through three
//! states: idle, awaiting a response (bytes accumulate into a buffer and a
//! running CRC until the inferred frame length is reached, or the deadline
//! passes), and an inter-frame gap that must elapse before the next request.
//!
//! Local coil state only changes after the board has confirmed a write, or
//! when a read returns the board's actual outputs.

use std::fmt;
use std::time::{Duration, Instant};

use errors::{HubError, HubResult};
use heapless::Vec as FrameBuf;
use tracing::{debug, error, trace, warn};

use super::constants::*;
use super::crc::Crc16;
use super::frame::{self, expected_response_length, word};
use super::link::SerialLink;
use crate::core::CommandQueue;
use crate::regs::{RegisterImage, SharedRegisters};

pub const MODBUS_QUEUE_DEPTH: usize = 10;

/// Called once with the outcome and the raw response (empty on timeout)
pub type ModbusCallback = Box<dyn FnOnce(ModbusOutcome, &[u8]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusOutcome {
    /// Valid response matching the request
    Done,
    /// Full frame received with a bad CRC
    InvalidCrc,
    Timeout,
    /// Exception response with its code
    Exception(u8),
    /// Well-formed frame from the wrong device or for another function
    UnexpectedReply,
}

impl ModbusOutcome {
    pub fn is_done(self) -> bool {
        self == Self::Done
    }
}

impl fmt::Display for ModbusOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("done"),
            Self::InvalidCrc => f.write_str("invalid CRC"),
            Self::Timeout => f.write_str("timeout"),
            Self::Exception(code) => write!(f, "exception {:02X}", code),
            Self::UnexpectedReply => f.write_str("unexpected reply"),
        }
    }
}

/// FC05 output value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoilValue {
    On,
    Off,
    Toggle,
}

impl CoilValue {
    pub fn wire(self) -> u16 {
        match self {
            Self::On => COIL_ON,
            Self::Off => COIL_OFF,
            Self::Toggle => COIL_TOGGLE,
        }
    }

    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            COIL_ON => Some(Self::On),
            COIL_OFF => Some(Self::Off),
            COIL_TOGGLE => Some(Self::Toggle),
            _ => None,
        }
    }
}

pub struct ModbusCommand {
    request: Vec<u8>,
    callback: Option<ModbusCallback>,
}

impl fmt::Debug for ModbusCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusCommand")
            .field("request", &format_args!("{:02X?}", self.request))
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

enum LinkState {
    Idle,
    Awaiting {
        command: ModbusCommand,
        deadline: Instant,
        buf: FrameBuf<u8, MAX_ADU_SIZE>,
        crc: Crc16,
    },
    Gap {
        until: Instant,
    },
}

pub struct ModbusMaster<L> {
    link: L,
    regs: SharedRegisters,
    queue: CommandQueue<ModbusCommand, MODBUS_QUEUE_DEPTH>,
    state: LinkState,
    response_timeout: Duration,
    gap: Duration,
}

impl<L: SerialLink> ModbusMaster<L> {
    pub fn new(link: L, regs: SharedRegisters, baud_rate: u32) -> Self {
        Self {
            link,
            regs,
            queue: CommandQueue::new("modbus"),
            state: LinkState::Idle,
            response_timeout: RESPONSE_TIMEOUT,
            gap: frame_gap(baud_rate),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn frame_gap(&self) -> Duration {
        self.gap
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, LinkState::Idle) && self.queue.is_empty()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub fn set_coil(
        &mut self,
        device: u8,
        coil: u16,
        value: CoilValue,
        callback: Option<ModbusCallback>,
    ) -> HubResult<()> {
        self.submit(frame::write_single_coil(device, coil, value.wire()), callback)
    }

    /// FC15: `count` coils from `start`, packed LSB-first
    pub fn set_coils(
        &mut self,
        device: u8,
        start: u16,
        count: u16,
        packed: &[u8],
        callback: Option<ModbusCallback>,
    ) -> HubResult<()> {
        if count == 0 || count > MAX_WRITE_COILS {
            return Err(HubError::invalid_value(
                "coil count",
                format!("{} outside 1..={}", count, MAX_WRITE_COILS),
            ));
        }
        if packed.len() < usize::from(count).div_ceil(8) {
            return Err(HubError::invalid_value(
                "coil data",
                format!("{} bytes for {} coils", packed.len(), count),
            ));
        }
        self.submit(
            frame::write_multiple_coils(device, start, count, packed),
            callback,
        )
    }

    /// FC01 bulk read; the returned outputs replace local coil state
    pub fn get_coils(
        &mut self,
        device: u8,
        start: u16,
        count: u16,
        callback: Option<ModbusCallback>,
    ) -> HubResult<()> {
        if count == 0 || count > MAX_READ_COILS {
            return Err(HubError::invalid_value(
                "coil count",
                format!("{} outside 1..={}", count, MAX_READ_COILS),
            ));
        }
        self.submit(frame::read_coils(device, start, count), callback)
    }

    fn submit(&mut self, request: Vec<u8>, callback: Option<ModbusCallback>) -> HubResult<()> {
        self.queue.enqueue(ModbusCommand { request, callback })
    }

    // ------------------------------------------------------------------
    // Executor
    // ------------------------------------------------------------------

    pub fn poll_at(&mut self, now: Instant) {
        match std::mem::replace(&mut self.state, LinkState::Idle) {
            LinkState::Idle => {
                if let Some(command) = self.queue.dequeue() {
                    self.transmit(command, now);
                }
            },
            LinkState::Gap { until } => {
                if now < until {
                    self.state = LinkState::Gap { until };
                }
            },
            LinkState::Awaiting {
                command,
                deadline,
                buf,
                crc,
            } => self.receive(command, deadline, buf, crc, now),
        }
    }

    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    fn transmit(&mut self, command: ModbusCommand, now: Instant) {
        debug!("Modbus tx {:02X?}", command.request);
        let sent = self
            .link
            .clear_input()
            .and_then(|_| self.link.write_frame(&command.request));
        match sent {
            Ok(()) => {
                self.state = LinkState::Awaiting {
                    command,
                    deadline: now + self.response_timeout,
                    buf: FrameBuf::new(),
                    crc: Crc16::new(),
                };
            },
            Err(e) => {
                error!("Modbus transmit failed: {}", e);
                self.complete(command, ModbusOutcome::Timeout, &[], now);
            },
        }
    }

    fn receive(
        &mut self,
        command: ModbusCommand,
        deadline: Instant,
        mut buf: FrameBuf<u8, MAX_ADU_SIZE>,
        mut crc: Crc16,
        now: Instant,
    ) {
        loop {
            let byte = match self.link.read_byte() {
                Ok(Some(byte)) => byte,
                Ok(None) => break,
                Err(e) => {
                    error!("Modbus receive failed: {}", e);
                    break;
                },
            };
            trace!("Modbus rx byte {:02X}", byte);
            if buf.push(byte).is_err() {
                warn!("Modbus response overflow, discarding");
                self.complete(command, ModbusOutcome::UnexpectedReply, &buf, now);
                return;
            }
            crc.update(byte);

            if let Some(expected) = expected_response_length(&buf) {
                if buf.len() >= expected {
                    let outcome = if crc.is_valid_frame() {
                        self.decode(&command.request, &buf)
                    } else {
                        warn!("Modbus CRC mismatch on {:02X?}", buf.as_slice());
                        ModbusOutcome::InvalidCrc
                    };
                    self.complete(command, outcome, &buf, now);
                    return;
                }
            }
        }

        if now >= deadline {
            debug!(
                "Modbus timeout after {} byte(s) for {:02X?}",
                buf.len(),
                command.request
            );
            self.complete(command, ModbusOutcome::Timeout, &buf, now);
        } else {
            self.state = LinkState::Awaiting {
                command,
                deadline,
                buf,
                crc,
            };
        }
    }

    /// Classify a CRC-valid response and reflect confirmed coil changes
    fn decode(&mut self, request: &[u8], response: &[u8]) -> ModbusOutcome {
        let function = request[1];
        if response[0] != request[0] {
            return ModbusOutcome::UnexpectedReply;
        }
        if response[1] == function | EXCEPTION_FLAG {
            return ModbusOutcome::Exception(response[2]);
        }
        if response[1] != function {
            return ModbusOutcome::UnexpectedReply;
        }

        // Write replies echo the address and value (or quantity) fields
        if matches!(function, FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS)
            && response.get(2..6) != request.get(2..6)
        {
            warn!("Modbus echo {:02X?} does not match request", response);
            return ModbusOutcome::UnexpectedReply;
        }

        let mut regs = self.regs.lock();
        match function {
            FC_WRITE_SINGLE_COIL => {
                let (Some(coil), Some(value)) = (word(request, 2), word(request, 4)) else {
                    return ModbusOutcome::UnexpectedReply;
                };
                match value >> 8 {
                    0x00 => regs.clear_coil(coil),
                    0xFF => regs.set_coil(coil),
                    0x55 => regs.toggle_coil(coil),
                    _ => {},
                }
            },
            FC_WRITE_MULTIPLE_COILS => {
                let (Some(start), Some(count)) = (word(request, 2), word(request, 4)) else {
                    return ModbusOutcome::UnexpectedReply;
                };
                apply_bits(&mut regs, start, count, request.get(7..).unwrap_or(&[]));
            },
            FC_READ_COILS => {
                let (Some(start), Some(count)) = (word(request, 2), word(request, 4)) else {
                    return ModbusOutcome::UnexpectedReply;
                };
                let data_len = usize::from(response[2]);
                let data = response.get(3..3 + data_len).unwrap_or(&[]);
                apply_bits(&mut regs, start, count, data);
            },
            _ => {},
        }
        ModbusOutcome::Done
    }

    fn complete(
        &mut self,
        mut command: ModbusCommand,
        outcome: ModbusOutcome,
        response: &[u8],
        now: Instant,
    ) {
        if !outcome.is_done() {
            debug!("Modbus {:02X?} -> {}", command.request, outcome);
        }
        if let Some(callback) = command.callback.take() {
            callback(outcome, response);
        }
        self.state = LinkState::Gap {
            until: now + self.gap,
        };
    }
}

/// Write `count` LSB-first packed bits into the coil image from `start`
fn apply_bits(regs: &mut RegisterImage, start: u16, count: u16, packed: &[u8]) {
    for i in 0..count {
        let Some(&byte) = packed.get(usize::from(i / 8)) else {
            break;
        };
        let on = byte & (1 << (i % 8)) != 0;
        regs.write_coil(start.saturating_add(i), on);
    }
}
