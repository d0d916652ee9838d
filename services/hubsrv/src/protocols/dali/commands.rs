//! DALI forward-frame encoding and backward-frame decoding
//!
//! A forward frame is 16 bits: `(short_address << 9) | opcode`, where the
//! opcode carries the selector bit (0x100) for commands and queries. Special
//! commands (DTR writes) have bit 15 set and no address.

use std::fmt;

/// Highest short address on the bus
pub const DALI_MAX_ADDR: u8 = 63;

/// Number of short addresses
pub const DALI_ADDR_COUNT: usize = 64;

// ============================================================================
// Opcodes
// ============================================================================

pub mod opcode {
    // Queries
    pub const QUERY_STATUS: u16 = 0x190;
    pub const QUERY_DEVICE_TYPE: u16 = 0x199;
    pub const QUERY_ACTUAL_LEVEL: u16 = 0x1A0;
    pub const QUERY_MAX_LEVEL: u16 = 0x1A1;
    pub const QUERY_MIN_LEVEL: u16 = 0x1A2;
    pub const QUERY_POWER_ON_LEVEL: u16 = 0x1A3;
    pub const QUERY_SYSTEM_FAILURE_LEVEL: u16 = 0x1A4;
    pub const QUERY_FADE_TIME_RATE: u16 = 0x1A5;
    pub const QUERY_EXTENDED_FADE_TIME: u16 = 0x1A8;
    pub const QUERY_GROUPS_0_7: u16 = 0x1C0;
    pub const QUERY_GROUPS_8_15: u16 = 0x1C1;

    // Level commands
    pub const OFF: u16 = 0x100;
    pub const UP: u16 = 0x101;
    pub const DOWN: u16 = 0x102;
    pub const STEP_UP: u16 = 0x103;
    pub const STEP_DOWN: u16 = 0x104;
    pub const RECALL_MAX_LEVEL: u16 = 0x105;
    pub const RECALL_MIN_LEVEL: u16 = 0x106;
    pub const RECALL_LAST_ACTIVE_LEVEL: u16 = 0x10A;

    // Configuration commands (must be sent twice)
    pub const SET_MAX_LEVEL: u16 = 0x12A;
    pub const SET_MIN_LEVEL: u16 = 0x12B;
    pub const SET_SYSTEM_FAILURE_LEVEL: u16 = 0x12C;
    pub const SET_POWER_ON_LEVEL: u16 = 0x12D;
    pub const SET_FADE_TIME: u16 = 0x12E;
    pub const SET_FADE_RATE: u16 = 0x12F;
    pub const SET_EXTENDED_FADE_TIME: u16 = 0x130;
    pub const ADD_TO_GROUP: u16 = 0x160;
    pub const REMOVE_FROM_GROUP: u16 = 0x170;

    // Special commands, value in the low byte
    pub const SET_DTR0: u16 = 0xA300;
}

/// Build an addressed forward frame
pub const fn command(addr: u8, op: u16) -> u16 {
    ((addr as u16 & 0x3F) << 9) | (op & 0x1FF)
}

/// Direct arc power: selector bit clear, level in the low byte
pub const fn direct_arc_power(addr: u8, level: u8) -> u16 {
    ((addr as u16 & 0x3F) << 9) | level as u16
}

pub const fn set_dtr0(value: u8) -> u16 {
    opcode::SET_DTR0 | value as u16
}

pub const fn add_to_group(addr: u8, group: u8) -> u16 {
    command(addr, opcode::ADD_TO_GROUP | (group as u16 & 0x0F))
}

pub const fn remove_from_group(addr: u8, group: u8) -> u16 {
    command(addr, opcode::REMOVE_FROM_GROUP | (group as u16 & 0x0F))
}

pub const fn address_of(frame: u16) -> u8 {
    ((frame >> 9) & 0x3F) as u8
}

pub const fn strip_address(frame: u16) -> u16 {
    frame & 0x1FF
}

pub const fn is_special(frame: u16) -> bool {
    frame & 0x8000 != 0
}

/// Configuration commands (32..=129) are ignored by gear unless repeated
pub const fn needs_repeat(frame: u16) -> bool {
    !is_special(frame) && matches!(strip_address(frame), 0x120..=0x181)
}

// ============================================================================
// Status bits (QUERY STATUS reply)
// ============================================================================

pub mod status {
    pub const ARC_POWER_ON: u8 = 0x04;
    pub const FADE_IN_PROGRESS: u8 = 0x10;
}

// ============================================================================
// Gear types (QUERY DEVICE TYPE reply)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GearType {
    FluorescentLamp,
    EmergencyLighting,
    DischargeLamp,
    LowVoltageHalogen,
    IncandescentDimmer,
    DcVoltageConverter,
    Led,
    Switching,
    Colour,
    MultipleTypes,
    Unknown(u8),
}

impl From<u8> for GearType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::FluorescentLamp,
            1 => Self::EmergencyLighting,
            2 => Self::DischargeLamp,
            3 => Self::LowVoltageHalogen,
            4 => Self::IncandescentDimmer,
            5 => Self::DcVoltageConverter,
            6 => Self::Led,
            7 => Self::Switching,
            8 => Self::Colour,
            255 => Self::MultipleTypes,
            other => Self::Unknown(other),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Backward frame value reported by the physical layer for "no answer"
pub const RAW_NO_BACKWARD_FRAME: u32 = 0xFFFF_FFFF;
/// Framing violation detected while receiving
pub const RAW_BUS_ERROR: u32 = 0xFFFF_FFFE;

/// Outcome of one bus transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaliResponse {
    /// Backward frame carrying a byte
    Value(u8),
    /// No backward frame: "no" to a query, or no such device
    Nak,
    /// The physical layer never reported completion
    Timeout,
    /// Collision or framing error
    BusError,
}

impl DaliResponse {
    /// Decode the word delivered by the physical layer
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            RAW_NO_BACKWARD_FRAME => Self::Nak,
            RAW_BUS_ERROR => Self::BusError,
            other => Self::Value((other & 0xFF) as u8),
        }
    }

    pub fn value(self) -> Option<u8> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_value(self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// A transmission reached the gear, so a mandated repeat may follow
    pub fn permits_repeat(self) -> bool {
        matches!(self, Self::Value(_) | Self::Nak)
    }

    /// Integer form: the byte, or -1 NAK, -2 timeout, -3 bus error
    pub fn code(self) -> i16 {
        match self {
            Self::Value(v) => i16::from(v),
            Self::Nak => -1,
            Self::Timeout => -2,
            Self::BusError => -3,
        }
    }
}

impl fmt::Display for DaliResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::Nak => f.write_str("NAK"),
            Self::Timeout => f.write_str("timeout"),
            Self::BusError => f.write_str("bus error"),
        }
    }
}

// ============================================================================
// Physical layer word
// ============================================================================

/// Transmit word: start marker in bit 31, frame in bits 15..31, bit timing
/// constant in the low bits.
pub const fn encode_physical(frame: u16) -> u32 {
    (((frame as u32) << 15) | 0x8000_0000).wrapping_add(88)
}

pub const fn decode_physical(word: u32) -> u16 {
    ((word.wrapping_sub(88) & 0x7FFF_FFFF) >> 15) as u16
}
