//! Modbus RTU constants used by the relay master and the register responder

use std::time::Duration;

// ============================================================================
// Function codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Vendor function: execute a raw lighting-bus frame
///
/// Request `[unit, 0x41, frame_hi, frame_lo, flags, crc_lo, crc_hi]`, flags
/// bit 0 requesting a repeated transmission. Response
/// `[unit, 0x41, value, crc_lo, crc_hi]`.
pub const FC_EXEC_DALI: u8 = 0x41;

/// Set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Exception codes
// ============================================================================

pub const EX_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EX_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EX_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EX_SERVER_DEVICE_FAILURE: u8 = 0x04;
pub const EX_SERVER_DEVICE_BUSY: u8 = 0x06;
pub const EX_NEGATIVE_ACKNOWLEDGE: u8 = 0x07;
pub const EX_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Coil values (FC05)
// ============================================================================

pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;
/// Relay-board extension: invert the output
pub const COIL_TOGGLE: u16 = 0x5500;

// ============================================================================
// Limits and timing
// ============================================================================

pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_REGISTERS: u16 = 123;
pub const MAX_READ_COILS: u16 = 2000;
pub const MAX_WRITE_COILS: u16 = 1968;

/// Largest RTU ADU
pub const MAX_ADU_SIZE: usize = 256;

pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Inter-frame silence floor
pub const MIN_FRAME_GAP: Duration = Duration::from_micros(1750);

/// 1.75 characters of 11 bits at `baud`, never below the floor
pub fn frame_gap(baud: u32) -> Duration {
    if baud == 0 {
        return MIN_FRAME_GAP;
    }
    let gap = Duration::from_micros(19_250_000 / u64::from(baud));
    gap.max(MIN_FRAME_GAP)
}
