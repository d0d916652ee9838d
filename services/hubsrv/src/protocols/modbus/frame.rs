//! RTU frame construction and length inference
//!
//! Frame: `[address][function][payload...][crc_lo][crc_hi]`. Payload
//! fields are big-endian.

use bytes::BufMut;

use super::constants::*;
use super::crc::append_crc;

// ============================================================================
// Length inference
// ============================================================================

/// Total length of a response frame, once enough of it has arrived.
///
/// `None` means more bytes are needed (or the function code gives no way to
/// tell). Exceptions are 5 bytes, reads `5 + byte_count`, writes 8.
pub fn expected_response_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 3 {
        return None;
    }
    let function = buf[1];
    if function & EXCEPTION_FLAG != 0 {
        return Some(5);
    }
    match function {
        FC_READ_COILS
        | FC_READ_DISCRETE_INPUTS
        | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS => Some(5 + usize::from(buf[2])),
        FC_WRITE_SINGLE_COIL
        | FC_WRITE_SINGLE_REGISTER
        | FC_WRITE_MULTIPLE_COILS
        | FC_WRITE_MULTIPLE_REGISTERS => Some(8),
        FC_EXEC_DALI => Some(5),
        _ => None,
    }
}

/// Total length of a request frame.
///
/// Unknown function codes take whatever has arrived, so the responder can
/// still answer them with an exception.
pub fn expected_request_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    match buf[1] {
        FC_READ_COILS
        | FC_READ_DISCRETE_INPUTS
        | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS
        | FC_WRITE_SINGLE_COIL
        | FC_WRITE_SINGLE_REGISTER => Some(8),
        FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
            buf.get(6).map(|&count| 9 + usize::from(count))
        },
        FC_EXEC_DALI => Some(7),
        _ if buf.len() >= 4 => Some(buf.len()),
        _ => None,
    }
}

// ============================================================================
// Requests (master side)
// ============================================================================

fn finish(mut frame: Vec<u8>) -> Vec<u8> {
    append_crc(&mut frame);
    frame
}

pub fn read_request(device: u8, function: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.put_u8(device);
    frame.put_u8(function);
    frame.put_u16(start);
    frame.put_u16(count);
    finish(frame)
}

pub fn read_coils(device: u8, start: u16, count: u16) -> Vec<u8> {
    read_request(device, FC_READ_COILS, start, count)
}

pub fn write_single_coil(device: u8, coil: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.put_u8(device);
    frame.put_u8(FC_WRITE_SINGLE_COIL);
    frame.put_u16(coil);
    frame.put_u16(value);
    finish(frame)
}

/// FC15 with `count` coils packed LSB-first into `packed`
pub fn write_multiple_coils(device: u8, start: u16, count: u16, packed: &[u8]) -> Vec<u8> {
    let byte_count = usize::from(count).div_ceil(8);
    let mut frame = Vec::with_capacity(9 + byte_count);
    frame.put_u8(device);
    frame.put_u8(FC_WRITE_MULTIPLE_COILS);
    frame.put_u16(start);
    frame.put_u16(count);
    frame.put_u8(byte_count as u8);
    for i in 0..byte_count {
        frame.put_u8(packed.get(i).copied().unwrap_or(0));
    }
    finish(frame)
}

pub fn write_single_register(device: u8, register: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.put_u8(device);
    frame.put_u8(FC_WRITE_SINGLE_REGISTER);
    frame.put_u16(register);
    frame.put_u16(value);
    finish(frame)
}

pub fn write_multiple_registers(device: u8, start: u16, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + values.len() * 2);
    frame.put_u8(device);
    frame.put_u8(FC_WRITE_MULTIPLE_REGISTERS);
    frame.put_u16(start);
    frame.put_u16(values.len() as u16);
    frame.put_u8((values.len() * 2) as u8);
    for &v in values {
        frame.put_u16(v);
    }
    finish(frame)
}

pub fn exec_dali(device: u8, dali_frame: u16, send_twice: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7);
    frame.put_u8(device);
    frame.put_u8(FC_EXEC_DALI);
    frame.put_u16(dali_frame);
    frame.put_u8(u8::from(send_twice));
    finish(frame)
}

// ============================================================================
// Responses (responder side)
// ============================================================================

/// FC01/02/03/04 response carrying `data` after the byte count
pub fn read_response(unit: u8, function: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + data.len());
    frame.put_u8(unit);
    frame.put_u8(function);
    frame.put_u8(data.len() as u8);
    frame.put_slice(data);
    finish(frame)
}

/// Write acknowledgement: address, function and the two payload words
pub fn write_response(unit: u8, function: u8, first: u16, second: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.put_u8(unit);
    frame.put_u8(function);
    frame.put_u16(first);
    frame.put_u16(second);
    finish(frame)
}

pub fn exception_response(unit: u8, function: u8, code: u8) -> Vec<u8> {
    finish(vec![unit, function | EXCEPTION_FLAG, code])
}

pub fn exec_dali_response(unit: u8, value: u8) -> Vec<u8> {
    finish(vec![unit, FC_EXEC_DALI, value])
}

/// Big-endian word at `offset`
pub fn word(buf: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(offset)?, *buf.get(offset + 1)?]))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::modbus::crc::verify_frame;

    #[test]
    fn test_read_coils_length_needs_three_bytes() {
        assert_eq!(expected_response_length(&[0x01]), None);
        assert_eq!(expected_response_length(&[0x01, 0x01]), None);
        assert_eq!(expected_response_length(&[0x01, 0x01, 0x04]), Some(9));
        assert_eq!(expected_response_length(&[0x01, 0x03, 0x02, 0x00]), Some(7));
    }

    #[test]
    fn test_fixed_length_responses() {
        assert_eq!(expected_response_length(&[0x01, 0x85, 0x02]), Some(5));
        assert_eq!(expected_response_length(&[0x01, 0x05, 0x00]), Some(8));
        assert_eq!(expected_response_length(&[0x01, 0x0F, 0x00]), Some(8));
        assert_eq!(expected_response_length(&[0x01, 0x41, 0x10]), Some(5));
        assert_eq!(expected_response_length(&[0x01, 0x2B, 0x00]), None);
    }

    #[test]
    fn test_request_lengths() {
        assert_eq!(expected_request_length(&[0x01]), None);
        assert_eq!(expected_request_length(&[0x01, 0x03]), Some(8));
        assert_eq!(expected_request_length(&[0x01, 0x10, 0, 0, 0, 2]), None);
        assert_eq!(expected_request_length(&[0x01, 0x10, 0, 0, 0, 2, 4]), Some(13));
        assert_eq!(expected_request_length(&[0x01, 0x41]), Some(7));
        assert_eq!(expected_request_length(&[0x01, 0x2B, 0x0E, 0x01, 0x00]), Some(5));
    }

    #[test]
    fn test_builders_append_valid_crc() {
        let frame = write_single_coil(1, 0x00AC, COIL_ON);
        assert_eq!(&frame[..6], &[0x01, 0x05, 0x00, 0xAC, 0xFF, 0x00]);
        assert!(verify_frame(&frame));

        let frame = write_multiple_coils(0x11, 0x0013, 10, &[0xCD, 0x01]);
        assert_eq!(&frame[..9], &[0x11, 0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]);
        assert!(verify_frame(&frame));

        let frame = exception_response(1, FC_READ_COILS, EX_ILLEGAL_DATA_ADDRESS);
        assert_eq!(&frame[..3], &[0x01, 0x81, 0x02]);
        assert_eq!(expected_response_length(&frame), Some(frame.len()));
    }

    #[test]
    fn test_response_length_matches_builders() {
        let frame = read_response(1, FC_READ_HOLDING_REGISTERS, &[0, 1, 0, 2]);
        assert_eq!(expected_response_length(&frame), Some(frame.len()));
        let frame = write_response(1, FC_WRITE_SINGLE_REGISTER, 10, 20);
        assert_eq!(expected_response_length(&frame), Some(frame.len()));
        let frame = exec_dali_response(1, 0xFE);
        assert_eq!(expected_response_length(&frame), Some(frame.len()));
    }
}
