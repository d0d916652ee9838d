//! Simulated RS-485 relay board
//!
//! Answers coil reads and writes for one device address, the way the relay
//! boards on the hub's serial bus do. Frames for other addresses and frames
//! with a bad CRC get no answer.

use std::collections::VecDeque;
use std::sync::Arc;

use errors::HubResult;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::constants::*;
use super::crc::verify_frame;
use super::frame::{self, word};
use super::link::SerialLink;

#[derive(Debug)]
struct Board {
    address: u8,
    coils: Vec<bool>,
    outgoing: VecDeque<u8>,
}

impl Board {
    fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if !verify_frame(request) || request[0] != self.address {
            return None;
        }
        let function = request[1];
        let reply = match function {
            FC_READ_COILS => self.read(request),
            FC_WRITE_SINGLE_COIL => self.write_single(request),
            FC_WRITE_MULTIPLE_COILS => self.write_multiple(request),
            _ => Err(EX_ILLEGAL_FUNCTION),
        };
        Some(reply.unwrap_or_else(|code| frame::exception_response(self.address, function, code)))
    }

    fn range(&self, start: u16, count: u16) -> Result<std::ops::Range<usize>, u8> {
        let start = usize::from(start);
        let end = start + usize::from(count);
        if count == 0 || end > self.coils.len() {
            return Err(EX_ILLEGAL_DATA_ADDRESS);
        }
        Ok(start..end)
    }

    fn read(&self, request: &[u8]) -> Result<Vec<u8>, u8> {
        let (start, count) = word(request, 2).zip(word(request, 4)).ok_or(EX_ILLEGAL_DATA_VALUE)?;
        let range = self.range(start, count)?;
        let mut packed = vec![0u8; usize::from(count).div_ceil(8)];
        for (i, on) in self.coils[range].iter().enumerate() {
            if *on {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        Ok(frame::read_response(self.address, FC_READ_COILS, &packed))
    }

    fn write_single(&mut self, request: &[u8]) -> Result<Vec<u8>, u8> {
        let (coil, value) = word(request, 2).zip(word(request, 4)).ok_or(EX_ILLEGAL_DATA_VALUE)?;
        let index = self.range(coil, 1)?.start;
        match value {
            COIL_ON => self.coils[index] = true,
            COIL_OFF => self.coils[index] = false,
            COIL_TOGGLE => self.coils[index] = !self.coils[index],
            _ => return Err(EX_ILLEGAL_DATA_VALUE),
        }
        Ok(frame::write_response(
            self.address,
            FC_WRITE_SINGLE_COIL,
            coil,
            value,
        ))
    }

    fn write_multiple(&mut self, request: &[u8]) -> Result<Vec<u8>, u8> {
        let (start, count) = word(request, 2).zip(word(request, 4)).ok_or(EX_ILLEGAL_DATA_VALUE)?;
        let range = self.range(start, count)?;
        let byte_count = usize::from(*request.get(6).ok_or(EX_ILLEGAL_DATA_VALUE)?);
        if byte_count != usize::from(count).div_ceil(8) {
            return Err(EX_ILLEGAL_DATA_VALUE);
        }
        let data = request.get(7..7 + byte_count).ok_or(EX_ILLEGAL_DATA_VALUE)?;
        for (i, index) in range.enumerate() {
            self.coils[index] = data[i / 8] & (1 << (i % 8)) != 0;
        }
        Ok(frame::write_response(
            self.address,
            FC_WRITE_MULTIPLE_COILS,
            start,
            count,
        ))
    }
}

/// Relay board on an in-memory bus; clones share the same board
#[derive(Debug, Clone)]
pub struct RelayBoardSimulator {
    board: Arc<Mutex<Board>>,
}

impl RelayBoardSimulator {
    pub fn new(address: u8, coil_count: u16) -> Self {
        debug!(
            "Simulated relay board at address {} with {} coils",
            address, coil_count
        );
        Self {
            board: Arc::new(Mutex::new(Board {
                address,
                coils: vec![false; usize::from(coil_count)],
                outgoing: VecDeque::new(),
            })),
        }
    }

    pub fn coil(&self, index: u16) -> Option<bool> {
        self.board.lock().coils.get(usize::from(index)).copied()
    }

    pub fn set_coil(&self, index: u16, on: bool) {
        if let Some(coil) = self.board.lock().coils.get_mut(usize::from(index)) {
            *coil = on;
        }
    }
}

impl SerialLink for RelayBoardSimulator {
    fn write_frame(&mut self, request: &[u8]) -> HubResult<()> {
        let mut board = self.board.lock();
        let reply = board.handle(request);
        trace!("sim relay {:02X?} -> {:02X?}", request, reply);
        if let Some(reply) = reply {
            board.outgoing.extend(reply);
        }
        Ok(())
    }

    fn read_byte(&mut self) -> HubResult<Option<u8>> {
        Ok(self.board.lock().outgoing.pop_front())
    }

    fn clear_input(&mut self) -> HubResult<()> {
        self.board.lock().outgoing.clear();
        Ok(())
    }
}
