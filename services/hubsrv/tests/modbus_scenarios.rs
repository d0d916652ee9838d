//! Relay-board master scenarios over in-memory and simulated links

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hubsrv::protocols::modbus::crc::append_crc;
use hubsrv::protocols::modbus::frame;
use hubsrv::protocols::modbus::{
    CoilValue, MemoryLink, ModbusCallback, ModbusMaster, ModbusOutcome, RelayBoardSimulator,
};
use hubsrv::regs::{shared_registers, SharedRegisters};

fn master(baud: u32) -> (ModbusMaster<MemoryLink>, MemoryLink, SharedRegisters) {
    let link = MemoryLink::new();
    let regs = shared_registers();
    (
        ModbusMaster::new(link.clone(), regs.clone(), baud),
        link,
        regs,
    )
}

fn with_crc(bytes: &[u8]) -> Vec<u8> {
    let mut frame = bytes.to_vec();
    append_crc(&mut frame);
    frame
}

fn capture() -> (ModbusCallback, Arc<Mutex<Option<ModbusOutcome>>>) {
    let slot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    (
        Box::new(move |outcome, _| *sink.lock() = Some(outcome)),
        slot,
    )
}

#[test]
fn corrupted_read_response_is_invalid_crc() {
    let (mut master, link, regs) = master(9600);
    let mut reply = with_crc(&[0x01, 0x01, 0x04, 0xFF, 0xFF, 0xFF, 0xFF]);
    assert_eq!(reply.len(), 9);
    reply[8] ^= 0x5A;
    link.queue_reply(reply);

    let (callback, outcome) = capture();
    master.get_coils(1, 0, 32, Some(callback)).unwrap();
    let now = Instant::now();
    master.poll_at(now);
    master.poll_at(now);

    assert_eq!(*outcome.lock(), Some(ModbusOutcome::InvalidCrc));
    assert!(!regs.lock().is_coil_set(0));
}

#[test]
fn response_length_inferred_from_partial_frames() {
    let (mut master, link, regs) = master(115_200);
    let (callback, outcome) = capture();
    master.get_coils(1, 0, 16, Some(callback)).unwrap();

    let now = Instant::now();
    master.poll_at(now);
    let reply = with_crc(&[0x01, 0x01, 0x02, 0b0000_0101, 0b1000_0000]);

    link.inject(&reply[..2]);
    master.poll_at(now);
    assert_eq!(*outcome.lock(), None);

    link.inject(&reply[2..5]);
    master.poll_at(now);
    assert_eq!(*outcome.lock(), None);

    link.inject(&reply[5..]);
    master.poll_at(now);
    assert_eq!(*outcome.lock(), Some(ModbusOutcome::Done));

    let regs = regs.lock();
    assert!(regs.is_coil_set(0));
    assert!(!regs.is_coil_set(1));
    assert!(regs.is_coil_set(2));
    assert!(regs.is_coil_set(15));
}

#[test]
fn exception_response_ends_after_five_bytes() {
    let (mut master, link, regs) = master(115_200);
    link.queue_reply(with_crc(&[0x01, 0x85, 0x02]));
    let (callback, outcome) = capture();
    master.set_coil(1, 3, CoilValue::On, Some(callback)).unwrap();
    let now = Instant::now();
    master.poll_at(now);
    master.poll_at(now);

    assert_eq!(*outcome.lock(), Some(ModbusOutcome::Exception(0x02)));
    assert!(!regs.lock().is_coil_set(3));
}

#[test]
fn inter_frame_gap_holds_next_request() {
    let (mut master, link, _) = master(9600);
    link.queue_reply(frame::write_single_coil(1, 0, 0xFF00));
    link.queue_reply(frame::write_single_coil(1, 1, 0xFF00));
    master.set_coil(1, 0, CoilValue::On, None).unwrap();
    master.set_coil(1, 1, CoilValue::On, None).unwrap();

    let start = Instant::now();
    master.poll_at(start);
    master.poll_at(start);
    assert_eq!(link.written().len(), 1);

    // 9600 baud: 1.75 character times is about 2 ms
    master.poll_at(start + Duration::from_millis(1));
    master.poll_at(start + Duration::from_millis(1));
    assert_eq!(link.written().len(), 1);

    let later = start + Duration::from_millis(3);
    master.poll_at(later);
    master.poll_at(later);
    assert_eq!(link.written().len(), 2);
}

#[test]
fn silent_device_times_out() {
    let (mut master, link, _) = master(9600);
    let (callback, outcome) = capture();
    master.set_coil(1, 0, CoilValue::Toggle, Some(callback)).unwrap();

    let start = Instant::now();
    master.poll_at(start);
    master.poll_at(start + Duration::from_millis(50));
    assert_eq!(*outcome.lock(), None);
    master.poll_at(start + Duration::from_millis(100));

    assert_eq!(*outcome.lock(), Some(ModbusOutcome::Timeout));
    assert_eq!(link.written().len(), 1);
}

#[test]
fn relay_board_round_trip() {
    let board = RelayBoardSimulator::new(1, 16);
    let regs = shared_registers();
    let mut master = ModbusMaster::new(board.clone(), regs.clone(), 115_200);

    master.set_coils(1, 0, 10, &[0b0000_0011, 0b10], None).unwrap();
    master.set_coil(1, 0, CoilValue::Toggle, None).unwrap();
    let (callback, outcome) = capture();
    master.get_coils(1, 0, 16, Some(callback)).unwrap();

    let mut now = Instant::now();
    for _ in 0..20 {
        master.poll_at(now);
        now += Duration::from_millis(1);
    }

    assert_eq!(*outcome.lock(), Some(ModbusOutcome::Done));
    assert_eq!(board.coil(0), Some(false));
    assert_eq!(board.coil(1), Some(true));
    assert_eq!(board.coil(9), Some(true));
    let regs = regs.lock();
    assert!(!regs.is_coil_set(0));
    assert!(regs.is_coil_set(1));
    assert!(regs.is_coil_set(9));
    assert!(!regs.is_coil_set(10));
}
