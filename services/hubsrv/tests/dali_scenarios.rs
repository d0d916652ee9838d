//! Lighting-bus command engine scenarios against a scripted physical layer

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hubsrv::protocols::dali::commands::{self, opcode, status};
use hubsrv::protocols::dali::{DaliBus, DaliResponse, Notifier, ScriptedDriver};
use hubsrv::regs::{shared_registers, DaliBank, ABSENT};

fn bus() -> (DaliBus<ScriptedDriver>, ScriptedDriver) {
    let script = ScriptedDriver::new();
    (DaliBus::new(script.clone(), shared_registers()), script)
}

/// Poll at a fixed instant until the queue drains
fn drain(bus: &mut DaliBus<ScriptedDriver>, now: Instant) {
    for _ in 0..10_000 {
        if bus.is_idle() {
            return;
        }
        bus.poll_at(now);
    }
    panic!("bus never went idle");
}

fn capture() -> (Notifier, Arc<Mutex<Option<DaliResponse>>>) {
    let slot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    (Box::new(move |r| *sink.lock() = Some(r)), slot)
}

#[test]
fn fade_refreshes_until_fade_bit_clears() {
    let (mut bus, script) = bus();
    script
        .reply(0) // UP acknowledged
        .reply(100) // level while fading
        .reply(status::FADE_IN_PROGRESS)
        .reply(150) // level after the fade
        .reply(0); // status, fade finished

    bus.fade(3, 1, None).unwrap();
    drain(&mut bus, Instant::now());

    let level = commands::command(3, opcode::QUERY_ACTUAL_LEVEL);
    let stat = commands::command(3, opcode::QUERY_STATUS);
    assert_eq!(
        script.sent(),
        vec![commands::command(3, opcode::UP), level, stat, level, stat]
    );
    let regs = bus.registers().lock();
    assert_eq!(regs.dali(DaliBank::Status, 3), 150);
    assert_eq!(script.remaining(), 0);
}

#[test]
fn enumerate_finds_single_device() {
    let (mut bus, script) = bus();
    for _ in 0..7 {
        script.nak();
    }
    // Device type, min, max, power-on, system failure, fade, ext fade, groups
    for value in [6, 10, 250, 254, 200, 0x27, 0, 0x03, 0x00] {
        script.reply(value);
    }
    // Level and status refresh of the new device
    script.reply(128).reply(0);
    for _ in 8..64 {
        script.nak();
    }

    assert!(bus.enumerate().unwrap());
    assert!(bus.is_scanning());
    drain(&mut bus, Instant::now());

    assert!(!bus.is_scanning());
    assert_eq!(bus.last_scan_found(), Some(1));
    assert_eq!(script.sent().len(), 7 + 9 + 2 + 56);

    let regs = bus.registers().lock();
    assert_eq!(regs.dali(DaliBank::DeviceType, 7), 6);
    assert_eq!(regs.dali(DaliBank::MinMax, 7), 0xFA0A);
    assert_eq!(regs.dali(DaliBank::PowerOn, 7), 0xC8FE);
    assert_eq!(regs.dali(DaliBank::Fade, 7), 0x0027);
    assert_eq!(regs.dali(DaliBank::Groups, 7), 0x0003);
    assert_eq!(regs.dali(DaliBank::Status, 7), 128);
    for addr in (0..64).filter(|&a| a != 7) {
        assert_eq!(regs.dali(DaliBank::MinMax, addr), ABSENT, "address {}", addr);
        assert_eq!(regs.dali(DaliBank::Status, addr), ABSENT, "address {}", addr);
    }
}

#[test]
fn scan_step_timeout_moves_to_next_address() {
    let (mut bus, script) = bus();
    // Address 0 answers the type query, then goes quiet
    script.reply(6).silence();
    for _ in 1..64 {
        script.nak();
    }
    bus.enumerate().unwrap();

    let mut now = Instant::now();
    for _ in 0..10_000 {
        if bus.is_idle() {
            break;
        }
        bus.poll_at(now);
        now += Duration::from_millis(10);
    }

    assert!(bus.is_idle());
    assert_eq!(bus.last_scan_found(), Some(0));
    assert_eq!(script.sent().len(), 2 + 63);
    let regs = bus.registers().lock();
    assert_eq!(regs.dali(DaliBank::DeviceType, 0), ABSENT);
    assert_eq!(regs.dali(DaliBank::MinMax, 0), ABSENT);
}

#[test]
fn chain_finishes_before_next_queued_command() {
    let (mut bus, script) = bus();
    script.reply(0).reply(0).reply(0).reply(200).reply(10);

    bus.toggle(4, None).unwrap();
    bus.set_level(5, 10, None).unwrap();
    drain(&mut bus, Instant::now());

    assert_eq!(
        script.sent(),
        vec![
            commands::command(4, opcode::QUERY_ACTUAL_LEVEL),
            commands::command(4, opcode::RECALL_LAST_ACTIVE_LEVEL),
            commands::direct_arc_power(5, 10),
            commands::command(4, opcode::QUERY_ACTUAL_LEVEL),
            commands::command(5, opcode::QUERY_ACTUAL_LEVEL),
        ]
    );
    let regs = bus.registers().lock();
    assert_eq!(regs.dali(DaliBank::Status, 4) & 0xFF, 200);
    assert_eq!(regs.dali(DaliBank::Status, 5) & 0xFF, 10);
}

#[test]
fn config_frame_repeats_after_nak_but_not_after_timeout() {
    let (mut bus, script) = bus();
    let start = Instant::now();

    script.nak().reply(0);
    let (notify, result) = capture();
    bus.add_to_group(2, 5, Some(notify)).unwrap();
    drain(&mut bus, start);

    let frame = commands::add_to_group(2, 5);
    assert_eq!(script.take_sent(), vec![frame, frame]);
    assert_eq!(*result.lock(), Some(DaliResponse::Value(0)));
    assert_eq!(bus.registers().lock().dali(DaliBank::Groups, 2), 1 << 5);

    script.silence();
    let (notify, result) = capture();
    bus.add_to_group(2, 6, Some(notify)).unwrap();
    bus.poll_at(start);
    bus.poll_at(start);
    assert!(bus.is_busy());
    bus.poll_at(start + Duration::from_millis(150));

    assert!(bus.is_idle());
    assert_eq!(script.take_sent(), vec![commands::add_to_group(2, 6)]);
    assert_eq!(*result.lock(), Some(DaliResponse::Timeout));
    assert_eq!(bus.registers().lock().dali(DaliBank::Groups, 2), 1 << 5);
}

#[test]
fn queue_rejects_the_seventy_first_command() {
    let (mut bus, _) = bus();
    for _ in 0..70 {
        bus.set_level(1, 1, None).unwrap();
    }
    let err = bus.set_level(1, 1, None).unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(bus.queued(), 70);
}
