//! Lighting-bus command engine
//!
//! Composite operations (toggle, fade, scan, two-phase configuration writes)
//! are chains of primitive transactions. Exactly one command is in flight;
//! when its response arrives the command's continuation either arms a
//! follow-up frame, which is sent at once from the same slot, or ends the
//! chain. A finished chain runs its follow-up action (which may enqueue new,
//! independent commands) and then notifies the caller.
//!
//! Chained steps always run before the next queued command, so an
//! operation's frames are never interleaved with another's on the wire.

use std::fmt;
use std::time::{Duration, Instant};

use errors::{HubError, HubResult};
use tracing::{debug, error, info, trace, warn};

use super::commands::{
    self, address_of, direct_arc_power, encode_physical, opcode, status, DaliResponse,
    GearType, DALI_MAX_ADDR,
};
use super::driver::DaliDriver;
use crate::core::CommandQueue;
use crate::regs::{DaliBank, RegisterImage, SharedRegisters};

/// Enough room for a full scan plus its level refreshes
pub const DALI_QUEUE_DEPTH: usize = 70;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Completion callback, invoked once with the chain's terminal response
pub type Notifier = Box<dyn FnOnce(DaliResponse) + Send>;

// ============================================================================
// Chain steps
// ============================================================================

/// Attribute written through the DTR0 + apply pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    MinLevel,
    MaxLevel,
    PowerOnLevel,
    SystemFailureLevel,
    FadeTime,
    FadeRate,
    ExtendedFadeTime,
}

impl Setting {
    fn opcode(self) -> u16 {
        match self {
            Self::MinLevel => opcode::SET_MIN_LEVEL,
            Self::MaxLevel => opcode::SET_MAX_LEVEL,
            Self::PowerOnLevel => opcode::SET_POWER_ON_LEVEL,
            Self::SystemFailureLevel => opcode::SET_SYSTEM_FAILURE_LEVEL,
            Self::FadeTime => opcode::SET_FADE_TIME,
            Self::FadeRate => opcode::SET_FADE_RATE,
            Self::ExtendedFadeTime => opcode::SET_EXTENDED_FADE_TIME,
        }
    }

    fn store(self, regs: &mut RegisterImage, addr: u8, value: u8) {
        match self {
            Self::MinLevel => regs.set_holding_byte(DaliBank::MinMax.register(addr), 0, value),
            Self::MaxLevel => regs.set_holding_byte(DaliBank::MinMax.register(addr), 1, value),
            Self::PowerOnLevel => {
                regs.set_holding_byte(DaliBank::PowerOn.register(addr), 0, value)
            },
            Self::SystemFailureLevel => {
                regs.set_holding_byte(DaliBank::PowerOn.register(addr), 1, value)
            },
            Self::FadeTime => regs.set_holding_nibble(DaliBank::Fade.register(addr), 1, value),
            Self::FadeRate => regs.set_holding_nibble(DaliBank::Fade.register(addr), 0, value),
            Self::ExtendedFadeTime => {
                regs.set_holding_byte(DaliBank::Fade.register(addr), 1, value)
            },
        }
    }
}

/// One or two settings applied back to back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SettingPlan {
    current: (Setting, u8),
    next: Option<(Setting, u8)>,
}

/// Group membership changes still to send, one bus command per group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupPlan {
    add: u16,
    remove: u16,
    group: u8,
    adding: bool,
}

impl GroupPlan {
    fn new(add: u16, remove: u16) -> Self {
        Self {
            add,
            remove,
            group: 0,
            adding: false,
        }
    }

    /// Pick the next group; adds go first, lowest group first
    fn advance(&mut self) -> bool {
        if self.add != 0 {
            self.group = self.add.trailing_zeros() as u8;
            self.add &= !(1 << self.group);
            self.adding = true;
            true
        } else if self.remove != 0 {
            self.group = self.remove.trailing_zeros() as u8;
            self.remove &= !(1 << self.group);
            self.adding = false;
            true
        } else {
            false
        }
    }

    fn frame(&self, addr: u8) -> u16 {
        if self.adding {
            commands::add_to_group(addr, self.group)
        } else {
            commands::remove_from_group(addr, self.group)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanStep {
    DeviceType,
    MinLevel,
    MaxLevel,
    PowerOnLevel,
    SystemFailureLevel,
    FadeTimeRate,
    ExtendedFadeTime,
    GroupsLow,
    GroupsHigh,
}

impl ScanStep {
    fn query(self) -> u16 {
        match self {
            Self::DeviceType => opcode::QUERY_DEVICE_TYPE,
            Self::MinLevel => opcode::QUERY_MIN_LEVEL,
            Self::MaxLevel => opcode::QUERY_MAX_LEVEL,
            Self::PowerOnLevel => opcode::QUERY_POWER_ON_LEVEL,
            Self::SystemFailureLevel => opcode::QUERY_SYSTEM_FAILURE_LEVEL,
            Self::FadeTimeRate => opcode::QUERY_FADE_TIME_RATE,
            Self::ExtendedFadeTime => opcode::QUERY_EXTENDED_FADE_TIME,
            Self::GroupsLow => opcode::QUERY_GROUPS_0_7,
            Self::GroupsHigh => opcode::QUERY_GROUPS_8_15,
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::DeviceType => Some(Self::MinLevel),
            Self::MinLevel => Some(Self::MaxLevel),
            Self::MaxLevel => Some(Self::PowerOnLevel),
            Self::PowerOnLevel => Some(Self::SystemFailureLevel),
            Self::SystemFailureLevel => Some(Self::FadeTimeRate),
            Self::FadeTimeRate => Some(Self::ExtendedFadeTime),
            Self::ExtendedFadeTime => Some(Self::GroupsLow),
            Self::GroupsLow => Some(Self::GroupsHigh),
            Self::GroupsHigh => None,
        }
    }

    fn store(self, regs: &mut RegisterImage, addr: u8, value: u8) {
        let (bank, byte) = match self {
            Self::DeviceType => {
                regs.set_holding(DaliBank::DeviceType.register(addr), u16::from(value));
                return;
            },
            Self::MinLevel => (DaliBank::MinMax, 0),
            Self::MaxLevel => (DaliBank::MinMax, 1),
            Self::PowerOnLevel => (DaliBank::PowerOn, 0),
            Self::SystemFailureLevel => (DaliBank::PowerOn, 1),
            Self::FadeTimeRate => (DaliBank::Fade, 0),
            Self::ExtendedFadeTime => (DaliBank::Fade, 1),
            Self::GroupsLow => (DaliBank::Groups, 0),
            Self::GroupsHigh => (DaliBank::Groups, 1),
        };
        regs.set_holding_byte(bank.register(addr), byte, value);
    }
}

/// Continuation: what the in-flight command does with its next response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Then {
    /// Nothing armed; the chain ends
    Done,
    /// Last frame of the chain; its response is the result
    Finish,
    ToggleLevel,
    RefreshLevel { with_status: bool },
    RefreshStatus,
    Scan(ScanStep),
    /// Group target, diffed against the register image when dequeued
    GroupsTo(u16),
    StageDtr(SettingPlan),
    Apply(SettingPlan),
    Group(GroupPlan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusPoll {
    Always,
    IfFadeable,
}

/// Follow-up once a chain has ended, enqueued as new commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum After {
    Nothing,
    Refresh(StatusPoll),
    ScanNext { found: bool },
}

// ============================================================================
// DaliCommand
// ============================================================================

/// A unit of work for the single-flight executor.
///
/// Commands are moved by value into the queue and then into the in-flight
/// slot; continuations only ever touch the command they belong to.
pub struct DaliCommand {
    addr: u8,
    frame: u16,
    send_twice: bool,
    then: Then,
    after: After,
    notify: Option<Notifier>,
}

impl DaliCommand {
    fn new(addr: u8, frame: u16, then: Then) -> Self {
        Self {
            addr,
            frame,
            send_twice: false,
            then,
            after: After::Nothing,
            notify: None,
        }
    }

    fn twice(mut self) -> Self {
        self.send_twice = true;
        self
    }

    fn after(mut self, after: After) -> Self {
        self.after = after;
        self
    }

    fn notify(mut self, notify: Option<Notifier>) -> Self {
        self.notify = notify;
        self
    }

    /// Arm a follow-up frame, sent immediately from the in-flight slot
    fn arm(&mut self, frame: u16, then: Then, send_twice: bool) {
        self.frame = frame;
        self.then = then;
        self.send_twice = send_twice;
    }

    pub fn frame(&self) -> u16 {
        self.frame
    }
}

impl fmt::Debug for DaliCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaliCommand")
            .field("addr", &self.addr)
            .field("frame", &format_args!("{:04X}", self.frame))
            .field("send_twice", &self.send_twice)
            .field("then", &self.then)
            .field("after", &self.after)
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

struct InFlight {
    command: DaliCommand,
    deadline: Instant,
}

// ============================================================================
// DaliBus
// ============================================================================

pub struct DaliBus<D> {
    driver: D,
    regs: SharedRegisters,
    queue: CommandQueue<DaliCommand, DALI_QUEUE_DEPTH>,
    in_flight: Option<InFlight>,
    response_timeout: Duration,
    scanning: bool,
    scan_found: u8,
    last_scan_found: Option<u8>,
}

fn check_addr(addr: u8) -> HubResult<()> {
    if addr > DALI_MAX_ADDR {
        return Err(HubError::invalid_address("dali", addr));
    }
    Ok(())
}

impl<D: DaliDriver> DaliBus<D> {
    pub fn new(driver: D, regs: SharedRegisters) -> Self {
        Self {
            driver,
            regs,
            queue: CommandQueue::new("dali"),
            in_flight: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            scanning: false,
            scan_found: 0,
            last_scan_found: None,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn registers(&self) -> &SharedRegisters {
        &self.regs
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Devices found by the most recent completed scan
    pub fn last_scan_found(&self) -> Option<u8> {
        self.last_scan_found
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Nothing in flight and nothing queued
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    pub fn is_fadeable(&self, addr: u8) -> bool {
        self.regs.lock().is_fadeable(addr)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Read the level, then switch off if lit or recall the last level if dark
    pub fn toggle(&mut self, addr: u8, notify: Option<Notifier>) -> HubResult<()> {
        check_addr(addr)?;
        let cmd = DaliCommand::new(
            addr,
            commands::command(addr, opcode::QUERY_ACTUAL_LEVEL),
            Then::ToggleLevel,
        )
        .notify(notify);
        self.queue.enqueue(cmd)
    }

    pub fn set_on(&mut self, addr: u8, on: bool, notify: Option<Notifier>) -> HubResult<()> {
        check_addr(addr)?;
        let op = if on {
            opcode::RECALL_LAST_ACTIVE_LEVEL
        } else {
            opcode::OFF
        };
        let cmd = DaliCommand::new(addr, commands::command(addr, op), Then::Finish)
            .after(After::Refresh(StatusPoll::IfFadeable))
            .notify(notify);
        self.queue.enqueue(cmd)
    }

    /// Direct arc power to `level`
    pub fn set_level(&mut self, addr: u8, level: u8, notify: Option<Notifier>) -> HubResult<()> {
        check_addr(addr)?;
        let cmd = DaliCommand::new(addr, direct_arc_power(addr, level), Then::Finish)
            .after(After::Refresh(StatusPoll::IfFadeable))
            .notify(notify);
        self.queue.enqueue(cmd)
    }

    /// Start fading up (`velocity > 0`) or down, then poll until the fade ends
    pub fn fade(&mut self, addr: u8, velocity: i8, notify: Option<Notifier>) -> HubResult<()> {
        check_addr(addr)?;
        let op = if velocity > 0 { opcode::UP } else { opcode::DOWN };
        let cmd = DaliCommand::new(addr, commands::command(addr, op), Then::Finish)
            .after(After::Refresh(StatusPoll::Always))
            .notify(notify);
        self.queue.enqueue(cmd)
    }

    /// Scan addresses 0..=63; `Ok(false)` when a scan is already running
    pub fn enumerate(&mut self) -> HubResult<bool> {
        if self.scanning {
            debug!("DALI scan already running");
            return Ok(false);
        }
        self.queue.enqueue(Self::scan_command(0))?;
        self.scanning = true;
        self.scan_found = 0;
        info!("DALI scan started");
        Ok(true)
    }

    pub fn set_min_max(
        &mut self,
        addr: u8,
        min: u8,
        max: u8,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        if min > max {
            return Err(HubError::invalid_value(
                "min/max",
                format!("min {} above max {}", min, max),
            ));
        }
        self.apply_settings(
            addr,
            (Setting::MinLevel, min),
            Some((Setting::MaxLevel, max)),
            notify,
        )
    }

    /// Fade time and rate are 4-bit codes
    pub fn set_fade_time_rate(
        &mut self,
        addr: u8,
        time: u8,
        rate: u8,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        if time > 0x0F || rate > 0x0F {
            return Err(HubError::invalid_value(
                "fade time/rate",
                format!("time {} rate {} exceed 15", time, rate),
            ));
        }
        self.apply_settings(
            addr,
            (Setting::FadeTime, time),
            Some((Setting::FadeRate, rate)),
            notify,
        )
    }

    pub fn set_extended_fade_time(
        &mut self,
        addr: u8,
        value: u8,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        self.apply_settings(addr, (Setting::ExtendedFadeTime, value), None, notify)
    }

    pub fn set_power_on_level(
        &mut self,
        addr: u8,
        power_on: u8,
        system_failure: u8,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        self.apply_settings(
            addr,
            (Setting::PowerOnLevel, power_on),
            Some((Setting::SystemFailureLevel, system_failure)),
            notify,
        )
    }

    pub fn add_to_group(&mut self, addr: u8, group: u8, notify: Option<Notifier>) -> HubResult<()> {
        check_group(group)?;
        self.change_groups(addr, 1 << group, 0, notify)
    }

    pub fn remove_from_group(
        &mut self,
        addr: u8,
        group: u8,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        check_group(group)?;
        self.change_groups(addr, 0, 1 << group, notify)
    }

    /// Bring group membership to `mask`, one add/remove per differing group.
    ///
    /// The diff is taken when the command reaches the bus, so group changes
    /// queued ahead of it are already reflected.
    pub fn set_groups(&mut self, addr: u8, mask: u16, notify: Option<Notifier>) -> HubResult<()> {
        check_addr(addr)?;
        let cmd = DaliCommand::new(
            addr,
            commands::command(addr, opcode::QUERY_GROUPS_0_7),
            Then::GroupsTo(mask),
        )
        .notify(notify);
        self.queue.enqueue(cmd)
    }

    /// Send a raw 16-bit forward frame; the notifier gets the reply
    pub fn exec_raw(
        &mut self,
        frame: u16,
        send_twice: bool,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        let mut cmd =
            DaliCommand::new(address_of(frame), frame, Then::Finish).notify(notify);
        cmd.send_twice = send_twice;
        self.queue.enqueue(cmd)
    }

    fn apply_settings(
        &mut self,
        addr: u8,
        current: (Setting, u8),
        next: Option<(Setting, u8)>,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        check_addr(addr)?;
        let plan = SettingPlan { current, next };
        let cmd = DaliCommand::new(addr, commands::set_dtr0(current.1), Then::StageDtr(plan))
            .notify(notify);
        self.queue.enqueue(cmd)
    }

    fn change_groups(
        &mut self,
        addr: u8,
        add: u16,
        remove: u16,
        notify: Option<Notifier>,
    ) -> HubResult<()> {
        check_addr(addr)?;
        let mut plan = GroupPlan::new(add, remove);
        if !plan.advance() {
            return Ok(());
        }
        let cmd = DaliCommand::new(addr, plan.frame(addr), Then::Group(plan))
            .twice()
            .notify(notify);
        self.queue.enqueue(cmd)
    }

    fn scan_command(addr: u8) -> DaliCommand {
        DaliCommand::new(
            addr,
            commands::command(addr, ScanStep::DeviceType.query()),
            Then::Scan(ScanStep::DeviceType),
        )
        .after(After::ScanNext { found: false })
    }

    fn refresh_command(addr: u8, with_status: bool) -> DaliCommand {
        DaliCommand::new(
            addr,
            commands::command(addr, opcode::QUERY_ACTUAL_LEVEL),
            Then::RefreshLevel { with_status },
        )
    }

    // ------------------------------------------------------------------
    // Executor
    // ------------------------------------------------------------------

    /// Advance the executor by one step.
    ///
    /// With nothing in flight, the next queued command is transmitted.
    /// Otherwise the in-flight command's response (or timeout) is handled.
    pub fn poll_at(&mut self, now: Instant) {
        match self.in_flight.take() {
            Some(flight) => {
                let response = match self.driver.receive() {
                    Some(raw) => DaliResponse::from_raw(raw),
                    None if now >= flight.deadline => DaliResponse::Timeout,
                    None => {
                        self.in_flight = Some(flight);
                        return;
                    },
                };
                self.handle_response(flight.command, response, now);
            },
            None => {
                if let Some(command) = self.queue.dequeue().and_then(|c| self.prepare(c)) {
                    self.transmit(command, now);
                }
            },
        }
    }

    /// Resolve a dequeued command whose first frame depends on current state
    fn prepare(&mut self, mut command: DaliCommand) -> Option<DaliCommand> {
        let Then::GroupsTo(mask) = command.then else {
            return Some(command);
        };
        let addr = command.addr;
        let current = self.regs.lock().dali(DaliBank::Groups, addr);
        let diff = current ^ mask;
        let mut plan = GroupPlan::new(diff & mask, diff & current);
        if plan.advance() {
            command.arm(plan.frame(addr), Then::Group(plan), true);
            Some(command)
        } else {
            debug!("DALI {} groups already {:04X}", addr, mask);
            command.then = Then::Done;
            self.finish(command, DaliResponse::Value(0));
            None
        }
    }

    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    fn transmit(&mut self, command: DaliCommand, now: Instant) {
        debug!(
            "DALI tx {:04X} addr {}{}",
            command.frame,
            command.addr,
            if command.send_twice { " (twice)" } else { "" }
        );
        self.driver.reset();
        match self.driver.transmit(encode_physical(command.frame)) {
            Ok(()) => {
                self.in_flight = Some(InFlight {
                    command,
                    deadline: now + self.response_timeout,
                });
            },
            Err(e) => {
                error!("DALI transmit failed: {}", e);
                self.handle_response(command, DaliResponse::BusError, now);
            },
        }
    }

    fn handle_response(&mut self, mut command: DaliCommand, response: DaliResponse, now: Instant) {
        trace!("DALI rx {} for {:04X}", response, command.frame);

        if command.send_twice && response.permits_repeat() {
            command.send_twice = false;
            self.transmit(command, now);
            return;
        }

        let then = std::mem::replace(&mut command.then, Then::Done);
        self.resume(&mut command, then, response);

        if command.then == Then::Done {
            self.finish(command, response);
        } else {
            self.transmit(command, now);
        }
    }

    /// Run one continuation; it may arm a follow-up frame on `cmd`
    fn resume(&mut self, cmd: &mut DaliCommand, then: Then, response: DaliResponse) {
        let addr = cmd.addr;
        match then {
            Then::Done | Then::Finish | Then::GroupsTo(_) => {},

            Then::ToggleLevel => match response {
                DaliResponse::Value(level) => {
                    let op = if level > 0 {
                        opcode::OFF
                    } else {
                        opcode::RECALL_LAST_ACTIVE_LEVEL
                    };
                    cmd.arm(commands::command(addr, op), Then::Finish, false);
                    cmd.after = After::Refresh(StatusPoll::IfFadeable);
                },
                other => debug!("DALI {} toggle aborted: {}", addr, other),
            },

            Then::RefreshLevel { with_status } => {
                match response {
                    DaliResponse::Value(level) => self
                        .regs
                        .lock()
                        .set_holding_byte(DaliBank::Status.register(addr), 0, level),
                    other => debug!("DALI {} level query failed: {}", addr, other),
                }
                // Status is read even without a level, or a stale fade bit sticks
                if with_status {
                    cmd.arm(
                        commands::command(addr, opcode::QUERY_STATUS),
                        Then::RefreshStatus,
                        false,
                    );
                }
            },

            Then::RefreshStatus => {
                if let DaliResponse::Value(bits) = response {
                    self.regs
                        .lock()
                        .set_holding_byte(DaliBank::Status.register(addr), 1, bits);
                    if bits & status::FADE_IN_PROGRESS != 0 {
                        // A fresh queue entry, so a long fade cannot starve others.
                        cmd.after = After::Refresh(StatusPoll::Always);
                    }
                }
            },

            Then::Scan(step) => match response {
                DaliResponse::Value(value) => {
                    step.store(&mut self.regs.lock(), addr, value);
                    match step.next() {
                        Some(next) => {
                            cmd.arm(commands::command(addr, next.query()), Then::Scan(next), false)
                        },
                        None => cmd.after = After::ScanNext { found: true },
                    }
                },
                other => {
                    trace!("DALI {} absent ({:?} -> {})", addr, step, other);
                    self.regs.lock().mark_absent(addr);
                },
            },

            Then::StageDtr(plan) => {
                // DTR writes are broadcast; no backward frame is expected.
                if response.permits_repeat() {
                    let (setting, _) = plan.current;
                    cmd.arm(
                        commands::command(addr, setting.opcode()),
                        Then::Apply(plan),
                        true,
                    );
                } else {
                    warn!("DALI {} DTR0 write failed: {}", addr, response);
                }
            },

            Then::Apply(plan) => {
                let (setting, value) = plan.current;
                if response.is_value() {
                    setting.store(&mut self.regs.lock(), addr, value);
                    if let Some(next) = plan.next {
                        cmd.arm(
                            commands::set_dtr0(next.1),
                            Then::StageDtr(SettingPlan {
                                current: next,
                                next: None,
                            }),
                            false,
                        );
                    }
                } else {
                    warn!("DALI {} {:?} not confirmed: {}", addr, setting, response);
                }
            },

            Then::Group(mut plan) => {
                if response.is_value() {
                    let reg = DaliBank::Groups.register(addr);
                    let mut regs = self.regs.lock();
                    if plan.adding {
                        regs.set_holding_bit(reg, plan.group);
                    } else {
                        regs.clear_holding_bit(reg, plan.group);
                    }
                    drop(regs);
                    if plan.advance() {
                        cmd.arm(plan.frame(addr), Then::Group(plan), true);
                    }
                } else {
                    warn!("DALI {} group {} change failed: {}", addr, plan.group, response);
                }
            },
        }
    }

    fn finish(&mut self, mut command: DaliCommand, response: DaliResponse) {
        let addr = command.addr;
        match command.after {
            After::Nothing => {},
            After::Refresh(poll) => {
                let with_status = match poll {
                    StatusPoll::Always => true,
                    StatusPoll::IfFadeable => self.is_fadeable(addr),
                };
                self.request_refresh(addr, with_status);
            },
            After::ScanNext { found } => {
                if found {
                    self.scan_found += 1;
                    let gear_type = self.regs.lock().dali(DaliBank::DeviceType, addr) as u8;
                    debug!("DALI device {} discovered: {:?}", addr, GearType::from(gear_type));
                    self.request_refresh(addr, true);
                }
                self.scan_next(addr);
            },
        }

        if let Some(notify) = command.notify.take() {
            notify(response);
        }
    }

    fn request_refresh(&mut self, addr: u8, with_status: bool) {
        if let Err(e) = self.queue.enqueue(Self::refresh_command(addr, with_status)) {
            warn!("DALI {} level refresh skipped: {}", addr, e);
        }
    }

    fn scan_next(&mut self, addr: u8) {
        if addr >= DALI_MAX_ADDR {
            self.end_scan();
            return;
        }
        if let Err(e) = self.queue.enqueue(Self::scan_command(addr + 1)) {
            warn!("DALI scan aborted at {}: {}", addr + 1, e);
            self.end_scan();
        }
    }

    fn end_scan(&mut self) {
        self.scanning = false;
        self.last_scan_found = Some(self.scan_found);
        info!("DALI scan complete, {} device(s)", self.scan_found);
    }
}

fn check_group(group: u8) -> HubResult<()> {
    if group > 15 {
        return Err(HubError::invalid_value("group", format!("{} exceeds 15", group)));
    }
    Ok(())
}
