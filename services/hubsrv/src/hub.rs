//! Engine host
//!
//! `Hub` owns both buses, the button bank, the scheduler and the shared
//! register image, and is the only code that mutates bus state. One pass:
//! drain pending requests, advance scheduler tasks, then step each bus
//! executor once. Other contexts submit work through a cloneable
//! `EngineHandle` and wait on a oneshot for the terminal result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use errors::{HubError, HubResult};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buttons::{ButtonAction, ButtonBank};
use crate::config::HubConfig;
use crate::core::Scheduler;
use crate::protocols::dali::{DaliBus, DaliBusSimulator, DaliDriver, DaliResponse, Notifier};
use crate::protocols::modbus::{
    CoilValue, ModbusCallback, ModbusMaster, ModbusOutcome, RelayBoardSimulator, SerialLink,
    SerialPortLink,
};
use crate::regs::{shared_registers, SharedRegisters, BINDINGS_HR_BASE, MAX_DISCRETE_INPUTS};
use crate::tasks::HubTask;

/// Requests buffered between passes
const REQUEST_CHANNEL_DEPTH: usize = 64;

pub type BoxedDaliDriver = Box<dyn DaliDriver>;
pub type BoxedSerialLink = Box<dyn SerialLink>;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaliOp {
    Toggle(u8),
    SetOn(u8, bool),
    SetLevel(u8, u8),
    Fade(u8, i8),
    SetMinMax { addr: u8, min: u8, max: u8 },
    SetFadeTimeRate { addr: u8, time: u8, rate: u8 },
    SetExtendedFadeTime { addr: u8, value: u8 },
    SetPowerOnLevel { addr: u8, power_on: u8, system_failure: u8 },
    AddToGroup { addr: u8, group: u8 },
    RemoveFromGroup { addr: u8, group: u8 },
    SetGroups { addr: u8, mask: u16 },
    Raw { frame: u16, send_twice: bool },
}

impl DaliOp {
    fn submit<D: DaliDriver>(self, bus: &mut DaliBus<D>, notify: Notifier) -> HubResult<()> {
        let notify = Some(notify);
        match self {
            Self::Toggle(addr) => bus.toggle(addr, notify),
            Self::SetOn(addr, on) => bus.set_on(addr, on, notify),
            Self::SetLevel(addr, level) => bus.set_level(addr, level, notify),
            Self::Fade(addr, velocity) => bus.fade(addr, velocity, notify),
            Self::SetMinMax { addr, min, max } => bus.set_min_max(addr, min, max, notify),
            Self::SetFadeTimeRate { addr, time, rate } => {
                bus.set_fade_time_rate(addr, time, rate, notify)
            },
            Self::SetExtendedFadeTime { addr, value } => {
                bus.set_extended_fade_time(addr, value, notify)
            },
            Self::SetPowerOnLevel {
                addr,
                power_on,
                system_failure,
            } => bus.set_power_on_level(addr, power_on, system_failure, notify),
            Self::AddToGroup { addr, group } => bus.add_to_group(addr, group, notify),
            Self::RemoveFromGroup { addr, group } => bus.remove_from_group(addr, group, notify),
            Self::SetGroups { addr, mask } => bus.set_groups(addr, mask, notify),
            Self::Raw { frame, send_twice } => bus.exec_raw(frame, send_twice, notify),
        }
    }
}

/// Relay-board operations, addressed to the configured device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusOp {
    SetCoil { coil: u16, value: CoilValue },
    SetCoils { start: u16, count: u16, packed: Vec<u8> },
    GetCoils { start: u16, count: u16 },
}

/// Downstream reply: outcome plus the raw response frame
pub type ModbusReply = (ModbusOutcome, Vec<u8>);

pub enum EngineRequest {
    Dali {
        op: DaliOp,
        reply: oneshot::Sender<HubResult<DaliResponse>>,
    },
    Modbus {
        op: ModbusOp,
        reply: oneshot::Sender<HubResult<ModbusReply>>,
    },
    Enumerate {
        reply: oneshot::Sender<HubResult<bool>>,
    },
    Button {
        index: u16,
        pressed: bool,
        reply: oneshot::Sender<HubResult<()>>,
    },
    Binding {
        index: u16,
        word: u16,
        reply: oneshot::Sender<HubResult<()>>,
    },
}

/// Oneshot reply shared between the submit path and a bus callback, so a
/// rejected submission can still answer after the callback was moved away.
struct SharedReply<T>(Arc<Mutex<Option<oneshot::Sender<HubResult<T>>>>>);

impl<T> Clone for SharedReply<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> SharedReply<T> {
    fn new(tx: oneshot::Sender<HubResult<T>>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    fn send(&self, value: HubResult<T>) {
        if let Some(tx) = self.0.lock().take() {
            // The requester may have timed out and gone away.
            let _ = tx.send(value);
        }
    }
}

// ============================================================================
// EngineHandle
// ============================================================================

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    regs: SharedRegisters,
}

impl EngineHandle {
    /// Read-only access for other contexts; keep the lock short
    pub fn registers(&self) -> &SharedRegisters {
        &self.regs
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<HubResult<T>>) -> EngineRequest,
    ) -> HubResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| HubError::unavailable("engine stopped"))?;
        rx.await
            .map_err(|_| HubError::unavailable("engine dropped the request"))?
    }

    /// Submit a lighting operation and wait for its terminal response
    pub async fn dali(&self, op: DaliOp) -> HubResult<DaliResponse> {
        self.request(|reply| EngineRequest::Dali { op, reply }).await
    }

    pub async fn modbus(&self, op: ModbusOp) -> HubResult<ModbusReply> {
        self.request(|reply| EngineRequest::Modbus { op, reply })
            .await
    }

    /// Start a DALI scan; `false` when one is already running
    pub async fn enumerate(&self) -> HubResult<bool> {
        self.request(|reply| EngineRequest::Enumerate { reply })
            .await
    }

    pub async fn button(&self, index: u16, pressed: bool) -> HubResult<()> {
        self.request(|reply| EngineRequest::Button {
            index,
            pressed,
            reply,
        })
        .await
    }

    /// Store a raw binding word for button `index`
    pub async fn set_binding(&self, index: u16, word: u16) -> HubResult<()> {
        self.request(|reply| EngineRequest::Binding { index, word, reply })
            .await
    }
}

// ============================================================================
// Engine context
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub modbus_device: u8,
    pub coil_count: u16,
    pub warmup: Duration,
    pub coil_refresh: Option<Duration>,
    pub scan_on_startup: bool,
    pub poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for EngineSettings {
    fn from(config: &HubConfig) -> Self {
        let refresh = config.modbus.refresh_interval_secs;
        Self {
            modbus_device: config.modbus.device_address,
            coil_count: config.modbus.coil_count,
            warmup: Duration::from_millis(config.modbus.warmup_ms),
            coil_refresh: (refresh > 0).then(|| Duration::from_secs(refresh)),
            scan_on_startup: config.dali.scan_on_startup,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Everything scheduler tasks operate on
pub struct EngineCtx {
    pub dali: DaliBus<BoxedDaliDriver>,
    pub modbus: ModbusMaster<BoxedSerialLink>,
    pub buttons: ButtonBank,
    pub regs: SharedRegisters,
    pub settings: EngineSettings,
    /// Time of the current pass
    pub now: Instant,
}

impl EngineCtx {
    pub fn read_coils(&mut self) {
        let device = self.settings.modbus_device;
        let count = self.settings.coil_count;
        if let Err(e) = self.modbus.get_coils(device, 0, count, None) {
            warn!("Coil read skipped: {}", e);
        }
    }

    pub fn apply_button_action(&mut self, action: ButtonAction) {
        debug!("Button action {:?}", action);
        let submitted = match action {
            ButtonAction::DaliToggle(addr) => self.dali.toggle(addr, None),
            ButtonAction::DaliFade { address, velocity } => self.dali.fade(address, velocity, None),
            ButtonAction::SetCoil { coil, value } => {
                self.modbus
                    .set_coil(self.settings.modbus_device, coil, value, None)
            },
        };
        if let Err(e) = submitted {
            warn!("Button action {:?} dropped: {}", action, e);
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

pub struct Hub {
    ctx: EngineCtx,
    scheduler: Scheduler<HubTask>,
    requests: mpsc::Receiver<EngineRequest>,
}

impl Hub {
    pub fn new(
        dali: DaliBus<BoxedDaliDriver>,
        modbus: ModbusMaster<BoxedSerialLink>,
        regs: SharedRegisters,
        settings: EngineSettings,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        let ctx = EngineCtx {
            dali,
            modbus,
            buttons: ButtonBank::new(),
            regs: regs.clone(),
            settings,
            now: Instant::now(),
        };
        let hub = Self {
            ctx,
            scheduler: Scheduler::new(),
            requests: rx,
        };
        (hub, EngineHandle { tx, regs })
    }

    /// Build the engine with the links named in `config`. The relay board
    /// is simulated when `simulate` is set or no serial port is configured;
    /// the lighting bus always runs on the simulator in this build.
    pub fn from_config(config: &HubConfig, simulate: bool) -> HubResult<(Self, EngineHandle)> {
        let regs = shared_registers();

        let sim = DaliBusSimulator::with_gear(config.dali.simulate.iter().cloned())?;
        info!(
            "DALI bus simulated with {} device(s)",
            config.dali.simulate.len()
        );
        let dali = DaliBus::new(Box::new(sim) as BoxedDaliDriver, regs.clone())
            .with_response_timeout(config.dali_response_timeout());

        let serial: BoxedSerialLink = match (&config.modbus.port, simulate) {
            (Some(port), false) => Box::new(SerialPortLink::open(port, config.modbus.baud_rate)?),
            _ => {
                info!(
                    "Modbus relay board simulated at address {}",
                    config.modbus.device_address
                );
                Box::new(RelayBoardSimulator::new(
                    config.modbus.device_address,
                    config.modbus.coil_count,
                ))
            },
        };
        let modbus = ModbusMaster::new(serial, regs.clone(), config.modbus.baud_rate)
            .with_response_timeout(config.modbus_response_timeout());

        Ok(Self::new(dali, modbus, regs, EngineSettings::from(config)))
    }

    pub fn context(&self) -> &EngineCtx {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut EngineCtx {
        &mut self.ctx
    }

    pub fn active_tasks(&self) -> usize {
        self.scheduler.len()
    }

    /// Serial warm-up, button scanning and, if configured, the first scan
    pub fn start_default_tasks(&mut self, now: Instant) -> HubResult<()> {
        self.scheduler.start(HubTask::SerialWarmup {
            ready_at: now + self.ctx.settings.warmup,
        })?;
        self.scheduler.start(HubTask::ButtonScan {
            next_at: now + crate::buttons::SCAN_PERIOD,
        })?;
        if self.ctx.settings.scan_on_startup {
            self.start_scan(now)?;
        }
        Ok(())
    }

    /// Start a DALI scan and a task that reports when it finishes
    pub fn start_scan(&mut self, now: Instant) -> HubResult<bool> {
        let started = self.ctx.dali.enumerate()?;
        if started {
            if let Err(e) = self.scheduler.start(HubTask::ScanWatch { started_at: now }) {
                warn!("Scan running without a watcher: {}", e);
            }
        }
        Ok(started)
    }

    /// One engine pass at `now`
    pub fn pass_at(&mut self, now: Instant) {
        while let Ok(request) = self.requests.try_recv() {
            self.handle_request(request, now);
        }

        self.ctx.now = now;
        self.scheduler.run_pass(&mut self.ctx);

        self.ctx.dali.poll_at(now);
        self.ctx.modbus.poll_at(now);
    }

    fn handle_request(&mut self, request: EngineRequest, now: Instant) {
        match request {
            EngineRequest::Dali { op, reply } => {
                debug!("DALI request {:?}", op);
                let reply = SharedReply::new(reply);
                let notify_reply = reply.clone();
                let notify: Notifier = Box::new(move |response| notify_reply.send(Ok(response)));
                if let Err(e) = op.submit(&mut self.ctx.dali, notify) {
                    reply.send(Err(e));
                }
            },
            EngineRequest::Modbus { op, reply } => {
                debug!("Modbus request {:?}", op);
                let reply = SharedReply::new(reply);
                let callback_reply = reply.clone();
                let callback: ModbusCallback = Box::new(move |outcome, response| {
                    callback_reply.send(Ok((outcome, response.to_vec())))
                });
                let device = self.ctx.settings.modbus_device;
                let submitted = match op {
                    ModbusOp::SetCoil { coil, value } => {
                        self.ctx.modbus.set_coil(device, coil, value, Some(callback))
                    },
                    ModbusOp::SetCoils {
                        start,
                        count,
                        packed,
                    } => self
                        .ctx
                        .modbus
                        .set_coils(device, start, count, &packed, Some(callback)),
                    ModbusOp::GetCoils { start, count } => {
                        self.ctx.modbus.get_coils(device, start, count, Some(callback))
                    },
                };
                if let Err(e) = submitted {
                    reply.send(Err(e));
                }
            },
            EngineRequest::Enumerate { reply } => {
                let _ = reply.send(self.start_scan(now));
            },
            EngineRequest::Button {
                index,
                pressed,
                reply,
            } => {
                let result = {
                    let mut regs = self.ctx.regs.lock();
                    if pressed {
                        self.ctx.buttons.press(index, &mut regs)
                    } else {
                        self.ctx.buttons.release(index, &mut regs)
                    }
                };
                let _ = reply.send(result.map(|action| {
                    if let Some(action) = action {
                        self.ctx.apply_button_action(action);
                    }
                }));
            },
            EngineRequest::Binding { index, word, reply } => {
                let result = if usize::from(index) < MAX_DISCRETE_INPUTS {
                    debug!("Binding {} set to {:04X}", index, word);
                    self.ctx
                        .regs
                        .lock()
                        .set_holding(BINDINGS_HR_BASE + index, word);
                    Ok(())
                } else {
                    Err(HubError::invalid_address("binding", index))
                };
                let _ = reply.send(result);
            },
        }
    }

    /// Run passes on a fixed interval until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> HubResult<()> {
        let interval = self.ctx.settings.poll_interval;
        if interval.is_zero() {
            return Err(HubError::config("engine poll interval must be > 0"));
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Engine running, pass every {:?}", interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Engine stopping");
                    break;
                }
                _ = ticker.tick() => self.pass_at(Instant::now()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::buttons::{set_binding, Binding};
    use crate::protocols::dali::SimulatedGear;
    use crate::protocols::modbus::MemoryLink;
    use crate::regs::DaliBank;

    fn build(
        driver: BoxedDaliDriver,
        link: BoxedSerialLink,
        settings: EngineSettings,
    ) -> (Hub, EngineHandle) {
        let regs = shared_registers();
        Hub::new(
            DaliBus::new(driver, regs.clone()),
            ModbusMaster::new(link, regs.clone(), 115_200),
            regs,
            settings,
        )
    }

    fn simulated_hub(gear: Vec<SimulatedGear>) -> (Hub, EngineHandle, RelayBoardSimulator) {
        let board = RelayBoardSimulator::new(1, 32);
        let settings = EngineSettings {
            scan_on_startup: false,
            poll_interval: Duration::from_micros(200),
            ..EngineSettings::default()
        };
        let (hub, handle) = build(
            Box::new(DaliBusSimulator::with_gear(gear).unwrap()),
            Box::new(board.clone()),
            settings,
        );
        (hub, handle, board)
    }

    #[tokio::test]
    async fn test_dali_request_round_trip() {
        let (hub, handle, _) = simulated_hub(vec![SimulatedGear::new(3)]);
        let token = CancellationToken::new();
        let engine = tokio::spawn(hub.run(token.clone()));

        let response = handle.dali(DaliOp::SetLevel(3, 90)).await.unwrap();
        assert_eq!(response, DaliResponse::Value(0));

        let err = handle.dali(DaliOp::Toggle(70)).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidAddress { .. }));

        token.cancel();
        engine.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_modbus_request_updates_board_and_image() {
        let (hub, handle, board) = simulated_hub(Vec::new());
        let regs = handle.registers().clone();
        let token = CancellationToken::new();
        let engine = tokio::spawn(hub.run(token.clone()));

        let (outcome, reply) = handle
            .modbus(ModbusOp::SetCoil {
                coil: 6,
                value: CoilValue::On,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ModbusOutcome::Done);
        assert_eq!(reply.len(), 8);
        assert_eq!(board.coil(6), Some(true));
        assert!(regs.lock().is_coil_set(6));

        token.cancel();
        engine.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_enumerate_reports_running_scan() {
        let (hub, handle, _) = simulated_hub(vec![SimulatedGear::new(0)]);
        let token = CancellationToken::new();
        let engine = tokio::spawn(hub.run(token.clone()));

        assert!(handle.enumerate().await.unwrap());
        assert!(!handle.enumerate().await.unwrap());

        token.cancel();
        engine.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_binding_write_goes_through_engine() {
        let (hub, handle, _) = simulated_hub(Vec::new());
        let token = CancellationToken::new();
        let engine = tokio::spawn(hub.run(token.clone()));

        handle.set_binding(5, 0x4003).await.unwrap();
        assert_eq!(handle.registers().lock().binding(5), 0x4003);
        let err = handle.set_binding(256, 0x4003).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidAddress { .. }));

        token.cancel();
        engine.await.unwrap().unwrap();
    }

    #[test]
    fn test_button_press_toggles_bound_relay() {
        let (mut hub, handle, board) = simulated_hub(Vec::new());
        set_binding(&mut handle.registers().lock(), 0, 2, Binding::Modbus(9)).unwrap();
        let ctx = hub.context_mut();
        let action = ctx
            .buttons
            .press(2, &mut ctx.regs.lock())
            .unwrap()
            .unwrap();
        ctx.apply_button_action(action);

        let now = Instant::now();
        for _ in 0..4 {
            hub.pass_at(now);
        }
        assert_eq!(board.coil(9), Some(true));
        assert!(handle.registers().lock().is_discrete_input_set(2));
    }

    #[test]
    fn test_start_default_tasks_with_scan() {
        let (mut hub, handle) = build(
            Box::new(DaliBusSimulator::with_gear([SimulatedGear::new(1)]).unwrap()),
            Box::new(MemoryLink::new()),
            EngineSettings::default(),
        );
        let now = Instant::now();
        hub.start_default_tasks(now).unwrap();
        assert_eq!(hub.active_tasks(), 3);
        assert!(hub.context().dali.is_scanning());

        for _ in 0..2_000 {
            hub.pass_at(now);
        }
        assert!(!hub.context().dali.is_scanning());
        assert_eq!(hub.active_tasks(), 2);
        assert_eq!(handle.registers().lock().dali(DaliBank::DeviceType, 1), 6);
    }
}
