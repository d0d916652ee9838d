//! In-memory lighting bus used by `--simulate` and the scenario tests
//!
//! Models enough of control gear behaviour for the engine's operations:
//! queries answer from device state, configuration commands take effect only
//! when received twice in a row, and level changes fade over a couple of
//! status polls.

use std::collections::BTreeMap;
use std::sync::Arc;

use errors::{HubError, HubResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::commands::{
    address_of, decode_physical, is_special, needs_repeat, opcode, status, DALI_MAX_ADDR,
    RAW_NO_BACKWARD_FRAME,
};
use super::driver::DaliDriver;

/// Status polls a level change stays in progress
const FADE_POLLS: u8 = 2;

fn default_max() -> u8 {
    254
}

fn default_min() -> u8 {
    1
}

/// One simulated control gear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedGear {
    pub address: u8,
    #[serde(default = "default_gear_type")]
    pub gear_type: u8,
    #[serde(default = "default_min")]
    pub min: u8,
    #[serde(default = "default_max")]
    pub max: u8,
    #[serde(default)]
    pub level: u8,
    #[serde(default = "default_max")]
    pub power_on: u8,
    #[serde(default = "default_max")]
    pub system_failure: u8,
    #[serde(default)]
    pub fade_time: u8,
    #[serde(default = "default_fade_rate")]
    pub fade_rate: u8,
    #[serde(default)]
    pub extended_fade: u8,
    #[serde(default)]
    pub groups: u16,
}

fn default_gear_type() -> u8 {
    6
}

fn default_fade_rate() -> u8 {
    7
}

impl SimulatedGear {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            gear_type: default_gear_type(),
            min: default_min(),
            max: default_max(),
            level: 0,
            power_on: default_max(),
            system_failure: default_max(),
            fade_time: 0,
            fade_rate: default_fade_rate(),
            extended_fade: 0,
            groups: 0,
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_limits(mut self, min: u8, max: u8) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

#[derive(Debug, Clone)]
struct GearState {
    gear: SimulatedGear,
    last_active: u8,
    target: u8,
    fade_polls: u8,
}

impl GearState {
    fn new(gear: SimulatedGear) -> Self {
        let last_active = if gear.level > 0 { gear.level } else { gear.max };
        Self {
            target: gear.level,
            gear,
            last_active,
            fade_polls: 0,
        }
    }

    fn fade_to(&mut self, level: u8) {
        let level = if level == 0 {
            0
        } else {
            level.clamp(self.gear.min, self.gear.max)
        };
        if level > 0 {
            self.last_active = level;
        }
        self.target = level;
        self.fade_polls = FADE_POLLS;
    }

    fn status_bits(&mut self) -> u8 {
        let mut bits = 0;
        if self.fade_polls > 0 {
            self.fade_polls -= 1;
            bits |= status::FADE_IN_PROGRESS;
            if self.fade_polls == 0 {
                self.gear.level = self.target;
            }
        }
        if self.gear.level > 0 {
            bits |= status::ARC_POWER_ON;
        }
        bits
    }

    fn query(&self, op: u16) -> Option<u8> {
        let gear = &self.gear;
        let value = match op {
            opcode::QUERY_STATUS => return None,
            opcode::QUERY_DEVICE_TYPE => gear.gear_type,
            opcode::QUERY_ACTUAL_LEVEL => gear.level,
            opcode::QUERY_MAX_LEVEL => gear.max,
            opcode::QUERY_MIN_LEVEL => gear.min,
            opcode::QUERY_POWER_ON_LEVEL => gear.power_on,
            opcode::QUERY_SYSTEM_FAILURE_LEVEL => gear.system_failure,
            opcode::QUERY_FADE_TIME_RATE => (gear.fade_time << 4) | (gear.fade_rate & 0x0F),
            opcode::QUERY_EXTENDED_FADE_TIME => gear.extended_fade,
            opcode::QUERY_GROUPS_0_7 => (gear.groups & 0xFF) as u8,
            opcode::QUERY_GROUPS_8_15 => (gear.groups >> 8) as u8,
            _ => return None,
        };
        Some(value)
    }

    fn configure(&mut self, op: u16, dtr0: u8) {
        let gear = &mut self.gear;
        match op {
            opcode::SET_MAX_LEVEL => gear.max = dtr0,
            opcode::SET_MIN_LEVEL => gear.min = dtr0,
            opcode::SET_SYSTEM_FAILURE_LEVEL => gear.system_failure = dtr0,
            opcode::SET_POWER_ON_LEVEL => gear.power_on = dtr0,
            opcode::SET_FADE_TIME => gear.fade_time = dtr0 & 0x0F,
            opcode::SET_FADE_RATE => gear.fade_rate = dtr0 & 0x0F,
            opcode::SET_EXTENDED_FADE_TIME => gear.extended_fade = dtr0,
            op if (opcode::ADD_TO_GROUP..opcode::ADD_TO_GROUP + 16).contains(&op) => {
                gear.groups |= 1 << (op & 0x0F)
            },
            op if (opcode::REMOVE_FROM_GROUP..opcode::REMOVE_FROM_GROUP + 16).contains(&op) => {
                gear.groups &= !(1 << (op & 0x0F))
            },
            _ => {},
        }
    }

    fn level_command(&mut self, op: u16) {
        let level = self.gear.level;
        match op {
            opcode::OFF => self.fade_to(0),
            opcode::UP if level > 0 => self.fade_to(level.saturating_add(16)),
            opcode::DOWN if level > 0 => self.fade_to(level.saturating_sub(16).max(self.gear.min)),
            opcode::STEP_UP if level > 0 => self.fade_to(level.saturating_add(1)),
            opcode::STEP_DOWN if level > 0 => self.fade_to(level.saturating_sub(1).max(self.gear.min)),
            opcode::RECALL_MAX_LEVEL => self.fade_to(self.gear.max),
            opcode::RECALL_MIN_LEVEL => self.fade_to(self.gear.min),
            opcode::RECALL_LAST_ACTIVE_LEVEL => self.fade_to(self.last_active),
            _ => {},
        }
    }
}

#[derive(Debug, Default)]
struct SimBus {
    gear: BTreeMap<u8, GearState>,
    dtr0: u8,
    last_frame: Option<u16>,
    pending: Option<u32>,
}

impl SimBus {
    /// Backward frame for one forward frame, `None` meaning no answer
    fn handle(&mut self, frame: u16) -> Option<u8> {
        let repeated = self.last_frame == Some(frame);
        self.last_frame = Some(frame);

        if is_special(frame) {
            let value = (frame & 0xFF) as u8;
            if frame & 0xFF00 != opcode::SET_DTR0 {
                return None;
            }
            self.dtr0 = value;
            return if self.gear.is_empty() { None } else { Some(0) };
        }

        let dtr0 = self.dtr0;
        let device = self.gear.get_mut(&address_of(frame))?;
        if frame & 0x100 == 0 {
            device.fade_to((frame & 0xFF) as u8);
            return Some(0);
        }

        let op = frame & 0x1FF;
        match op {
            opcode::QUERY_STATUS => Some(device.status_bits()),
            0x190..=0x1FF => device.query(op),
            _ if needs_repeat(frame) => {
                if repeated {
                    // Consumed; a third identical frame starts a new pair.
                    self.last_frame = None;
                    device.configure(op, dtr0);
                    Some(0)
                } else {
                    None
                }
            },
            _ => {
                device.level_command(op);
                Some(0)
            },
        }
    }
}

/// Shared handle to the simulated bus; clones see the same devices
#[derive(Debug, Clone, Default)]
pub struct DaliBusSimulator {
    inner: Arc<Mutex<SimBus>>,
}

impl DaliBusSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gear(gear: impl IntoIterator<Item = SimulatedGear>) -> HubResult<Self> {
        let sim = Self::new();
        for g in gear {
            sim.add_gear(g)?;
        }
        Ok(sim)
    }

    pub fn add_gear(&self, gear: SimulatedGear) -> HubResult<()> {
        if gear.address > DALI_MAX_ADDR {
            return Err(HubError::invalid_address("dali", gear.address));
        }
        debug!("Simulated DALI gear at {}", gear.address);
        self.inner
            .lock()
            .gear
            .insert(gear.address, GearState::new(gear));
        Ok(())
    }

    /// Current state of one device, with any running fade completed
    pub fn gear(&self, address: u8) -> Option<SimulatedGear> {
        self.inner.lock().gear.get(&address).map(|s| {
            let mut gear = s.gear.clone();
            if s.fade_polls > 0 {
                gear.level = s.target;
            }
            gear
        })
    }

    pub fn addresses(&self) -> Vec<u8> {
        self.inner.lock().gear.keys().copied().collect()
    }
}

impl DaliDriver for DaliBusSimulator {
    fn transmit(&mut self, word: u32) -> HubResult<()> {
        let frame = decode_physical(word);
        let mut bus = self.inner.lock();
        let reply = bus.handle(frame);
        trace!("sim DALI {:04X} -> {:?}", frame, reply);
        bus.pending = Some(reply.map_or(RAW_NO_BACKWARD_FRAME, u32::from));
        Ok(())
    }

    fn receive(&mut self) -> Option<u32> {
        self.inner.lock().pending.take()
    }

    fn reset(&mut self) {
        self.inner.lock().pending = None;
    }
}
