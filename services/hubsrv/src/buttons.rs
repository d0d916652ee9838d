//! Wall-button bindings and the press/hold/release state machine
//!
//! Every button owns one binding word in the holding registers:
//! `type << 14 | address`, type 0 = relay coil, 1 = DALI short address,
//! 3 = unbound. The state machine is driven by 10 ms ticks and produces
//! bus actions for the engine to submit; it never talks to a bus itself.
//!
//! - Press: toggle a relay coil or a non-fadeable light at once.
//! - Hold 750 ms: start fading a fadeable light, repeating every 250 ms.
//! - Short press and release: toggle a fadeable light.
//! - Re-press within 500 ms of releasing a hold: fade the other way.

use std::time::Duration;

use errors::{HubError, HubResult};
use tracing::{debug, trace};

use crate::protocols::dali::DALI_ADDR_COUNT;
use crate::protocols::modbus::CoilValue;
use crate::regs::{RegisterImage, BINDINGS_HR_BASE};

pub const NUM_FIXTURES: usize = 24;
pub const BUTTONS_PER_FIXTURE: usize = 7;
pub const NUM_BUTTONS: usize = NUM_FIXTURES * BUTTONS_PER_FIXTURE;

const SCAN_PERIOD_MS: u16 = 10;
pub const SCAN_PERIOD: Duration = Duration::from_millis(SCAN_PERIOD_MS as u64);

const fn ticks(ms: u16) -> u16 {
    ms / SCAN_PERIOD_MS
}

const HOLD_TICKS: u16 = ticks(750);
const REPEAT_TICKS: u16 = ticks(250);
const REVERSE_WINDOW_TICKS: u16 = ticks(500);

// ============================================================================
// Bindings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Modbus(u16),
    Dali(u16),
    None,
}

impl Binding {
    pub fn decode(word: u16) -> Self {
        let address = word & 0x3FFF;
        match word >> 14 {
            0 => Self::Modbus(address),
            1 => Self::Dali(address),
            _ => Self::None,
        }
    }

    pub fn encode(self) -> u16 {
        match self {
            Self::Modbus(address) => address & 0x3FFF,
            Self::Dali(address) => (1 << 14) | (address & 0x3FFF),
            Self::None => 3 << 14,
        }
    }

    /// DALI short address, when bound to one that exists
    fn dali_address(self) -> Option<u8> {
        match self {
            Self::Dali(address) if usize::from(address) < DALI_ADDR_COUNT => Some(address as u8),
            _ => None,
        }
    }
}

pub fn binding_index(fixture: usize, button: usize) -> HubResult<u16> {
    if fixture >= NUM_FIXTURES || button >= BUTTONS_PER_FIXTURE {
        return Err(HubError::invalid_value(
            "button",
            format!("fixture {} button {} out of range", fixture, button),
        ));
    }
    Ok((fixture * BUTTONS_PER_FIXTURE + button) as u16)
}

pub fn get_binding(regs: &RegisterImage, fixture: usize, button: usize) -> HubResult<Binding> {
    let index = binding_index(fixture, button)?;
    Ok(Binding::decode(regs.binding(index)))
}

/// Store a binding in the register image; it is lost on restart
pub fn set_binding(
    regs: &mut RegisterImage,
    fixture: usize,
    button: usize,
    binding: Binding,
) -> HubResult<()> {
    let index = binding_index(fixture, button)?;
    debug!("Button {}/{} bound to {:?}", fixture, button, binding);
    regs.set_holding(BINDINGS_HR_BASE + index, binding.encode());
    Ok(())
}

// ============================================================================
// Button state machine
// ============================================================================

/// Bus work requested by a button event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    DaliToggle(u8),
    DaliFade { address: u8, velocity: i8 },
    SetCoil { coil: u16, value: CoilValue },
}

#[derive(Debug, Clone, Copy)]
struct ButtonState {
    released: bool,
    velocity: i8,
    countdown: u16,
    repeats: u16,
}

impl Default for ButtonState {
    fn default() -> Self {
        Self {
            released: true,
            velocity: 0,
            countdown: 0,
            repeats: 0,
        }
    }
}

pub struct ButtonBank {
    buttons: [ButtonState; NUM_BUTTONS],
}

impl Default for ButtonBank {
    fn default() -> Self {
        Self::new()
    }
}

fn check_index(index: u16) -> HubResult<usize> {
    let index = usize::from(index);
    if index >= NUM_BUTTONS {
        return Err(HubError::invalid_address("button", index as u32));
    }
    Ok(index)
}

impl ButtonBank {
    pub fn new() -> Self {
        Self {
            buttons: [ButtonState::default(); NUM_BUTTONS],
        }
    }

    pub fn is_pressed(&self, index: u16) -> bool {
        self.buttons
            .get(usize::from(index))
            .is_some_and(|b| !b.released)
    }

    pub fn press(
        &mut self,
        index: u16,
        regs: &mut RegisterImage,
    ) -> HubResult<Option<ButtonAction>> {
        let i = check_index(index)?;
        let state = &mut self.buttons[i];
        if !state.released {
            return Ok(None);
        }
        state.released = false;
        regs.set_discrete_input(index);

        let binding = Binding::decode(regs.binding(index));
        let action = match binding {
            Binding::Dali(_) => binding
                .dali_address()
                .filter(|&addr| !regs.is_fadeable(addr))
                .map(ButtonAction::DaliToggle),
            Binding::Modbus(coil) if usize::from(coil) < NUM_BUTTONS => {
                let value = if regs.is_coil_set(coil) {
                    CoilValue::Off
                } else {
                    CoilValue::On
                };
                Some(ButtonAction::SetCoil { coil, value })
            },
            _ => None,
        };

        state.velocity = -state.velocity;
        state.countdown = if state.velocity != 0 {
            REPEAT_TICKS
        } else {
            HOLD_TICKS
        };
        trace!("Button {} pressed, velocity {}", index, state.velocity);
        Ok(action)
    }

    pub fn release(
        &mut self,
        index: u16,
        regs: &mut RegisterImage,
    ) -> HubResult<Option<ButtonAction>> {
        let i = check_index(index)?;
        let state = &mut self.buttons[i];
        if state.released {
            return Ok(None);
        }
        state.released = true;
        regs.clear_discrete_input(index);

        if state.repeats == 0 {
            state.countdown = 0;
            let fadeable = Binding::decode(regs.binding(index))
                .dali_address()
                .filter(|&addr| regs.is_fadeable(addr));
            return Ok(fadeable.map(ButtonAction::DaliToggle));
        }

        state.countdown = if state.velocity != 0 {
            REVERSE_WINDOW_TICKS
        } else {
            0
        };
        Ok(None)
    }

    /// Advance every button by one scan period
    pub fn tick(&mut self, regs: &RegisterImage) -> Vec<ButtonAction> {
        let mut actions = Vec::new();
        for (index, state) in self.buttons.iter_mut().enumerate() {
            if state.countdown == 0 {
                continue;
            }
            state.countdown -= 1;
            if state.countdown > 0 {
                continue;
            }

            if state.released {
                state.velocity = 0;
                state.repeats = 0;
                continue;
            }

            state.repeats = state.repeats.saturating_add(1);
            state.countdown = REPEAT_TICKS;
            if state.velocity == 0 {
                state.velocity = -1;
            }
            let binding = Binding::decode(regs.binding(index as u16));
            match binding.dali_address() {
                Some(address) if regs.is_fadeable(address) => {
                    actions.push(ButtonAction::DaliFade {
                        address,
                        velocity: state.velocity,
                    });
                },
                _ if state.repeats == 1 => {
                    trace!("Ignoring long hold of button {}", index);
                },
                _ => {},
            }
        }
        actions
    }
}
