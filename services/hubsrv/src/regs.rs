//! Shared register image
//!
//! Coils, discrete inputs and holding registers mirrored for the inbound
//! responder. Holding registers 0..255 hold button bindings; the lighting-bus
//! attribute banks follow, one 64-register bank per attribute.
//!
//! Values only change as the result of a confirmed bus transaction. The
//! engine loop is the sole writer; other contexts read through the mutex.

use std::sync::Arc;

use parking_lot::Mutex;

// ============================================================================
// Layout
// ============================================================================

pub const MAX_COILS: usize = 256;
pub const MAX_DISCRETE_INPUTS: usize = 256;
pub const MAX_DALI_LIGHTS: usize = 64;
pub const MAX_HOLDING_REGISTERS: usize = 1024;

pub const BINDINGS_HR_BASE: u16 = 0;
pub const DALI_HR_BASE: u16 = BINDINGS_HR_BASE + MAX_DISCRETE_INPUTS as u16;

/// Marker for an attribute of a device that did not answer the scan
pub const ABSENT: u16 = 0xFFFF;

/// Binding word meaning "no binding" (type 3, address 0)
pub const BINDING_NONE: u16 = 0xC000;

/// One bank of 64 registers per lighting-bus attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaliBank {
    /// lo = actual level, hi = status byte
    Status = 0,
    /// lo = min level, hi = max level
    MinMax = 1,
    /// lo = fade time (hi nibble) / fade rate (lo nibble), hi = extended fade
    Fade = 2,
    /// lo = power-on level, hi = system-failure level
    PowerOn = 3,
    /// group membership mask
    Groups = 4,
    /// lo = gear type reported by QUERY DEVICE TYPE
    DeviceType = 5,
}

impl DaliBank {
    pub const ALL: [DaliBank; 6] = [
        DaliBank::Status,
        DaliBank::MinMax,
        DaliBank::Fade,
        DaliBank::PowerOn,
        DaliBank::Groups,
        DaliBank::DeviceType,
    ];

    pub const fn base(self) -> u16 {
        DALI_HR_BASE + (self as u16) * MAX_DALI_LIGHTS as u16
    }

    pub const fn register(self, dali_addr: u8) -> u16 {
        self.base() + dali_addr as u16
    }

    /// Map a holding register number back to its bank and device address
    pub fn locate(reg: u16) -> Option<(DaliBank, u8)> {
        let offset = reg.checked_sub(DALI_HR_BASE)? as usize;
        let bank = Self::ALL.get(offset / MAX_DALI_LIGHTS)?;
        Some((*bank, (offset % MAX_DALI_LIGHTS) as u8))
    }
}

// ============================================================================
// RegisterImage
// ============================================================================

#[derive(Debug, Clone)]
pub struct RegisterImage {
    coils: [u8; MAX_COILS / 8],
    discrete_inputs: [u8; MAX_DISCRETE_INPUTS / 8],
    holding: [u16; MAX_HOLDING_REGISTERS],
}

impl Default for RegisterImage {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterImage {
    /// Power-on state: coils cleared, no bindings, every lighting device absent
    pub fn new() -> Self {
        let mut image = Self {
            coils: [0; MAX_COILS / 8],
            discrete_inputs: [0; MAX_DISCRETE_INPUTS / 8],
            holding: [0; MAX_HOLDING_REGISTERS],
        };
        image.holding[..MAX_DISCRETE_INPUTS].fill(BINDING_NONE);
        for addr in 0..MAX_DALI_LIGHTS as u8 {
            image.set_holding(DaliBank::Status.register(addr), ABSENT);
            image.set_holding(DaliBank::MinMax.register(addr), ABSENT);
            image.set_holding(DaliBank::DeviceType.register(addr), ABSENT);
        }
        image
    }

    // ---- Coils ----

    pub fn set_coil(&mut self, addr: u16) {
        if let Some((byte, mask)) = bit_slot(addr, MAX_COILS) {
            self.coils[byte] |= mask;
        }
    }

    pub fn clear_coil(&mut self, addr: u16) {
        if let Some((byte, mask)) = bit_slot(addr, MAX_COILS) {
            self.coils[byte] &= !mask;
        }
    }

    pub fn toggle_coil(&mut self, addr: u16) {
        if let Some((byte, mask)) = bit_slot(addr, MAX_COILS) {
            self.coils[byte] ^= mask;
        }
    }

    pub fn write_coil(&mut self, addr: u16, on: bool) {
        if on {
            self.set_coil(addr);
        } else {
            self.clear_coil(addr);
        }
    }

    pub fn is_coil_set(&self, addr: u16) -> bool {
        bit_slot(addr, MAX_COILS).is_some_and(|(byte, mask)| self.coils[byte] & mask != 0)
    }

    // ---- Discrete inputs ----

    pub fn set_discrete_input(&mut self, addr: u16) {
        if let Some((byte, mask)) = bit_slot(addr, MAX_DISCRETE_INPUTS) {
            self.discrete_inputs[byte] |= mask;
        }
    }

    pub fn clear_discrete_input(&mut self, addr: u16) {
        if let Some((byte, mask)) = bit_slot(addr, MAX_DISCRETE_INPUTS) {
            self.discrete_inputs[byte] &= !mask;
        }
    }

    pub fn is_discrete_input_set(&self, addr: u16) -> bool {
        bit_slot(addr, MAX_DISCRETE_INPUTS)
            .is_some_and(|(byte, mask)| self.discrete_inputs[byte] & mask != 0)
    }

    /// Packed coil bytes for `count` coils from `addr` (both multiples of 8)
    pub fn copy_coils(&self, addr: u16, count: u16) -> Option<Vec<u8>> {
        copy_bits(&self.coils, addr, count)
    }

    pub fn copy_discrete_inputs(&self, addr: u16, count: u16) -> Option<Vec<u8>> {
        copy_bits(&self.discrete_inputs, addr, count)
    }

    // ---- Holding registers ----

    pub fn holding(&self, addr: u16) -> Option<u16> {
        self.holding.get(addr as usize).copied()
    }

    pub fn set_holding(&mut self, addr: u16, value: u16) {
        if let Some(slot) = self.holding.get_mut(addr as usize) {
            *slot = value;
        }
    }

    /// Byte 0 is the low byte, byte 1 the high byte
    pub fn set_holding_byte(&mut self, addr: u16, byte: u8, value: u8) {
        if let Some(slot) = self.holding.get_mut(addr as usize) {
            let shift = u16::from(byte & 1) * 8;
            *slot = (*slot & !(0xFF << shift)) | (u16::from(value) << shift);
        }
    }

    /// Nibble 0 is bits 0..4, nibble 3 is bits 12..16
    pub fn set_holding_nibble(&mut self, addr: u16, nibble: u8, value: u8) {
        if let Some(slot) = self.holding.get_mut(addr as usize) {
            let shift = u16::from(nibble & 3) * 4;
            *slot = (*slot & !(0x0F << shift)) | (u16::from(value & 0x0F) << shift);
        }
    }

    pub fn set_holding_bit(&mut self, addr: u16, bit: u8) {
        if let Some(slot) = self.holding.get_mut(addr as usize) {
            *slot |= 1 << (bit & 0x0F);
        }
    }

    pub fn clear_holding_bit(&mut self, addr: u16, bit: u8) {
        if let Some(slot) = self.holding.get_mut(addr as usize) {
            *slot &= !(1 << (bit & 0x0F));
        }
    }

    /// Big-endian bytes of `count` registers from `addr`
    pub fn copy_holding(&self, addr: u16, count: u16) -> Option<Vec<u8>> {
        let start = addr as usize;
        let end = start.checked_add(count as usize)?;
        let regs = self.holding.get(start..end)?;
        Some(regs.iter().flat_map(|r| r.to_be_bytes()).collect())
    }

    // ---- Lighting-bus views ----

    pub fn dali(&self, bank: DaliBank, dali_addr: u8) -> u16 {
        self.holding(bank.register(dali_addr)).unwrap_or(ABSENT)
    }

    /// Fadeable devices have distinct min and max levels
    pub fn is_fadeable(&self, dali_addr: u8) -> bool {
        if dali_addr as usize >= MAX_DALI_LIGHTS {
            return false;
        }
        let [max, min] = self.dali(DaliBank::MinMax, dali_addr).to_be_bytes();
        min != max
    }

    pub fn is_present(&self, dali_addr: u8) -> bool {
        dali_addr < MAX_DALI_LIGHTS as u8 && self.dali(DaliBank::DeviceType, dali_addr) != ABSENT
    }

    /// Mark every scanned attribute of a device as absent
    pub fn mark_absent(&mut self, dali_addr: u8) {
        for bank in [
            DaliBank::Status,
            DaliBank::MinMax,
            DaliBank::PowerOn,
            DaliBank::Fade,
            DaliBank::DeviceType,
        ] {
            self.set_holding(bank.register(dali_addr), ABSENT);
        }
        self.set_holding(DaliBank::Groups.register(dali_addr), 0);
    }

    pub fn binding(&self, index: u16) -> u16 {
        if (index as usize) < MAX_DISCRETE_INPUTS {
            self.holding(BINDINGS_HR_BASE + index).unwrap_or(BINDING_NONE)
        } else {
            BINDING_NONE
        }
    }
}

fn bit_slot(addr: u16, limit: usize) -> Option<(usize, u8)> {
    let addr = addr as usize;
    (addr < limit).then(|| (addr / 8, 1u8 << (addr % 8)))
}

fn copy_bits(bits: &[u8], addr: u16, count: u16) -> Option<Vec<u8>> {
    if addr % 8 != 0 || count % 8 != 0 {
        return None;
    }
    let start = addr as usize / 8;
    let end = start + count as usize / 8;
    bits.get(start..end).map(<[u8]>::to_vec)
}

/// Register image shared between the engine loop and the responder
pub type SharedRegisters = Arc<Mutex<RegisterImage>>;

pub fn shared_registers() -> SharedRegisters {
    Arc::new(Mutex::new(RegisterImage::new()))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_initial_image_marks_devices_absent() {
        let regs = RegisterImage::new();
        assert_eq!(regs.dali(DaliBank::Status, 0), ABSENT);
        assert_eq!(regs.dali(DaliBank::MinMax, 63), ABSENT);
        assert_eq!(regs.dali(DaliBank::Groups, 5), 0);
        assert_eq!(regs.binding(10), BINDING_NONE);
        assert!(!regs.is_coil_set(0));
        assert!(!regs.is_present(3));
    }

    #[test]
    fn test_bank_layout() {
        assert_eq!(DaliBank::Status.base(), 256);
        assert_eq!(DaliBank::MinMax.register(1), 256 + 64 + 1);
        assert_eq!(DaliBank::Groups.base(), 256 + 4 * 64);
        assert_eq!(DaliBank::locate(256 + 2 * 64 + 7), Some((DaliBank::Fade, 7)));
        assert_eq!(DaliBank::locate(100), None);
        assert_eq!(DaliBank::locate(256 + 6 * 64), None);
    }

    #[test]
    fn test_byte_and_nibble_setters() {
        let mut regs = RegisterImage::new();
        let reg = DaliBank::Fade.register(3);
        regs.set_holding(reg, 0);

        regs.set_holding_byte(reg, 1, 0xAB);
        assert_eq!(regs.holding(reg), Some(0xAB00));
        regs.set_holding_byte(reg, 0, 0x12);
        assert_eq!(regs.holding(reg), Some(0xAB12));

        regs.set_holding_nibble(reg, 1, 0x7);
        assert_eq!(regs.holding(reg), Some(0xAB72));
        regs.set_holding_nibble(reg, 0, 0xF);
        assert_eq!(regs.holding(reg), Some(0xAB7F));
        regs.set_holding_nibble(reg, 3, 0x1);
        assert_eq!(regs.holding(reg), Some(0x1B7F));
    }

    #[test]
    fn test_group_bits() {
        let mut regs = RegisterImage::new();
        let reg = DaliBank::Groups.register(9);
        regs.set_holding_bit(reg, 0);
        regs.set_holding_bit(reg, 15);
        assert_eq!(regs.holding(reg), Some(0x8001));
        regs.clear_holding_bit(reg, 0);
        assert_eq!(regs.holding(reg), Some(0x8000));
    }

    #[test]
    fn test_coils_and_copy_out() {
        let mut regs = RegisterImage::new();
        regs.set_coil(0);
        regs.set_coil(9);
        regs.toggle_coil(10);
        regs.toggle_coil(9);
        assert!(regs.is_coil_set(0));
        assert!(!regs.is_coil_set(9));
        assert!(regs.is_coil_set(10));

        assert_eq!(regs.copy_coils(0, 16), Some(vec![0x01, 0x04]));
        assert_eq!(regs.copy_coils(3, 8), None);
        assert_eq!(regs.copy_coils(248, 16), None);

        // out of range setters are ignored
        regs.set_coil(300);
        assert!(!regs.is_coil_set(300));
    }

    #[test]
    fn test_holding_copy_is_big_endian() {
        let mut regs = RegisterImage::new();
        regs.set_holding(0, 0x1234);
        regs.set_holding(1, 0xC005);
        assert_eq!(regs.copy_holding(0, 2), Some(vec![0x12, 0x34, 0xC0, 0x05]));
        assert_eq!(regs.copy_holding(1020, 10), None);
    }

    #[test]
    fn test_fadeable_and_absent() {
        let mut regs = RegisterImage::new();
        assert!(!regs.is_fadeable(4));

        let reg = DaliBank::MinMax.register(4);
        regs.set_holding_byte(reg, 0, 10);
        regs.set_holding_byte(reg, 1, 254);
        assert!(regs.is_fadeable(4));
        assert!(!regs.is_fadeable(64));

        regs.mark_absent(4);
        assert!(!regs.is_fadeable(4));
        assert_eq!(regs.dali(DaliBank::Groups, 4), 0);
    }
}
