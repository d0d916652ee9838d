//! Field-bus protocol implementations

pub mod dali;
pub mod modbus;
