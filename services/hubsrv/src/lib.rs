//! Lighting and relay hub service
//!
//! A cooperative engine that drives a DALI lighting bus and a Modbus RTU
//! relay board over half-duplex links, one transaction in flight per bus.
//!
//! - `core`: resume-point scheduler and bounded command queue
//! - `protocols`: DALI command engine and Modbus RTU master
//! - `regs`: shared register image
//! - `buttons`: wall-button bindings and press/hold state machine
//! - `hub` / `tasks`: the engine loop and its long-running tasks
//! - `responder` / `server`: inbound Modbus RTU-over-TCP access

pub mod buttons;
pub mod config;
pub mod core;
pub mod hub;
pub mod protocols;
pub mod regs;
pub mod responder;
pub mod server;
pub mod tasks;

pub use config::HubConfig;
pub use hub::{DaliOp, EngineHandle, Hub, ModbusOp};
pub use regs::{RegisterImage, SharedRegisters};
pub use responder::Responder;
