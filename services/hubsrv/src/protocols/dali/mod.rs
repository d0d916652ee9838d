//! DALI lighting bus: frame codec, physical driver seam, command engine
//! and a bus simulator.

pub mod commands;
pub mod driver;
pub mod engine;
pub mod simulator;

pub use commands::{DaliResponse, GearType, DALI_ADDR_COUNT, DALI_MAX_ADDR};
pub use driver::{DaliDriver, ScriptedDriver};
pub use engine::{DaliBus, DaliCommand, Notifier, DALI_QUEUE_DEPTH, DEFAULT_RESPONSE_TIMEOUT};
pub use simulator::{DaliBusSimulator, SimulatedGear};
