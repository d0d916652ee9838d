//! Modbus RTU: framing, CRC, the relay-board master and its links

pub mod constants;
pub mod crc;
pub mod frame;
pub mod link;
pub mod master;
pub mod simulator;

pub use crc::{crc16, Crc16};
pub use link::{MemoryLink, SerialLink, SerialPortLink};
pub use master::{CoilValue, ModbusCallback, ModbusMaster, ModbusOutcome, MODBUS_QUEUE_DEPTH};
pub use simulator::RelayBoardSimulator;
