//! Hub service configuration
//!
//! Loaded from an optional YAML file, then `HUB_`-prefixed environment
//! variables (`HUB_MODBUS__BAUD_RATE=19200`), then command-line overrides.
//! Every field has a default, so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use errors::{HubError, HubResult};
use serde::{Deserialize, Serialize};

use crate::protocols::dali::{SimulatedGear, DALI_MAX_ADDR, DALI_QUEUE_DEPTH};

pub const ENV_PREFIX: &str = "HUB_";

const VALID_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub dali: DaliConfig,
    pub modbus: ModbusConfig,
    pub responder: ResponderConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaliConfig {
    /// Command queue depth; fixed at build time and only checked here
    pub queue_depth: usize,
    pub response_timeout_ms: u64,
    pub scan_on_startup: bool,
    /// Devices on the simulated bus
    pub simulate: Vec<SimulatedGear>,
}

impl Default for DaliConfig {
    fn default() -> Self {
        Self {
            queue_depth: DALI_QUEUE_DEPTH,
            response_timeout_ms: 100,
            scan_on_startup: true,
            simulate: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Serial device; the simulated relay board is used when absent
    pub port: Option<String>,
    pub baud_rate: u32,
    pub device_address: u8,
    pub response_timeout_ms: u64,
    /// Delay before the first bulk coil read
    pub warmup_ms: u64,
    /// Periodic coil re-read, 0 disables
    pub refresh_interval_secs: u64,
    pub coil_count: u16,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            device_address: 1,
            response_timeout_ms: 100,
            warmup_ms: 100,
            refresh_interval_secs: 0,
            coil_count: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// RTU-over-TCP listen address; the responder is off when absent
    pub listen: Option<SocketAddr>,
    /// Only answer this unit id; any unit when absent
    pub unit_id: Option<u8>,
    pub downstream_timeout_ms: u64,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            listen: None,
            unit_id: None,
            downstream_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_us: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            json: false,
        }
    }
}

impl HubConfig {
    pub fn load(path: Option<&Path>) -> HubResult<Self> {
        let config: Self = common::load_config(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.dali.queue_depth != DALI_QUEUE_DEPTH {
            return Err(HubError::config(format!(
                "dali.queue_depth must be {} (fixed at build time), got {}",
                DALI_QUEUE_DEPTH, self.dali.queue_depth
            )));
        }
        if self.dali.response_timeout_ms == 0 {
            return Err(HubError::config("dali.response_timeout_ms must be > 0"));
        }
        for gear in &self.dali.simulate {
            if gear.address > DALI_MAX_ADDR {
                return Err(HubError::config(format!(
                    "Simulated DALI address {} exceeds {}",
                    gear.address, DALI_MAX_ADDR
                )));
            }
        }

        if !VALID_BAUD_RATES.contains(&self.modbus.baud_rate) {
            return Err(HubError::config(format!(
                "Invalid modbus.baud_rate {}",
                self.modbus.baud_rate
            )));
        }
        if self.modbus.device_address == 0 || self.modbus.device_address > 247 {
            return Err(HubError::config(format!(
                "modbus.device_address {} outside 1..=247",
                self.modbus.device_address
            )));
        }
        if self.modbus.response_timeout_ms == 0 {
            return Err(HubError::config("modbus.response_timeout_ms must be > 0"));
        }
        if self.modbus.coil_count == 0 {
            return Err(HubError::config("modbus.coil_count must be > 0"));
        }

        if self.responder.downstream_timeout_ms == 0 {
            return Err(HubError::config(
                "responder.downstream_timeout_ms must be > 0",
            ));
        }
        if self.engine.poll_interval_us == 0 {
            return Err(HubError::config("engine.poll_interval_us must be > 0"));
        }
        Ok(())
    }

    pub fn dali_response_timeout(&self) -> Duration {
        Duration::from_millis(self.dali.response_timeout_ms)
    }

    pub fn modbus_response_timeout(&self) -> Duration {
        Duration::from_millis(self.modbus.response_timeout_ms)
    }

    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.responder.downstream_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.engine.poll_interval_us)
    }
}
