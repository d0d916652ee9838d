//! Inbound Modbus RTU responder
//!
//! Answers an external master from the register image and forwards writes
//! to the engine. A forwarded write waits on the engine's reply for at most
//! the configured downstream timeout; a hung bus answers with exception
//! 0x0B instead of wedging the responder.
//!
//! Frames with a bad CRC, or addressed to another unit, get no answer.

use std::future::Future;
use std::time::Duration;

use errors::{HubError, HubResult};
use tracing::{debug, warn};

use crate::hub::{DaliOp, EngineHandle, ModbusOp};
use crate::protocols::dali::DaliResponse;
use crate::protocols::modbus::constants::*;
use crate::protocols::modbus::crc::{append_crc, verify_frame};
use crate::protocols::modbus::frame::{self, word};
use crate::protocols::modbus::{CoilValue, ModbusOutcome};
use crate::regs::{DaliBank, MAX_COILS, MAX_DISCRETE_INPUTS, MAX_HOLDING_REGISTERS};

/// Modbus exception code carried back to the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Exception(u8);

impl Exception {
    const ILLEGAL_FUNCTION: Self = Self(EX_ILLEGAL_FUNCTION);
    const ILLEGAL_ADDRESS: Self = Self(EX_ILLEGAL_DATA_ADDRESS);
    const ILLEGAL_VALUE: Self = Self(EX_ILLEGAL_DATA_VALUE);
    const DEVICE_FAILURE: Self = Self(EX_SERVER_DEVICE_FAILURE);
    const BUSY: Self = Self(EX_SERVER_DEVICE_BUSY);
    const NAK: Self = Self(EX_NEGATIVE_ACKNOWLEDGE);
    const NO_RESPONSE: Self = Self(EX_GATEWAY_TARGET_FAILED);
}

impl From<HubError> for Exception {
    fn from(err: HubError) -> Self {
        match err {
            HubError::InvalidAddress { .. } => Self::ILLEGAL_ADDRESS,
            HubError::InvalidValue { .. } => Self::ILLEGAL_VALUE,
            HubError::Timeout(_) => Self::NO_RESPONSE,
            e if e.is_capacity() => Self::BUSY,
            _ => Self::DEVICE_FAILURE,
        }
    }
}

impl From<DaliResponse> for Exception {
    fn from(response: DaliResponse) -> Self {
        match response {
            DaliResponse::Nak => Self::NAK,
            DaliResponse::BusError => Self::DEVICE_FAILURE,
            DaliResponse::Timeout | DaliResponse::Value(_) => Self::NO_RESPONSE,
        }
    }
}

type Answer = Result<Vec<u8>, Exception>;

/// Request fields after the function code
struct Request<'a> {
    unit: u8,
    function: u8,
    payload: &'a [u8],
}

impl Request<'_> {
    fn word(&self, index: usize) -> Result<u16, Exception> {
        word(self.payload, index * 2).ok_or(Exception::ILLEGAL_VALUE)
    }
}

#[derive(Clone)]
pub struct Responder {
    handle: EngineHandle,
    unit_id: Option<u8>,
    timeout: Duration,
}

impl Responder {
    pub fn new(handle: EngineHandle, unit_id: Option<u8>, timeout: Duration) -> Self {
        Self {
            handle,
            unit_id,
            timeout,
        }
    }

    /// Answer one complete request frame; `None` means stay silent
    pub async fn handle_frame(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 4 || !verify_frame(request) {
            debug!("Responder dropped frame {:02X?}", request);
            return None;
        }
        let unit = request[0];
        if self.unit_id.is_some_and(|id| id != unit) {
            return None;
        }
        let req = Request {
            unit,
            function: request[1],
            payload: &request[2..request.len() - 2],
        };
        debug!("Responder rx unit {} fc {:02X}", unit, req.function);

        match self.dispatch(&req).await {
            Ok(response) => Some(response),
            Err(Exception(code)) => {
                debug!("Responder exception {:02X} for fc {:02X}", code, req.function);
                Some(frame::exception_response(unit, req.function, code))
            },
        }
    }

    async fn dispatch(&self, req: &Request<'_>) -> Answer {
        match req.function {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => self.read_bits(req),
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => self.read_registers(req),
            FC_WRITE_SINGLE_COIL => self.write_coil(req).await,
            FC_WRITE_SINGLE_REGISTER => {
                let (addr, value) = (req.word(0)?, req.word(1)?);
                self.write_register(addr, value).await?;
                Ok(frame::write_response(req.unit, req.function, addr, value))
            },
            FC_WRITE_MULTIPLE_COILS => self.write_coils(req).await,
            FC_WRITE_MULTIPLE_REGISTERS => self.write_registers(req).await,
            FC_EXEC_DALI => self.exec_dali(req).await,
            _ => Err(Exception::ILLEGAL_FUNCTION),
        }
    }

    // ------------------------------------------------------------------
    // Reads, served from the register image
    // ------------------------------------------------------------------

    fn read_bits(&self, req: &Request<'_>) -> Answer {
        let (addr, count) = (req.word(0)?, req.word(1)?);
        let limit = if req.function == FC_READ_COILS {
            MAX_COILS
        } else {
            MAX_DISCRETE_INPUTS
        };
        if count == 0
            || addr % 8 != 0
            || count % 8 != 0
            || usize::from(addr) + usize::from(count) > limit
        {
            return Err(Exception::ILLEGAL_ADDRESS);
        }
        let regs = self.handle.registers().lock();
        let data = if req.function == FC_READ_COILS {
            regs.copy_coils(addr, count)
        } else {
            regs.copy_discrete_inputs(addr, count)
        }
        .ok_or(Exception::ILLEGAL_ADDRESS)?;
        Ok(frame::read_response(req.unit, req.function, &data))
    }

    fn read_registers(&self, req: &Request<'_>) -> Answer {
        let (addr, count) = (req.word(0)?, req.word(1)?);
        if count == 0
            || count > MAX_READ_REGISTERS
            || usize::from(addr) + usize::from(count) > MAX_HOLDING_REGISTERS
        {
            return Err(Exception::ILLEGAL_ADDRESS);
        }
        let data = self
            .handle
            .registers()
            .lock()
            .copy_holding(addr, count)
            .ok_or(Exception::ILLEGAL_ADDRESS)?;
        Ok(frame::read_response(req.unit, req.function, &data))
    }

    // ------------------------------------------------------------------
    // Relay-board writes, forwarded downstream
    // ------------------------------------------------------------------

    async fn write_coil(&self, req: &Request<'_>) -> Answer {
        let (coil, raw) = (req.word(0)?, req.word(1)?);
        if usize::from(coil) >= MAX_COILS {
            return Err(Exception::ILLEGAL_ADDRESS);
        }
        let value = CoilValue::from_wire(raw).ok_or(Exception::ILLEGAL_VALUE)?;
        let op = ModbusOp::SetCoil { coil, value };
        let (outcome, reply) = self.forward(self.handle.modbus(op)).await?;
        check_outcome(outcome)?;

        // Echo the board's reply under our own unit id
        let mut echo = Vec::with_capacity(reply.len());
        echo.push(req.unit);
        let body = reply.get(1..reply.len().saturating_sub(2)).unwrap_or_default();
        echo.extend_from_slice(body);
        append_crc(&mut echo);
        Ok(echo)
    }

    async fn write_coils(&self, req: &Request<'_>) -> Answer {
        let (start, count) = (req.word(0)?, req.word(1)?);
        let byte_count = *req.payload.get(4).ok_or(Exception::ILLEGAL_VALUE)?;
        let packed = req.payload.get(5..).ok_or(Exception::ILLEGAL_VALUE)?;
        if count == 0
            || count > MAX_WRITE_COILS
            || usize::from(byte_count) != usize::from(count).div_ceil(8)
            || packed.len() != usize::from(byte_count)
        {
            return Err(Exception::ILLEGAL_VALUE);
        }
        if usize::from(start) + usize::from(count) > MAX_COILS {
            return Err(Exception::ILLEGAL_ADDRESS);
        }
        let op = ModbusOp::SetCoils {
            start,
            count,
            packed: packed.to_vec(),
        };
        let (outcome, _) = self.forward(self.handle.modbus(op)).await?;
        check_outcome(outcome)?;
        Ok(frame::write_response(req.unit, req.function, start, count))
    }

    // ------------------------------------------------------------------
    // Holding-register writes
    // ------------------------------------------------------------------

    async fn write_registers(&self, req: &Request<'_>) -> Answer {
        let (start, count) = (req.word(0)?, req.word(1)?);
        let byte_count = *req.payload.get(4).ok_or(Exception::ILLEGAL_VALUE)?;
        if count == 0
            || count > MAX_WRITE_REGISTERS
            || usize::from(byte_count) != usize::from(count) * 2
            || req.payload.len() != 5 + usize::from(byte_count)
        {
            return Err(Exception::ILLEGAL_VALUE);
        }
        if usize::from(start) + usize::from(count) > MAX_HOLDING_REGISTERS {
            return Err(Exception::ILLEGAL_ADDRESS);
        }
        for i in 0..count {
            let value =
                word(req.payload, 5 + usize::from(i) * 2).ok_or(Exception::ILLEGAL_VALUE)?;
            self.write_register(start + i, value).await?;
        }
        Ok(frame::write_response(req.unit, req.function, start, count))
    }

    /// Apply one register write: bindings are stored, lighting banks become
    /// bus operations whose confirmed results update the image
    async fn write_register(&self, addr: u16, value: u16) -> Result<(), Exception> {
        if usize::from(addr) >= MAX_HOLDING_REGISTERS {
            return Err(Exception::ILLEGAL_ADDRESS);
        }
        if usize::from(addr) < MAX_DISCRETE_INPUTS {
            return self.forward(self.handle.set_binding(addr, value)).await;
        }

        let Some((bank, dali)) = DaliBank::locate(addr) else {
            return Err(Exception::ILLEGAL_ADDRESS);
        };
        let [hi, lo] = value.to_be_bytes();
        match bank {
            DaliBank::Status => self.dali(DaliOp::SetLevel(dali, lo)).await,
            DaliBank::MinMax => {
                self.dali(DaliOp::SetMinMax {
                    addr: dali,
                    min: lo,
                    max: hi,
                })
                .await
            },
            DaliBank::Fade => {
                self.dali(DaliOp::SetExtendedFadeTime {
                    addr: dali,
                    value: hi,
                })
                .await?;
                self.dali(DaliOp::SetFadeTimeRate {
                    addr: dali,
                    time: lo >> 4,
                    rate: lo & 0x0F,
                })
                .await
            },
            DaliBank::PowerOn => {
                self.dali(DaliOp::SetPowerOnLevel {
                    addr: dali,
                    power_on: lo,
                    system_failure: hi,
                })
                .await
            },
            DaliBank::Groups => {
                self.dali(DaliOp::SetGroups {
                    addr: dali,
                    mask: value,
                })
                .await
            },
            // Filled in by the scan only
            DaliBank::DeviceType => Err(Exception::ILLEGAL_ADDRESS),
        }
    }

    // ------------------------------------------------------------------
    // Lighting bus
    // ------------------------------------------------------------------

    async fn exec_dali(&self, req: &Request<'_>) -> Answer {
        let command = req.word(0)?;
        let flags = *req.payload.get(2).ok_or(Exception::ILLEGAL_VALUE)?;
        let op = DaliOp::Raw {
            frame: command,
            send_twice: flags & 0x01 != 0,
        };
        match self.forward(self.handle.dali(op)).await? {
            DaliResponse::Value(v) => Ok(frame::exec_dali_response(req.unit, v)),
            other => Err(other.into()),
        }
    }

    async fn dali(&self, op: DaliOp) -> Result<(), Exception> {
        match self.forward(self.handle.dali(op)).await? {
            DaliResponse::Value(_) => Ok(()),
            other => Err(other.into()),
        }
    }

    /// Wait for an engine reply, bounded by the downstream timeout
    async fn forward<T>(&self, pending: impl Future<Output = HubResult<T>>) -> Result<T, Exception> {
        match tokio::time::timeout(self.timeout, pending).await {
            Ok(result) => result.map_err(|e| {
                debug!("Forwarded request rejected: {}", e);
                Exception::from(e)
            }),
            Err(_) => {
                warn!("No downstream answer within {:?}", self.timeout);
                Err(Exception::NO_RESPONSE)
            },
        }
    }
}

fn check_outcome(outcome: ModbusOutcome) -> Result<(), Exception> {
    match outcome {
        ModbusOutcome::Done => Ok(()),
        ModbusOutcome::Exception(code) => Err(Exception(code)),
        other => {
            debug!("Relay board write failed: {}", other);
            Err(Exception::NO_RESPONSE)
        },
    }
}
