//! Byte-level serial link used by the RTU master
//!
//! The master polls for one byte at a time and never blocks, so links
//! report "nothing yet" as `Ok(None)`.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use errors::{HubError, HubResult};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

pub trait SerialLink: Send {
    /// Queue a complete frame for transmission
    fn write_frame(&mut self, frame: &[u8]) -> HubResult<()>;

    /// Next received byte, if one is waiting
    fn read_byte(&mut self) -> HubResult<Option<u8>>;

    /// Discard stale input before a new request
    fn clear_input(&mut self) -> HubResult<()>;
}

impl<L: SerialLink + ?Sized> SerialLink for Box<L> {
    fn write_frame(&mut self, frame: &[u8]) -> HubResult<()> {
        (**self).write_frame(frame)
    }

    fn read_byte(&mut self) -> HubResult<Option<u8>> {
        (**self).read_byte()
    }

    fn clear_input(&mut self) -> HubResult<()> {
        (**self).clear_input()
    }
}

// ============================================================================
// Serial port
// ============================================================================

/// RS-485 port opened 8-N-1
pub struct SerialPortLink {
    path: String,
    port: Box<dyn tokio_serial::SerialPort>,
}

impl SerialPortLink {
    pub fn open(path: &str, baud_rate: u32) -> HubResult<Self> {
        debug!("Opening serial port {} at {} baud", path, baud_rate);
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|e| HubError::config(format!("Cannot open serial port {}: {}", path, e)))?;
        info!("Serial port {} open at {} baud", path, baud_rate);
        Ok(Self {
            path: path.to_string(),
            port,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

fn serial_error(e: tokio_serial::Error) -> HubError {
    HubError::Io(e.into())
}

impl SerialLink for SerialPortLink {
    fn write_frame(&mut self, frame: &[u8]) -> HubResult<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> HubResult<Option<u8>> {
        if self.port.bytes_to_read().map_err(serial_error)? == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_input(&mut self) -> HubResult<()> {
        self.port
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(serial_error)
    }
}

// ============================================================================
// In-memory link
// ============================================================================

#[derive(Debug, Default)]
struct Wire {
    written: Vec<Vec<u8>>,
    incoming: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
}

/// Loopback link for tests.
///
/// Each written frame releases the next queued reply into the receive
/// buffer. Clones share state, so a test can inspect traffic while the
/// master owns the link.
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    wire: Arc<Mutex<Wire>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply released by the next written frame; an empty reply means silence
    pub fn queue_reply(&self, reply: impl Into<Vec<u8>>) -> &Self {
        self.wire.lock().replies.push_back(reply.into());
        self
    }

    /// Bytes available to the master right away
    pub fn inject(&self, bytes: &[u8]) {
        self.wire.lock().incoming.extend(bytes.iter().copied());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.wire.lock().written.clone()
    }
}

impl SerialLink for MemoryLink {
    fn write_frame(&mut self, frame: &[u8]) -> HubResult<()> {
        let mut wire = self.wire.lock();
        trace!("memory link tx {:02X?}", frame);
        wire.written.push(frame.to_vec());
        if let Some(reply) = wire.replies.pop_front() {
            wire.incoming.extend(reply);
        }
        Ok(())
    }

    fn read_byte(&mut self) -> HubResult<Option<u8>> {
        Ok(self.wire.lock().incoming.pop_front())
    }

    fn clear_input(&mut self) -> HubResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_memory_link_releases_reply_per_frame() {
        let link = MemoryLink::new();
        link.queue_reply(vec![1, 2]).queue_reply(Vec::new());
        let mut master_side = link.clone();

        assert_eq!(master_side.read_byte().unwrap(), None);
        master_side.write_frame(&[0xAA]).unwrap();
        assert_eq!(master_side.read_byte().unwrap(), Some(1));
        assert_eq!(master_side.read_byte().unwrap(), Some(2));
        master_side.write_frame(&[0xBB]).unwrap();
        assert_eq!(master_side.read_byte().unwrap(), None);
        assert_eq!(link.written(), vec![vec![0xAA], vec![0xBB]]);
    }

    #[test]
    fn test_missing_serial_port_is_config_error() {
        let err = SerialPortLink::open("/dev/does-not-exist-hub", 9600)
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Configuration(_)));
    }
}
