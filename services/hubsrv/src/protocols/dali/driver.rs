//! Physical layer interface for the lighting bus
//!
//! The engine hands the driver one encoded transmit word per transaction and
//! polls for the receiver word. `ScriptedDriver` replays canned replies for
//! tests and records every frame sent.

use std::collections::VecDeque;
use std::sync::Arc;

use errors::{HubError, HubResult};
use parking_lot::Mutex;
use tracing::trace;

use super::commands::{decode_physical, RAW_BUS_ERROR, RAW_NO_BACKWARD_FRAME};

pub trait DaliDriver: Send {
    /// Start a transaction with an encoded transmit word
    fn transmit(&mut self, word: u32) -> HubResult<()>;

    /// Receiver word once the transaction has finished
    fn receive(&mut self) -> Option<u32>;

    /// Drop anything left over from a previous transaction
    fn reset(&mut self) {}
}

impl<D: DaliDriver + ?Sized> DaliDriver for Box<D> {
    fn transmit(&mut self, word: u32) -> HubResult<()> {
        (**self).transmit(word)
    }

    fn receive(&mut self) -> Option<u32> {
        (**self).receive()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

// ============================================================================
// Scripted driver
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Word(u32),
    Silence,
    TransmitFails,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Scripted>,
    pending: Option<u32>,
    sent: Vec<u16>,
}

/// Replays one scripted reply per transmission.
///
/// Clones share the same script, so a test keeps one handle while the bus
/// owns the other. An exhausted script, or a `silence()` entry, leaves the
/// transaction unanswered until the engine times it out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, value: u8) -> &Self {
        self.inner
            .lock()
            .replies
            .push_back(Scripted::Word(u32::from(value)));
        self
    }

    pub fn nak(&self) -> &Self {
        self.inner
            .lock()
            .replies
            .push_back(Scripted::Word(RAW_NO_BACKWARD_FRAME));
        self
    }

    pub fn bus_error(&self) -> &Self {
        self.inner
            .lock()
            .replies
            .push_back(Scripted::Word(RAW_BUS_ERROR));
        self
    }

    pub fn silence(&self) -> &Self {
        self.inner.lock().replies.push_back(Scripted::Silence);
        self
    }

    /// The next transmission fails before reaching the bus
    pub fn transmit_error(&self) -> &Self {
        self.inner.lock().replies.push_back(Scripted::TransmitFails);
        self
    }

    /// Forward frames transmitted so far, decoded
    pub fn sent(&self) -> Vec<u16> {
        self.inner.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<u16> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn remaining(&self) -> usize {
        self.inner.lock().replies.len()
    }
}

impl DaliDriver for ScriptedDriver {
    fn transmit(&mut self, word: u32) -> HubResult<()> {
        let mut script = self.inner.lock();
        let frame = decode_physical(word);
        trace!("scripted tx {:04X}", frame);
        script.pending = match script.replies.pop_front() {
            Some(Scripted::TransmitFails) => {
                return Err(HubError::protocol(
                    "dali",
                    format!("scripted transmit failure for {:04X}", frame),
                ));
            },
            Some(Scripted::Word(word)) => Some(word),
            Some(Scripted::Silence) | None => None,
        };
        script.sent.push(frame);
        Ok(())
    }

    fn receive(&mut self) -> Option<u32> {
        self.inner.lock().pending.take()
    }

    fn reset(&mut self) {
        self.inner.lock().pending = None;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::dali::commands::encode_physical;

    #[test]
    fn test_scripted_replies_follow_transmissions() {
        let script = ScriptedDriver::new();
        script.reply(7).nak().silence();
        let mut driver = script.clone();

        assert_eq!(driver.receive(), None);
        driver.transmit(encode_physical(0x0190)).unwrap();
        assert_eq!(driver.receive(), Some(7));
        assert_eq!(driver.receive(), None);

        driver.transmit(encode_physical(0x0390)).unwrap();
        assert_eq!(driver.receive(), Some(RAW_NO_BACKWARD_FRAME));

        driver.transmit(encode_physical(0x0590)).unwrap();
        assert_eq!(driver.receive(), None);

        assert_eq!(script.sent(), vec![0x0190, 0x0390, 0x0590]);
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn test_transmit_error_is_not_recorded() {
        let script = ScriptedDriver::new();
        script.transmit_error().reply(1);
        let mut driver = script.clone();

        assert!(driver.transmit(encode_physical(0x0190)).is_err());
        assert_eq!(driver.receive(), None);
        driver.transmit(encode_physical(0x0190)).unwrap();
        assert_eq!(driver.receive(), Some(1));
        assert_eq!(script.sent(), vec![0x0190]);
    }
}
