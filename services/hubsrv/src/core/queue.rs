//! Bounded FIFO of pending bus commands
//!
//! Storage is a fixed `heapless::Deque`; commands are moved in by value and
//! nothing is allocated per enqueue.

use errors::{HubError, HubResult};
use heapless::Deque;
use tracing::warn;

pub struct CommandQueue<T, const N: usize> {
    bus: &'static str,
    entries: Deque<T, N>,
}

impl<T, const N: usize> CommandQueue<T, N> {
    pub const fn new(bus: &'static str) -> Self {
        Self {
            bus,
            entries: Deque::new(),
        }
    }

    /// Append a command; the command is dropped and an error returned when full
    pub fn enqueue(&mut self, command: T) -> HubResult<()> {
        if self.entries.push_back(command).is_err() {
            warn!("{} queue full ({} entries), command dropped", self.bus, N);
            return Err(HubError::queue_full(self.bus, N));
        }
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue: CommandQueue<u16, 4> = CommandQueue::new("test");
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        queue.enqueue(3).unwrap();
        assert_eq!(queue.dequeue(), Some(1));
        queue.enqueue(4).unwrap();
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut queue: CommandQueue<u16, 2> = CommandQueue::new("modbus");
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        assert!(queue.is_full());

        let err = queue.enqueue(3).unwrap_err();
        assert!(matches!(err, HubError::QueueFull { bus: "modbus", depth: 2 }));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue(), Some(1));
    }
}
