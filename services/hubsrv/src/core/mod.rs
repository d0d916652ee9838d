//! Cooperative engine substrate
//!
//! - `scheduler`: fixed table of resumable tasks
//! - `queue`: bounded command FIFO feeding a single-flight bus executor

pub mod queue;
pub mod scheduler;

pub use queue::CommandQueue;
pub use scheduler::{Scheduler, Spawner, Step, Task, TASKS_MAX};
