//! Resume-point task scheduler
//!
//! A fixed table of suspended computations advanced once per engine pass.
//! Each task is an enum whose variant is its resume point; `advance` picks
//! up from there, and either suspends (`Step::Pending`) or finishes
//! (`Step::Complete`). Finished frames are removed by shifting the later
//! frames down, so the active region stays dense and in start order.

use errors::{HubError, HubResult};
use heapless::Vec;
use tracing::{debug, warn};

/// Maximum number of concurrently suspended tasks
pub const TASKS_MAX: usize = 8;

/// Result of advancing a task once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Suspended; call again on the next pass
    Pending,
    /// Finished; the frame is released
    Complete,
}

/// A suspendable computation driven by the scheduler
pub trait Task<C>: Sized {
    /// Advance from the current resume point.
    ///
    /// Tasks started through `spawner` join the table after the current pass.
    fn advance(&mut self, ctx: &mut C, spawner: &mut Spawner<'_, Self>) -> Step;
}

/// Start handle given to tasks during a pass
pub struct Spawner<'a, T> {
    staged: &'a mut Vec<T, TASKS_MAX>,
    active: usize,
}

impl<T> Spawner<'_, T> {
    pub fn start(&mut self, task: T) -> HubResult<()> {
        if self.active + self.staged.len() >= TASKS_MAX {
            warn!("Too many tasks, start refused");
            return Err(HubError::task_table_full(TASKS_MAX));
        }
        self.staged
            .push(task)
            .map_err(|_| HubError::task_table_full(TASKS_MAX))
    }
}

pub struct Scheduler<T> {
    frames: Vec<T, TASKS_MAX>,
    staged: Vec<T, TASKS_MAX>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    pub const fn new() -> Self {
        Self {
            frames: Vec::new(),
            staged: Vec::new(),
        }
    }

    /// Start a task; fails without touching existing frames when full
    pub fn start(&mut self, task: T) -> HubResult<()> {
        if self.frames.len() + self.staged.len() >= TASKS_MAX {
            warn!("Too many tasks ({} active)", self.frames.len());
            return Err(HubError::task_table_full(TASKS_MAX));
        }
        self.frames
            .push(task)
            .map_err(|_| HubError::task_table_full(TASKS_MAX))?;
        debug!("Task started, {} active", self.frames.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() + self.staged.len() >= TASKS_MAX
    }

    /// Active frames in start order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.frames.iter()
    }

    /// Advance every active frame once, in index order.
    ///
    /// Returns the number of frames that completed during the pass.
    pub fn run_pass<C>(&mut self, ctx: &mut C) -> usize
    where
        T: Task<C>,
    {
        let mut completed = 0;
        let mut index = 0;

        while index < self.frames.len() {
            let active = self.frames.len();
            let mut spawner = Spawner {
                staged: &mut self.staged,
                active,
            };
            let step = self.frames[index].advance(ctx, &mut spawner);

            match step {
                Step::Pending => index += 1,
                Step::Complete => {
                    // The next frame shifts into `index` and is visited next.
                    self.frames.remove(index);
                    completed += 1;
                },
            }
        }

        for task in std::mem::take(&mut self.staged) {
            if self.frames.push(task).is_err() {
                warn!("Too many tasks, staged start dropped");
            }
        }

        if completed > 0 {
            debug!("{} task(s) completed, {} active", completed, self.frames.len());
        }
        completed
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    /// Counts calls and finishes when the shared "done" mask names it.
    #[derive(Debug)]
    enum Probe {
        Waiting { id: u8 },
        Spawning { id: u8, child: u8 },
    }

    #[derive(Default)]
    struct Log {
        calls: std::vec::Vec<u8>,
        finish: u32,
    }

    impl Task<Log> for Probe {
        fn advance(&mut self, log: &mut Log, spawner: &mut Spawner<'_, Self>) -> Step {
            match *self {
                Probe::Waiting { id } => {
                    log.calls.push(id);
                    if log.finish & (1 << id) != 0 {
                        Step::Complete
                    } else {
                        Step::Pending
                    }
                },
                Probe::Spawning { id, child } => {
                    log.calls.push(id);
                    spawner.start(Probe::Waiting { id: child }).unwrap();
                    *self = Probe::Waiting { id };
                    Step::Pending
                },
            }
        }
    }

    #[test]
    fn test_start_fails_when_full() {
        let mut sched = Scheduler::new();
        for id in 0..TASKS_MAX as u8 {
            sched.start(Probe::Waiting { id }).unwrap();
        }
        let err = sched.start(Probe::Waiting { id: 99 }).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(sched.len(), TASKS_MAX);
        // existing frames untouched
        let ids: std::vec::Vec<u8> = sched
            .iter()
            .map(|p| match p {
                Probe::Waiting { id } | Probe::Spawning { id, .. } => *id,
            })
            .collect();
        assert_eq!(ids, (0..TASKS_MAX as u8).collect::<std::vec::Vec<_>>());
    }

    #[test]
    fn test_compaction_keeps_order_and_visits_each_once() {
        let mut sched = Scheduler::new();
        for id in 1..=5 {
            sched.start(Probe::Waiting { id }).unwrap();
        }
        let mut log = Log {
            finish: 1 << 3,
            ..Default::default()
        };

        assert_eq!(sched.run_pass(&mut log), 1);
        assert_eq!(log.calls, vec![1, 2, 3, 4, 5]);
        assert_eq!(sched.len(), 4);

        log.calls.clear();
        log.finish = 0;
        sched.run_pass(&mut log);
        assert_eq!(log.calls, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_adjacent_completions_in_one_pass() {
        let mut sched = Scheduler::new();
        for id in 0..4 {
            sched.start(Probe::Waiting { id }).unwrap();
        }
        let mut log = Log {
            finish: (1 << 1) | (1 << 2),
            ..Default::default()
        };
        assert_eq!(sched.run_pass(&mut log), 2);
        assert_eq!(log.calls, vec![0, 1, 2, 3]);
        assert_eq!(sched.len(), 2);
    }

    #[test]
    fn test_tasks_started_during_pass_run_next_pass() {
        let mut sched = Scheduler::new();
        sched.start(Probe::Spawning { id: 0, child: 7 }).unwrap();
        sched.start(Probe::Waiting { id: 1 }).unwrap();
        let mut log = Log::default();

        sched.run_pass(&mut log);
        assert_eq!(log.calls, vec![0, 1]);
        assert_eq!(sched.len(), 3);

        log.calls.clear();
        sched.run_pass(&mut log);
        assert_eq!(log.calls, vec![0, 1, 7]);
    }

    #[test]
    fn test_spawner_respects_capacity() {
        let mut sched = Scheduler::new();
        for id in 0..TASKS_MAX as u8 - 1 {
            sched.start(Probe::Waiting { id }).unwrap();
        }
        let mut staged = Vec::<Probe, TASKS_MAX>::new();
        let mut spawner = Spawner {
            staged: &mut staged,
            active: sched.len(),
        };
        spawner.start(Probe::Waiting { id: 50 }).unwrap();
        assert!(spawner.start(Probe::Waiting { id: 51 }).is_err());
    }
}
