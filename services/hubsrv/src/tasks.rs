//! Long-running engine tasks
//!
//! Each variant is a resume point; `advance` checks its wake condition
//! against the pass time and suspends again until it holds.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buttons::SCAN_PERIOD;
use crate::core::{Spawner, Step, Task};
use crate::hub::EngineCtx;

/// Button ticks caught up in one pass before the scan is resynchronised
const MAX_BUTTON_CATCH_UP: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubTask {
    /// Let the RS-485 transceiver settle, then read every relay output
    SerialWarmup { ready_at: Instant },
    /// Re-read relay outputs periodically
    CoilRefresh { next_at: Instant, period: Duration },
    /// Wait for the running DALI scan to finish
    ScanWatch { started_at: Instant },
    /// Drive the button state machines every scan period
    ButtonScan { next_at: Instant },
}

impl Task<EngineCtx> for HubTask {
    fn advance(&mut self, ctx: &mut EngineCtx, spawner: &mut Spawner<'_, Self>) -> Step {
        let now = ctx.now;
        match self {
            HubTask::SerialWarmup { ready_at } => {
                if now < *ready_at {
                    return Step::Pending;
                }
                debug!("Serial warm-up done, reading relay outputs");
                ctx.read_coils();
                if let Some(period) = ctx.settings.coil_refresh {
                    let refresh = HubTask::CoilRefresh {
                        next_at: now + period,
                        period,
                    };
                    if let Err(e) = spawner.start(refresh) {
                        warn!("Coil refresh not started: {}", e);
                    }
                }
                Step::Complete
            },

            HubTask::CoilRefresh { next_at, period } => {
                if now >= *next_at {
                    ctx.read_coils();
                    *next_at = now + *period;
                }
                Step::Pending
            },

            HubTask::ScanWatch { started_at } => {
                if ctx.dali.is_scanning() {
                    return Step::Pending;
                }
                info!(
                    "DALI scan finished in {:?}: {} device(s)",
                    now.saturating_duration_since(*started_at),
                    ctx.dali.last_scan_found().unwrap_or(0)
                );
                Step::Complete
            },

            HubTask::ButtonScan { next_at } => {
                let mut caught_up = 0;
                while now >= *next_at {
                    if caught_up == MAX_BUTTON_CATCH_UP {
                        warn!("Button scan fell behind, resynchronising");
                        *next_at = now + SCAN_PERIOD;
                        break;
                    }
                    let actions = ctx.buttons.tick(&ctx.regs.lock());
                    for action in actions {
                        ctx.apply_button_action(action);
                    }
                    *next_at += SCAN_PERIOD;
                    caught_up += 1;
                }
                Step::Pending
            },
        }
    }
}
