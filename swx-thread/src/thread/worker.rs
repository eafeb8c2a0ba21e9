//! Data-plane (DP) thread main loop.
//!
//! Each worker lcore runs [`thread_main`]: it waits for the start gate, runs
//! its assignment until the run flag drops, reports the outcome to the
//! registry and waits again, until the registry shuts down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::BoxError;
use crate::thread::registry::{Assignment, Registry};

/// Instructions per pipeline run call.
pub const PIPELINE_INSTR_QUANTA: u32 = 1000;

/// Run loop iterations between two timer checks.
pub const CONTROL_INTERVAL: u32 = 16;

/// Tuning of the data-plane run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ThreadConfig {
    /// Instructions per pipeline run call.
    pub pipeline_quanta: u32,
    /// Iterations between two timer checks.
    pub control_interval: u32,
    /// How long an unassigned worker sleeps between run flag checks.
    #[cfg_attr(feature = "serde", serde(with = "micros", rename = "idle_poll_us"))]
    pub idle_poll: Duration,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            pipeline_quanta: PIPELINE_INSTR_QUANTA,
            control_interval: CONTROL_INTERVAL,
            idle_poll: Duration::from_millis(1),
        }
    }
}

impl ThreadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instructions per pipeline run call (default: 1000).
    pub fn pipeline_quanta(mut self, quanta: u32) -> Self {
        self.pipeline_quanta = quanta.max(1);
        self
    }

    /// Set the iterations between timer checks (default: 16).
    pub fn control_interval(mut self, interval: u32) -> Self {
        self.control_interval = interval.max(1);
        self
    }

    /// Set the idle sleep of unassigned workers (default: 1ms).
    pub fn idle_poll(mut self, poll: Duration) -> Self {
        self.idle_poll = poll;
        self
    }
}

#[cfg(feature = "serde")]
mod micros {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_micros)
    }
}

/// Main function of a worker thread.
///
/// `idx` is the worker's position in the registry.
pub fn thread_main(registry: Arc<Registry>, idx: usize, config: ThreadConfig) {
    let lcore = registry.lcore_at(idx);
    lcore.pin_current();
    info!(lcore_id = lcore.id(), "Worker thread ready");

    while let Some(assignment) = registry.wait_for_start(idx) {
        debug!(lcore_id = lcore.id(), "Run loop starting");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
            run_loop(&registry, idx, assignment, &config)
        })) {
            Ok(res) => res.map_err(|e| e.to_string()),
            Err(payload) => Err(panic_message(payload.as_ref())),
        };
        registry.finish(idx, outcome);
    }

    registry.retire(idx);
    info!(lcore_id = lcore.id(), "Worker thread exiting");
}

fn run_loop(
    registry: &Registry,
    idx: usize,
    assignment: Option<Assignment>,
    config: &ThreadConfig,
) -> Result<(), BoxError> {
    let running = registry.run_flag(idx);

    match assignment {
        Some(Assignment::Pipeline(pref)) => {
            let Some(pipeline) = pref.upgrade() else {
                return Err(format!("pipeline {} was released", pref.name()).into());
            };
            let period = pref.timer_period();
            let interval = config.control_interval.max(1);
            let mut next_timer = Instant::now() + period;
            let mut i: u32 = 0;
            while running.load(Ordering::Acquire) {
                pipeline.run(config.pipeline_quanta)?;

                i = i.wrapping_add(1);
                if i % interval == 0 {
                    let now = Instant::now();
                    if now >= next_timer {
                        pipeline.timer()?;
                        next_timer = now + period;
                    }
                }
            }
        }
        Some(Assignment::Block(block)) => {
            while running.load(Ordering::Acquire) {
                block.run()?;
            }
        }
        None => {
            while running.load(Ordering::Acquire) {
                std::thread::sleep(config.idle_poll);
            }
        }
    }
    Ok(())
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
