//! Pipeline interface consumed from the packet-processing engine.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::BoxError;

/// Timer period used when a pipeline is enabled with a period of 0.
pub const DEFAULT_TIMER_PERIOD_MS: u32 = 10;

/// A compiled packet-processing pipeline owned by the engine.
///
/// The worker that a pipeline is enabled on calls [`run`](Pipeline::run) in a
/// tight loop and [`timer`](Pipeline::timer) once per timer period.
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Execute up to `quanta` pipeline instructions.
    fn run(&self, quanta: u32) -> Result<(), BoxError>;

    /// Timer-driven maintenance.
    fn timer(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Non-owning reference to an engine pipeline, plus its timer period.
///
/// The engine keeps the pipeline alive; once it releases it the reference
/// no longer upgrades and the worker running it fails.
#[derive(Clone)]
pub(crate) struct PipelineRef {
    inner: Weak<dyn Pipeline>,
    name: String,
    timer_period: Duration,
}

impl PipelineRef {
    pub(crate) fn new(pipeline: &Arc<dyn Pipeline>, timer_period_ms: u32) -> Self {
        let ms = match timer_period_ms {
            0 => DEFAULT_TIMER_PERIOD_MS,
            ms => ms,
        };
        Self {
            inner: Arc::downgrade(pipeline),
            name: pipeline.name().to_string(),
            timer_period: Duration::from_millis(u64::from(ms)),
        }
    }

    /// Whether this reference points at `pipeline`.
    pub(crate) fn is(&self, pipeline: &Arc<dyn Pipeline>) -> bool {
        std::ptr::addr_eq(self.inner.as_ptr(), Arc::as_ptr(pipeline))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Pipeline>> {
        self.inner.upgrade()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn timer_period(&self) -> Duration {
        self.timer_period
    }
}
