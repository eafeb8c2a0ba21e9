//! Blocks: generic callback units run repeatedly on a worker lcore.
//!
//! Blocks carry auxiliary periodic work, such as statistics collection, that
//! is independent of pipeline semantics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::BoxError;

/// A unit of work a worker runs repeatedly while started.
pub trait Block: Send + Sync {
    fn name(&self) -> &str {
        "block"
    }

    /// One iteration. An error stops the worker and puts it in error state.
    fn run(&self) -> Result<(), BoxError>;
}

/// Whether two handles refer to the same block instance.
pub(crate) fn same(a: &Arc<dyn Block>, b: &Arc<dyn Block>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A block backed by a closure.
pub struct FnBlock<F> {
    name: String,
    f: F,
}

/// Create a block from a closure.
pub fn from_fn<F>(f: F) -> FnBlock<F>
where
    F: Fn() -> Result<(), BoxError> + Send + Sync,
{
    FnBlock {
        name: "block".to_string(),
        f,
    }
}

impl<F> FnBlock<F> {
    /// Name used in logs and worker snapshots.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F> Block for FnBlock<F>
where
    F: Fn() -> Result<(), BoxError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), BoxError> {
        (self.f)()
    }
}

/// Runs the inner block at most once per period.
///
/// Iterations in between return immediately, so the worker keeps spinning at
/// full rate without invoking the inner block.
pub struct Periodic<B> {
    inner: B,
    period: Duration,
    due: Mutex<Due>,
}

#[derive(Clone, Copy)]
enum Due {
    Now,
    At(Instant),
    /// The period reaches past what `Instant` can represent.
    Never,
}

impl<B: Block> Periodic<B> {
    pub fn new(inner: B, period: Duration) -> Self {
        Self {
            inner,
            period,
            due: Mutex::new(Due::Now),
        }
    }
}

impl<B: Block> Block for Periodic<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self) -> Result<(), BoxError> {
        let now = Instant::now();
        let mut due = self.due.lock();
        match *due {
            Due::At(deadline) if now < deadline => return Ok(()),
            Due::Never => return Ok(()),
            Due::Now | Due::At(_) => {}
        }
        *due = now.checked_add(self.period).map_or(Due::Never, Due::At);
        drop(due);
        self.inner.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fn_block() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let block = from_fn(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .named("stats");

        assert_eq!(block.name(), "stats");
        block.run().unwrap();
        block.run().unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_fn_block_error() {
        let block = from_fn(|| Err("no ring".into()));
        assert_eq!(block.run().unwrap_err().to_string(), "no ring");
    }

    #[test]
    fn test_periodic_rate_limits() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let block = Periodic::new(
            from_fn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
            Duration::from_secs(3600),
        );

        for _ in 0..100 {
            block.run().unwrap();
        }
        // First call runs, the rest fall inside the period.
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_periodic_zero_period_runs_every_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let block = Periodic::new(
            from_fn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
            Duration::ZERO,
        );
        for _ in 0..5 {
            block.run().unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_periodic_unbounded_period() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let block = Periodic::new(
            from_fn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
            Duration::MAX,
        );
        for _ in 0..10 {
            block.run().unwrap();
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_same_block() {
        let a: Arc<dyn Block> = Arc::new(from_fn(|| Ok(())));
        let b: Arc<dyn Block> = Arc::new(from_fn(|| Ok(())));
        assert!(same(&a, &a.clone()));
        assert!(!same(&a, &b));
    }
}
