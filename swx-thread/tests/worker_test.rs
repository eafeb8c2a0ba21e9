//! Worker lifecycle tests
//!
//! Drives real worker threads through the runtime: assignment, the start
//! gate, disable, failure and teardown.
//!
//! Note: the EAL can only be initialized once per process at a time, so every
//! test is serialized.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use swx_thread::api::rte::eal::EalBuilder;
use swx_thread::thread::block::{self, Block, Periodic};
use swx_thread::thread::pipeline::Pipeline;
use swx_thread::{BoxError, Error, Runtime, State, ThreadConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Pipeline that counts run and timer calls, and optionally fails.
#[derive(Default)]
struct CountingPipeline {
    name: String,
    runs: AtomicU64,
    timers: AtomicU64,
    fail_after: Option<u64>,
}

impl CountingPipeline {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn failing_after(name: &str, runs: u64) -> Self {
        Self {
            fail_after: Some(runs),
            ..Self::new(name)
        }
    }
}

impl Pipeline for CountingPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, quanta: u32) -> Result<(), BoxError> {
        assert_eq!(quanta, 64);
        let n = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        match self.fail_after {
            Some(limit) if n >= limit => Err(format!("{} lost its output port", self.name).into()),
            _ => Ok(()),
        }
    }

    fn timer(&self) -> Result<(), BoxError> {
        self.timers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn config() -> ThreadConfig {
    ThreadConfig::new()
        .pipeline_quanta(64)
        .control_interval(4)
        .idle_poll(Duration::from_micros(200))
}

fn runtime(cores: &str) -> Runtime {
    Runtime::init(EalBuilder::new().program_name("worker_test").core_list(cores), config())
        .expect("Failed to initialize runtime")
}

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn counting_block(counter: Arc<AtomicU64>, name: &str) -> Arc<dyn Block> {
    Arc::new(
        block::from_fn(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .named(name),
    )
}

/// Test: workers {1,2,3}: pipeline on 1, block on 2, nothing on 3.
#[test]
#[serial_test::serial]
fn test_fleet_start_mixed_assignments() {
    let rt = runtime("0-3");
    let reg = rt.registry();
    assert_eq!(reg.workers(), vec![1, 2, 3]);

    let counting = Arc::new(CountingPipeline::new("PIPELINE0"));
    let pipeline: Arc<dyn Pipeline> = counting.clone();
    let block_runs = Arc::new(AtomicU64::new(0));
    let stats = counting_block(block_runs.clone(), "stats");

    reg.assign_pipeline(1, &pipeline, 1).unwrap();
    reg.assign_block(stats.clone(), 2).unwrap();

    rt.start().unwrap();
    assert!(rt.is_running());
    for id in [1, 2, 3] {
        assert_eq!(reg.state(id), Ok(State::Running));
    }

    assert!(eventually(|| counting.runs.load(Ordering::Relaxed) > 100));
    assert!(eventually(|| counting.timers.load(Ordering::Relaxed) > 0));
    assert!(eventually(|| block_runs.load(Ordering::Relaxed) > 100));

    // Second start without any stop must not restart anything.
    assert!(matches!(rt.start(), Err(Error::NotReady { state: State::Running, .. })));

    assert!(rt.stop(TIMEOUT));
    for id in [1, 2, 3] {
        assert_eq!(reg.state(id), Ok(State::Idle));
    }

    // Assignments survive a fleet stop.
    let snapshot = reg.snapshot();
    assert_eq!(snapshot[0].assignment.as_deref(), Some("pipeline PIPELINE0"));
    assert_eq!(snapshot[1].assignment.as_deref(), Some("block stats"));
    assert_eq!(snapshot[2].assignment, None);

    let runs = counting.runs.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(counting.runs.load(Ordering::Relaxed), runs);

    rt.start().unwrap();
    assert!(eventually(|| counting.runs.load(Ordering::Relaxed) > runs));
    rt.shutdown(TIMEOUT);
}

/// Test: disabling a running pipeline returns its worker to idle.
#[test]
#[serial_test::serial]
fn test_disable_running_pipeline() {
    let rt = runtime("0-2");
    let reg = rt.registry();

    let counting = Arc::new(CountingPipeline::new("PIPELINE0"));
    let pipeline: Arc<dyn Pipeline> = counting.clone();
    reg.assign_pipeline(1, &pipeline, 10).unwrap();
    rt.start().unwrap();
    assert!(eventually(|| counting.runs.load(Ordering::Relaxed) > 0));

    reg.clear_pipeline(1).unwrap();
    assert!(reg.wait_state(1, State::Idle, TIMEOUT).unwrap());
    let runs = counting.runs.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(counting.runs.load(Ordering::Relaxed), runs);

    // Worker 2 keeps running; the gate refuses until the whole fleet is idle.
    assert_eq!(reg.state(2), Ok(State::Running));
    assert!(matches!(rt.start(), Err(Error::NotReady { id: 2, .. })));

    // Worker 1 is idle again and accepts a new assignment.
    reg.assign_pipeline(1, &pipeline, 10).unwrap();
    assert!(rt.stop(TIMEOUT));
    rt.start().unwrap();
    assert!(eventually(|| counting.runs.load(Ordering::Relaxed) > runs));
    rt.shutdown(TIMEOUT);
}

/// Test: a failing pipeline puts its worker in error state.
#[test]
#[serial_test::serial]
fn test_pipeline_failure() {
    let rt = runtime("0-1");
    let reg = rt.registry();

    let pipeline: Arc<dyn Pipeline> = Arc::new(CountingPipeline::failing_after("PIPELINE0", 5));
    reg.assign_pipeline(1, &pipeline, 10).unwrap();
    rt.start().unwrap();

    assert!(reg.wait_state(1, State::Error, TIMEOUT).unwrap());
    let info = reg.info(1).unwrap();
    assert_eq!(info.error.as_deref(), Some("PIPELINE0 lost its output port"));
    assert!(matches!(rt.start(), Err(Error::NotReady { state: State::Error, .. })));

    // Disabling the failed pipeline brings the worker back.
    reg.clear_pipeline(1).unwrap();
    assert_eq!(reg.state(1), Ok(State::Idle));
    rt.start().unwrap();
    rt.shutdown(TIMEOUT);
}

/// Test: a panicking block is contained to its worker.
#[test]
#[serial_test::serial]
fn test_block_panic_contained() {
    let rt = runtime("0-2");
    let reg = rt.registry();

    let bad: Arc<dyn Block> = Arc::new(block::from_fn(|| panic!("corrupt context")).named("bad"));
    let good_runs = Arc::new(AtomicU64::new(0));
    reg.assign_block(bad.clone(), 1).unwrap();
    reg.assign_block(counting_block(good_runs.clone(), "good"), 2).unwrap();
    rt.start().unwrap();

    assert!(reg.wait_state(1, State::Error, TIMEOUT).unwrap());
    assert_eq!(
        reg.info(1).unwrap().error.as_deref(),
        Some("panicked: corrupt context")
    );
    assert!(eventually(|| good_runs.load(Ordering::Relaxed) > 0));
    assert_eq!(reg.state(2), Ok(State::Running));

    // The worker thread survived and can run again after a reset.
    reg.reset(1).unwrap();
    reg.clear_block(&bad);
    assert!(rt.stop(TIMEOUT));
    rt.start().unwrap();
    assert_eq!(reg.state(1), Ok(State::Running));
    rt.shutdown(TIMEOUT);
}

/// Test: a pipeline released by its owner fails the worker instead of
/// being kept alive by the registry.
#[test]
#[serial_test::serial]
fn test_released_pipeline() {
    let rt = runtime("0-1");
    let reg = rt.registry();

    let pipeline: Arc<dyn Pipeline> = Arc::new(CountingPipeline::new("PIPELINE0"));
    reg.assign_pipeline(1, &pipeline, 10).unwrap();
    drop(pipeline);
    rt.start().unwrap();

    assert!(reg.wait_state(1, State::Error, TIMEOUT).unwrap());
    assert_eq!(
        reg.info(1).unwrap().error.as_deref(),
        Some("pipeline PIPELINE0 was released")
    );
    rt.shutdown(TIMEOUT);
}

/// Test: a periodic block runs at its own pace on a spinning worker.
#[test]
#[serial_test::serial]
fn test_periodic_block() {
    let rt = runtime("0-1");
    let reg = rt.registry();

    let ticks = Arc::new(AtomicU64::new(0));
    let counter = ticks.clone();
    let heartbeat: Arc<dyn Block> = Arc::new(Periodic::new(
        block::from_fn(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .named("heartbeat"),
        Duration::from_secs(3600),
    ));
    reg.assign_block(heartbeat, 1).unwrap();
    rt.start().unwrap();

    assert!(eventually(|| ticks.load(Ordering::Relaxed) == 1));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ticks.load(Ordering::Relaxed), 1);
    rt.shutdown(TIMEOUT);
}

/// Test: shutdown retires every worker.
#[test]
#[serial_test::serial]
fn test_shutdown_retires_workers() {
    let rt = runtime("0-2");
    let reg = rt.registry().clone();
    rt.start().unwrap();
    rt.shutdown(Duration::MAX);

    for info in reg.snapshot() {
        assert_eq!(info.state, State::Error);
        assert_eq!(info.error.as_deref(), Some("worker thread exited"));
    }
    assert!(reg.start().is_err());

    // The EAL is released and can be brought up again.
    let rt = runtime("0-1");
    rt.shutdown(TIMEOUT);
}

/// Test: a block that never yields does not hold up teardown.
#[test]
#[serial_test::serial]
fn test_shutdown_leaves_stuck_worker() {
    let rt = runtime("0-2");
    let reg = rt.registry().clone();

    let release = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicBool::new(false));
    let (gate, seen) = (release.clone(), entered.clone());
    let stuck: Arc<dyn Block> = Arc::new(
        block::from_fn(move || {
            seen.store(true, Ordering::Release);
            while !gate.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
        .named("stuck"),
    );
    reg.assign_block(stuck, 1).unwrap();
    rt.start().unwrap();
    assert!(eventually(|| entered.load(Ordering::Acquire)));

    let begin = Instant::now();
    rt.shutdown(Duration::from_millis(50));
    assert!(begin.elapsed() < TIMEOUT);
    assert_eq!(reg.state(1), Ok(State::Stopping));
    assert_eq!(reg.state(2), Ok(State::Error));

    // Once the block returns, the detached thread retires on its own.
    release.store(true, Ordering::Release);
    assert!(reg.wait_state(1, State::Error, TIMEOUT).unwrap());
    assert_eq!(
        reg.info(1).unwrap().error.as_deref(),
        Some("worker thread exited")
    );
}
