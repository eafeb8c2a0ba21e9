//! Worker registry: per-worker lifecycle state, assignments and the
//! fleet-wide start gate.
//!
//! One mutex guards the whole registry. Mutations happen at setup time, not
//! per packet, so there is no finer-grained locking. The only lock-free path
//! is the per-worker run flag that the data-plane loop polls between
//! iterations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::api::error::{Error, Result};
use crate::api::rte::lcore::Lcore;
use crate::thread::block::{self, Block};
use crate::thread::pipeline::{Pipeline, PipelineRef};
use crate::thread::state::{State, WorkerInfo};

/// The unit of work held by a worker.
#[derive(Clone)]
pub(crate) enum Assignment {
    Pipeline(PipelineRef),
    Block(Arc<dyn Block>),
}

impl Assignment {
    fn describe(&self) -> String {
        match self {
            Assignment::Pipeline(p) => format!("pipeline {}", p.name()),
            Assignment::Block(b) => format!("block {}", b.name()),
        }
    }
}

struct Slot {
    lcore: Lcore,
    state: State,
    assignment: Option<Assignment>,
    error: Option<String>,
    /// The worker thread has exited; the slot can never run again.
    retired: bool,
}

impl Slot {
    fn holds_pipeline(&self, pipeline: &Arc<dyn Pipeline>) -> bool {
        matches!(&self.assignment, Some(Assignment::Pipeline(p)) if p.is(pipeline))
    }

    fn holds_block(&self, b: &Arc<dyn Block>) -> bool {
        matches!(&self.assignment, Some(Assignment::Block(own)) if block::same(own, b))
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.lcore.id(),
            state: self.state,
            assignment: self.assignment.as_ref().map(Assignment::describe),
            error: self.error.clone(),
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    shutdown: bool,
}

/// Registry of data-plane workers, indexed by worker (lcore) id.
pub struct Registry {
    inner: Mutex<Inner>,
    changed: Condvar,
    run: Box<[AtomicBool]>,
}

impl Registry {
    /// Create a registry with one idle, unassigned worker per lcore.
    pub fn new(workers: impl IntoIterator<Item = Lcore>) -> Self {
        let slots: Vec<Slot> = workers
            .into_iter()
            .map(|lcore| Slot {
                lcore,
                state: State::Idle,
                assignment: None,
                error: None,
                retired: false,
            })
            .collect();
        let run = slots.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            inner: Mutex::new(Inner {
                slots,
                shutdown: false,
            }),
            changed: Condvar::new(),
            run,
        }
    }

    fn index(inner: &Inner, id: u32) -> Result<usize> {
        inner
            .slots
            .iter()
            .position(|s| s.lcore.id() == id)
            .ok_or(Error::UnknownWorker(id))
    }

    /// Check that the worker at `idx` can take a new assignment.
    fn check_assignable(inner: &Inner, idx: usize) -> Result<()> {
        let slot = &inner.slots[idx];
        if slot.state != State::Idle || slot.assignment.is_some() {
            return Err(Error::InvalidState {
                id: slot.lcore.id(),
                state: slot.state,
            });
        }
        Ok(())
    }

    /// Drop the assignment of a worker, requesting its run loop to stop if
    /// it is running.
    fn release(&self, inner: &mut Inner, idx: usize) -> Option<Assignment> {
        let slot = &mut inner.slots[idx];
        let unit = slot.assignment.take();
        match slot.state {
            State::Running => {
                slot.state = State::Stopping;
                self.run[idx].store(false, Ordering::Release);
            }
            State::Error if !slot.retired => {
                slot.state = State::Idle;
                slot.error = None;
            }
            _ => {}
        }
        unit
    }

    // ==================== Queries ====================

    /// Ids of all configured workers, in registry order.
    pub fn workers(&self) -> Vec<u32> {
        self.inner.lock().slots.iter().map(|s| s.lcore.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.run.is_empty()
    }

    /// Current lifecycle state of a worker.
    pub fn state(&self, id: u32) -> Result<State> {
        let inner = self.inner.lock();
        let idx = Self::index(&inner, id)?;
        Ok(inner.slots[idx].state)
    }

    /// Whether the worker is executing its run loop.
    pub fn is_running(&self, id: u32) -> Result<bool> {
        Ok(self.state(id)? == State::Running)
    }

    /// Point-in-time view of one worker.
    pub fn info(&self, id: u32) -> Result<WorkerInfo> {
        let inner = self.inner.lock();
        let idx = Self::index(&inner, id)?;
        Ok(inner.slots[idx].info())
    }

    /// Point-in-time view of every worker.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.inner.lock().slots.iter().map(Slot::info).collect()
    }

    // ==================== Assignment ====================

    /// Enable a pipeline on an idle worker.
    ///
    /// The registry keeps a non-owning reference; the engine stays the owner
    /// of the pipeline. The pipeline's timer hook runs once per
    /// `timer_period_ms` (0 selects the 10 ms default).
    pub fn assign_pipeline(
        &self,
        id: u32,
        pipeline: &Arc<dyn Pipeline>,
        timer_period_ms: u32,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = Self::index(&inner, id)?;
        Self::check_assignable(&inner, idx)?;
        if let Some(other) = inner.slots.iter().find(|s| s.holds_pipeline(pipeline)) {
            return Err(Error::AlreadyAssigned {
                id: other.lcore.id(),
                unit: format!("pipeline {}", pipeline.name()),
            });
        }

        inner.slots[idx].assignment = Some(Assignment::Pipeline(PipelineRef::new(
            pipeline,
            timer_period_ms,
        )));
        info!(
            worker = id,
            pipeline = pipeline.name(),
            timer_period_ms,
            "Pipeline enabled"
        );
        Ok(())
    }

    /// Remove the pipeline association of a worker.
    ///
    /// Idempotent: a worker without a pipeline is left untouched. If the
    /// worker is running, its run loop is asked to stop and it returns to
    /// idle once the loop has observed the request.
    pub fn clear_pipeline(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = Self::index(&inner, id)?;
        if !matches!(inner.slots[idx].assignment, Some(Assignment::Pipeline(_))) {
            return Ok(());
        }
        if let Some(unit) = self.release(&mut inner, idx) {
            info!(worker = id, unit = %unit.describe(), state = %inner.slots[idx].state, "Pipeline disabled");
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Enable a block on an idle worker.
    pub fn assign_block(&self, block: Arc<dyn Block>, id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = Self::index(&inner, id)?;
        Self::check_assignable(&inner, idx)?;
        if let Some(other) = inner.slots.iter().find(|s| s.holds_block(&block)) {
            return Err(Error::AlreadyAssigned {
                id: other.lcore.id(),
                unit: format!("block {}", block.name()),
            });
        }

        info!(worker = id, block = block.name(), "Block enabled");
        inner.slots[idx].assignment = Some(Assignment::Block(block));
        Ok(())
    }

    /// Remove a block from whichever worker holds it.
    ///
    /// Returns immediately; use [`wait_state`](Self::wait_state) or
    /// [`wait_settled`](Self::wait_settled) to wait for the run loop to let go
    /// of it. Clearing a block that is not enabled anywhere is a no-op.
    pub fn clear_block(&self, block: &Arc<dyn Block>) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.slots.iter().position(|s| s.holds_block(block)) else {
            debug!(block = block.name(), "Block not enabled, nothing to clear");
            return;
        };
        self.release(&mut inner, idx);
        let slot = &inner.slots[idx];
        info!(worker = slot.lcore.id(), block = block.name(), state = %slot.state, "Block disabled");
        self.changed.notify_all();
    }

    /// Return a failed worker to idle, keeping its assignment so the fleet
    /// can be started again.
    pub fn reset(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = Self::index(&inner, id)?;
        let slot = &mut inner.slots[idx];
        match slot.state {
            State::Error if !slot.retired => {
                slot.state = State::Idle;
                slot.error = None;
                info!(worker = id, "Worker reset");
                self.changed.notify_all();
                Ok(())
            }
            State::Idle => Ok(()),
            state => Err(Error::InvalidState { id, state }),
        }
    }

    // ==================== Start gate ====================

    /// Start every worker, or none of them.
    ///
    /// All configured workers must be idle. A worker without an assignment
    /// still starts and runs nothing until stopped. If any worker is not idle
    /// the call fails with `NotReady` and no worker changes state.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(busy) = inner.slots.iter().find(|s| s.state != State::Idle) {
            warn!(worker = busy.lcore.id(), state = %busy.state, "Fleet start refused");
            return Err(Error::NotReady {
                id: busy.lcore.id(),
                state: busy.state,
            });
        }

        for (idx, slot) in inner.slots.iter_mut().enumerate() {
            slot.state = State::Running;
            self.run[idx].store(true, Ordering::Release);
        }
        info!(workers = inner.slots.len(), "Fleet started");
        self.changed.notify_all();
        Ok(())
    }

    /// Ask every running worker to stop, keeping assignments.
    ///
    /// Returns the number of workers asked to stop.
    pub fn stop(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut stopped = 0;
        for (idx, slot) in inner.slots.iter_mut().enumerate() {
            if slot.state == State::Running {
                slot.state = State::Stopping;
                self.run[idx].store(false, Ordering::Release);
                stopped += 1;
            }
        }
        info!(stopped, "Fleet stop requested");
        self.changed.notify_all();
        stopped
    }

    // ==================== Waiting ====================

    /// Block until the worker reaches `state` or the timeout expires.
    ///
    /// Returns whether the state was reached. A timeout too large to be
    /// represented waits without limit.
    pub fn wait_state(&self, id: u32, state: State, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        let idx = Self::index(&inner, id)?;
        Ok(self.wait_until(&mut inner, deadline, |inner| {
            inner.slots[idx].state == state
        }))
    }

    /// Block until no worker is stopping, or the timeout expires.
    ///
    /// Returns whether all stop requests were observed.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        self.wait_until(&mut inner, deadline, |inner| {
            inner.slots.iter().all(|s| s.state != State::Stopping)
        })
    }

    fn wait_until(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        deadline: Option<Instant>,
        done: impl Fn(&Inner) -> bool,
    ) -> bool {
        while !done(&**inner) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(inner, deadline).timed_out() {
                        return done(&**inner);
                    }
                }
                None => self.changed.wait(inner),
            }
        }
        true
    }

    // ==================== Worker side ====================

    pub(crate) fn lcore_at(&self, idx: usize) -> Lcore {
        self.inner.lock().slots[idx].lcore
    }

    pub(crate) fn run_flag(&self, idx: usize) -> &AtomicBool {
        &self.run[idx]
    }

    /// Block the worker at `idx` until the start gate opens.
    ///
    /// Returns the assignment snapshot to run (`None` inside means run
    /// nothing), or `None` once the registry shuts down.
    pub(crate) fn wait_for_start(&self, idx: usize) -> Option<Option<Assignment>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown {
                return None;
            }
            let slot = &mut inner.slots[idx];
            match slot.state {
                State::Running => return Some(slot.assignment.clone()),
                // Disabled before the loop ever ran.
                State::Stopping => {
                    slot.state = State::Idle;
                    self.changed.notify_all();
                }
                State::Idle | State::Error => {}
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Record the end of a run loop.
    pub(crate) fn finish(&self, idx: usize, outcome: std::result::Result<(), String>) {
        let mut inner = self.inner.lock();
        self.run[idx].store(false, Ordering::Release);
        let slot = &mut inner.slots[idx];
        let id = slot.lcore.id();
        match outcome {
            Ok(()) => {
                slot.state = State::Idle;
                debug!(worker = id, "Run loop stopped");
            }
            // The assignment was already cleared; the failure no longer
            // belongs to anything.
            Err(reason) if slot.state == State::Stopping && slot.assignment.is_none() => {
                warn!(worker = id, %reason, "Run loop failed while being disabled");
                slot.state = State::Idle;
            }
            Err(reason) => {
                tracing::error!(worker = id, %reason, "Run loop failed");
                slot.state = State::Error;
                slot.error = Some(reason);
            }
        }
        self.changed.notify_all();
    }

    /// Mark the worker at `idx` as gone for good.
    pub(crate) fn retire(&self, idx: usize) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[idx];
        slot.state = State::Error;
        slot.retired = true;
        slot.error = Some("worker thread exited".to_string());
        self.changed.notify_all();
    }

    /// Stop every worker and release their threads from the start wait.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        for (idx, slot) in inner.slots.iter_mut().enumerate() {
            if slot.state == State::Running {
                slot.state = State::Stopping;
            }
            self.run[idx].store(false, Ordering::Release);
        }
        debug!("Registry shut down");
        self.changed.notify_all();
    }
}
