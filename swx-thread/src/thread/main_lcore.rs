//! Main lcore executor.
//!
//! Coordinator work runs on one thread pinned to the main lcore. Other
//! threads hand it jobs over a channel and receive the result, or the panic
//! the job raised, as an error.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::error::{Error, Result};
use crate::api::rte::lcore::Lcore;
use crate::thread::registry::Registry;
use crate::thread::worker::panic_message;

type Job = Box<dyn FnOnce(&mut MainContext) + Send>;

/// Context handed to every job run on the main lcore.
pub struct MainContext {
    lcore: Lcore,
    registry: Arc<Registry>,
    /// Caller state. Persists from one job to the next.
    pub value: Option<Box<dyn Any + Send>>,
}

impl MainContext {
    pub fn lcore(&self) -> Lcore {
        self.lcore
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Serves jobs on the main lcore until stopped.
pub struct MainExecutor {
    lcore: Lcore,
    jobs: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MainExecutor {
    pub(crate) fn spawn(lcore: Lcore, registry: Arc<Registry>) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        let handle = thread::Builder::new()
            .name(format!("swx-main-lcore-{}", lcore.id()))
            .spawn(move || serve(lcore, registry, rx))?;
        Ok(Self {
            lcore,
            jobs: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn lcore(&self) -> Lcore {
        self.lcore
    }

    /// Queue `f` on the main lcore and return a receiver for its result.
    ///
    /// Jobs run one at a time in submission order. A job that panics yields
    /// `MainLcorePanic`; once the executor is stopped every job yields
    /// `ExecutorStopped`.
    pub fn exec_async<F, R>(&self, f: F) -> Receiver<Result<R>>
    where
        F: FnOnce(&mut MainContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (ret, rx) = channel::bounded(1);
        let refused = ret.clone();
        let job: Job = Box::new(move |ctx| {
            let res = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)))
                .map_err(|payload| Error::MainLcorePanic(panic_message(payload.as_ref())));
            // The caller may have dropped the receiver.
            let _ = ret.send(res);
        });

        let queued = match &*self.jobs.lock() {
            Some(jobs) => jobs.send(job).is_ok(),
            None => false,
        };
        if !queued {
            let _ = refused.send(Err(Error::ExecutorStopped));
        }
        rx
    }

    /// Run `f` on the main lcore and wait for its result.
    ///
    /// Must not be called from a job: the executor would wait on itself.
    pub fn exec<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MainContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.exec_async(f)
            .recv()
            .unwrap_or(Err(Error::ExecutorStopped))
    }

    /// Stop accepting jobs, run the ones already queued and join the thread.
    pub(crate) fn stop(&self) {
        drop(self.jobs.lock().take());
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!("Main lcore executor stopped from its own job, not joining");
            return;
        }
        if handle.join().is_err() {
            warn!(lcore_id = self.lcore.id(), "Main lcore executor panicked");
        }
    }
}

fn serve(lcore: Lcore, registry: Arc<Registry>, jobs: Receiver<Job>) {
    lcore.pin_current();
    info!(lcore_id = lcore.id(), "Main lcore executor ready");

    let mut ctx = MainContext {
        lcore,
        registry,
        value: None,
    };
    // Ends once every sender is gone and the queue is empty.
    for job in jobs.iter() {
        job(&mut ctx);
    }
    info!(lcore_id = lcore.id(), "Main lcore executor exiting");
}
