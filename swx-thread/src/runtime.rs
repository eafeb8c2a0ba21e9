//! Runtime: EAL bring-up, worker thread creation and teardown.
//!
//! Workers are created once, at initialization, one thread per worker lcore.
//! They start idle and only run after the fleet passes the start gate.
//! Coordinator jobs run on a separate thread pinned to the main lcore.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use swx_thread::api::rte::eal::EalBuilder;
//! use swx_thread::{Runtime, ThreadConfig};
//!
//! fn main() -> swx_thread::Result<()> {
//!     let runtime = Runtime::init(EalBuilder::new().core_list("0-2"), ThreadConfig::default())?;
//!     runtime.exec_on_main(|ctx| {
//!         // assign pipelines and blocks through ctx.registry()
//!         ctx.lcore().id()
//!     })?;
//!     runtime.start()?;
//!     runtime.shutdown(Duration::from_secs(1));
//!     Ok(())
//! }
//! ```

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::Receiver;
use nix::errno::Errno;
use tracing::{info, warn};

use crate::api::error::{Error, Result};
use crate::api::rte::eal::{Eal, EalBuilder};
use crate::api::rte::lcore::Lcore;
use crate::thread::main_lcore::{MainContext, MainExecutor};
use crate::thread::registry::Registry;
use crate::thread::state::State;
use crate::thread::worker::{self, ThreadConfig};

/// Owner of the EAL guard, the worker registry, the worker threads and the
/// main lcore executor.
pub struct Runtime {
    registry: Arc<Registry>,
    handles: Vec<(u32, JoinHandle<()>)>,
    main: MainExecutor,
    // Dropped last: workers are joined before the EAL is released.
    eal: Eal,
}

fn spawn_failure(lcore: Lcore, e: io::Error) -> Error {
    let errno = e.raw_os_error().map_or(Errno::EAGAIN, Errno::from_raw);
    Error::init(errno, format!("failed to spawn lcore {} thread: {e}", lcore.id()))
}

impl Runtime {
    /// Initialize the EAL, start the main lcore executor and create one
    /// waiting thread per worker lcore.
    ///
    /// Any failure here is fatal to the process: no worker is left running.
    pub fn init(eal: EalBuilder, config: ThreadConfig) -> Result<Self> {
        Self::init_with_eal(eal.init()?, config)
    }

    /// Same as [`init`](Self::init), from an explicit argument vector.
    pub fn init_args<I, S>(args: I, config: ThreadConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::init_with_eal(Eal::init(args)?, config)
    }

    fn init_with_eal(eal: Eal, config: ThreadConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new(eal.workers()));
        let main_lcore = eal.main_lcore();
        let main = MainExecutor::spawn(main_lcore, registry.clone())
            .map_err(|e| spawn_failure(main_lcore, e))?;
        let mut runtime = Runtime {
            registry,
            handles: Vec::with_capacity(eal.workers().count()),
            main,
            eal,
        };

        let lcores: Vec<_> = runtime.eal.workers().collect();
        for (idx, lcore) in lcores.into_iter().enumerate() {
            let registry = runtime.registry.clone();
            let handle = thread::Builder::new()
                .name(format!("swx-lcore-{}", lcore.id()))
                .spawn(move || worker::thread_main(registry, idx, config))
                // Dropping the runtime releases the threads created so far.
                .map_err(|e| spawn_failure(lcore, e))?;
            runtime.handles.push((lcore.id(), handle));
        }

        info!(
            main_lcore = main_lcore.id(),
            workers = runtime.handles.len(),
            "Runtime initialized"
        );
        Ok(runtime)
    }

    /// The worker registry, for assignment and state queries.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn eal(&self) -> &Eal {
        &self.eal
    }

    /// Run `f` on the main lcore and wait for its result.
    pub fn exec_on_main<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MainContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.main.exec(f)
    }

    /// Queue `f` on the main lcore without waiting.
    pub fn exec_on_main_async<F, R>(&self, f: F) -> Receiver<Result<R>>
    where
        F: FnOnce(&mut MainContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.main.exec_async(f)
    }

    /// Start every worker through the start gate, from the main lcore.
    pub fn start(&self) -> Result<()> {
        self.main.exec(|ctx| ctx.registry().start())?
    }

    /// Stop every running worker, keeping assignments, and wait up to
    /// `timeout` for the run loops to observe it.
    ///
    /// Returns whether every worker settled in time.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.registry.stop();
        self.registry.wait_settled(timeout)
    }

    /// Whether the fleet is running: at least one worker exists and every
    /// worker is running.
    pub fn is_running(&self) -> bool {
        let snapshot = self.registry.snapshot();
        !snapshot.is_empty() && snapshot.iter().all(|w| w.state == State::Running)
    }

    /// Stop the fleet, drain the main lcore executor, join the worker threads
    /// and release the EAL.
    ///
    /// A worker whose run loop has not returned within `timeout` is left
    /// detached instead of joined, so teardown never waits on it.
    pub fn shutdown(mut self, timeout: Duration) {
        let stuck: Vec<u32> = if self.stop(timeout) {
            Vec::new()
        } else {
            let stuck: Vec<u32> = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|w| w.state == State::Stopping)
                .map(|w| w.id)
                .collect();
            warn!(?timeout, ?stuck, "Workers did not settle before shutdown");
            stuck
        };
        self.registry.shutdown();
        self.main.stop();
        self.join_workers(&stuck);
        info!("Runtime shut down");
    }

    fn join_workers(&mut self, skip: &[u32]) {
        for (id, handle) in self.handles.drain(..) {
            if skip.contains(&id) {
                warn!(worker = id, "Worker thread still running, left detached");
                continue;
            }
            if handle.join().is_err() {
                warn!(worker = id, "Worker thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    /// Joins every worker without a time limit; use
    /// [`shutdown`](Runtime::shutdown) to bound teardown.
    fn drop(&mut self) {
        self.registry.shutdown();
        self.main.stop();
        self.join_workers(&[]);
    }
}
