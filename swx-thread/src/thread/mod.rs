//! Control-plane (CP) and data-plane (DP) thread management.
//!
//! The CP thread assigns pipelines and blocks to worker lcores through the
//! [`Registry`](registry::Registry) and starts the fleet through its start
//! gate, typically from jobs run on the main lcore by the
//! [`MainExecutor`](main_lcore::MainExecutor). Each DP thread runs
//! [`worker::thread_main`] until shutdown.

pub mod block;
pub mod main_lcore;
pub mod pipeline;
pub mod registry;
pub mod state;
pub mod worker;
