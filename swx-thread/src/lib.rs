//! Worker lcore lifecycle for SWX software switch pipelines.
//!
//! The control-plane thread owns a [`Registry`] of data-plane workers, one per
//! worker lcore. Pipelines and blocks are assigned to idle workers, then the
//! whole fleet is started at once through the start gate:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use swx_thread::api::rte::eal::EalBuilder;
//! use swx_thread::thread::block::{self, Block};
//! use swx_thread::{Runtime, ThreadConfig};
//!
//! fn main() -> swx_thread::Result<()> {
//!     let runtime = Runtime::init(
//!         EalBuilder::new().program_name("dummy").memory_channels(4).core_mask("3"),
//!         ThreadConfig::default(),
//!     )?;
//!
//!     let stats: Arc<dyn Block> = Arc::new(block::from_fn(|| Ok(())));
//!     runtime.registry().assign_block(stats, 1)?;
//!     runtime.start()?;
//!
//!     // ...
//!     runtime.shutdown(Duration::from_secs(1));
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod runtime;
pub mod thread;

pub use api::error::{Error, Result};
pub use runtime::Runtime;
pub use thread::main_lcore::{MainContext, MainExecutor};
pub use thread::registry::Registry;
pub use thread::state::{State, WorkerInfo};
pub use thread::worker::ThreadConfig;

/// A boxed error type for pipeline and block callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
