//! Lcore (logical core) handles.
//!
//! An lcore is a runtime-managed thread pinned to one CPU core. The main
//! lcore runs the control plane; every other lcore in the configured core set
//! is a worker that executes a pipeline or block once started.
//!
//! # Example
//!
//! ```no_run
//! use swx_thread::api::rte::lcore::{self, Lcore};
//!
//! let cores = lcore::parse_core_list("0-3").unwrap();
//! let main = Lcore::main(cores[0]);
//! println!("Main lcore {} on CPU {}", main.id(), main.cpu_id());
//! ```

use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Highest lcore id (exclusive) the runtime accepts.
pub const RTE_MAX_LCORE: u32 = 128;

/// A handle to a logical core.
///
/// This type is `Copy` - it's just a lightweight handle to an lcore, not the
/// thread running on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lcore {
    id: u32,
    main: bool,
}

impl Lcore {
    /// Handle for the main (control-plane) lcore.
    pub fn main(id: u32) -> Self {
        Self { id, main: true }
    }

    /// Handle for a worker lcore.
    pub fn worker(id: u32) -> Self {
        Self { id, main: false }
    }

    /// Get this lcore's ID.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Check if this is the main lcore.
    #[inline]
    pub fn is_main(&self) -> bool {
        self.main
    }

    /// Get the physical CPU ID this lcore is pinned to.
    ///
    /// Lcores map one-to-one onto CPUs with the same index.
    #[inline]
    pub fn cpu_id(&self) -> usize {
        self.id as usize
    }

    /// Pin the calling thread to this lcore's CPU.
    ///
    /// Returns `false` if the CPU is outside the process affinity set. The
    /// caller keeps running unpinned in that case.
    pub fn pin_current(&self) -> bool {
        let mut set = CpuSet::new();
        if let Err(e) = set.set(self.cpu_id()) {
            warn!(lcore_id = self.id, error = %e, "CPU out of range, running unpinned");
            return false;
        }
        match sched_setaffinity(Pid::from_raw(0), &set) {
            Ok(()) => {
                debug!(lcore_id = self.id, "Pinned thread to CPU");
                true
            }
            Err(e) => {
                warn!(lcore_id = self.id, error = %e, "Failed to pin thread, running unpinned");
                false
            }
        }
    }
}

/// Parse a core list such as `0-3`, `0,2,4` or `1-2,5`.
///
/// The result is sorted and free of duplicates. Returns `None` on malformed
/// input, reversed ranges or ids at or beyond [`RTE_MAX_LCORE`].
pub fn parse_core_list(list: &str) -> Option<Vec<u32>> {
    let mut cores = Vec::new();
    for item in list.split(',') {
        let item = item.trim();
        let (first, last) = match item.split_once('-') {
            Some((a, b)) => (a.trim().parse::<u32>().ok()?, b.trim().parse::<u32>().ok()?),
            None => {
                let id = item.parse::<u32>().ok()?;
                (id, id)
            }
        };
        if first > last || last >= RTE_MAX_LCORE {
            return None;
        }
        cores.extend(first..=last);
    }
    cores.sort_unstable();
    cores.dedup();
    Some(cores)
}

/// Parse a hexadecimal core mask such as `3`, `0xf` or `0XF0`.
pub fn parse_core_mask(mask: &str) -> Option<Vec<u32>> {
    let digits = mask
        .strip_prefix("0x")
        .or_else(|| mask.strip_prefix("0X"))
        .unwrap_or(mask);
    if digits.is_empty() {
        return None;
    }

    let mut cores = Vec::new();
    // Least significant nibble last.
    for (nibble_idx, c) in digits.chars().rev().enumerate() {
        let nibble = c.to_digit(16)?;
        for bit in 0..4 {
            if nibble & (1 << bit) == 0 {
                continue;
            }
            let id = (nibble_idx * 4 + bit) as u32;
            if id >= RTE_MAX_LCORE {
                return None;
            }
            cores.push(id);
        }
    }
    cores.sort_unstable();
    Some(cores)
}

/// CPUs the process may currently run on, capped at [`RTE_MAX_LCORE`].
pub fn available_cores() -> Vec<u32> {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => (0..RTE_MAX_LCORE)
            .filter(|&id| set.is_set(id as usize).unwrap_or(false))
            .collect(),
        Err(e) => {
            warn!(error = %e, "sched_getaffinity failed, assuming CPU 0 only");
            vec![0]
        }
    }
}
