use crate::thread::state::State;

pub type Errno = nix::errno::Errno;

/// Result type alias for registry, start gate and runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the worker lifecycle layer.
///
/// All of these are sequencing or configuration errors. None of them is
/// transient, so callers report them instead of retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The id does not name a configured worker lcore.
    #[error("unknown worker {0}")]
    UnknownWorker(u32),

    /// The worker cannot accept an assignment: it is not idle, or it already
    /// holds one.
    #[error("worker {id} is {state} and cannot accept an assignment")]
    InvalidState { id: u32, state: State },

    /// The pipeline or block is already enabled on another worker.
    #[error("{unit} already enabled on worker {id}")]
    AlreadyAssigned { id: u32, unit: String },

    /// The start gate found a worker that is not idle.
    #[error("worker {id} is {state}, fleet not started")]
    NotReady { id: u32, state: State },

    /// The runtime environment could not be brought up.
    #[error("runtime initialization failed: {reason}")]
    RuntimeInitFailure { errno: Errno, reason: String },

    /// A job run on the main lcore panicked.
    #[error("main lcore job {0}")]
    MainLcorePanic(String),

    /// The main lcore executor no longer accepts jobs.
    #[error("main lcore executor stopped")]
    ExecutorStopped,
}

impl Error {
    pub(crate) fn init(errno: Errno, reason: impl Into<String>) -> Self {
        Error::RuntimeInitFailure {
            errno,
            reason: reason.into(),
        }
    }

    /// The errno this failure is reported as.
    pub fn errno(&self) -> Errno {
        match self {
            Error::UnknownWorker(_) => Errno::ENODEV,
            Error::InvalidState { .. } => Errno::EINVAL,
            Error::AlreadyAssigned { .. } => Errno::EEXIST,
            Error::NotReady { .. } => Errno::EBUSY,
            Error::RuntimeInitFailure { errno, .. } => *errno,
            Error::MainLcorePanic(_) => Errno::ECANCELED,
            Error::ExecutorStopped => Errno::ESHUTDOWN,
        }
    }

    /// Negative return code, as the C control-plane API reports it.
    pub fn as_raw(&self) -> i32 {
        -(self.errno() as i32)
    }
}
