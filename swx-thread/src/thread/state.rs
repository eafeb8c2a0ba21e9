use std::fmt;

/// Lifecycle state of a worker lcore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Waiting for the start gate. Initial state, and the only one that
    /// accepts a new assignment.
    Idle,
    /// Executing its assignment (or nothing) in the run loop.
    Running,
    /// A disable or stop was requested; the run loop has not observed it yet.
    Stopping,
    /// The run loop failed. Left by a reset or by clearing the assignment.
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Error => "error",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one worker, for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: u32,
    pub state: State,
    /// Description of the assigned unit, e.g. `pipeline PIPELINE0`.
    pub assignment: Option<String>,
    /// Reason of the last run loop failure.
    pub error: Option<String>,
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}: {}", self.id, self.state)?;
        match &self.assignment {
            Some(unit) => write!(f, ", {unit}")?,
            None => f.write_str(", unassigned")?,
        }
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        }
        Ok(())
    }
}
