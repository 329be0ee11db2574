use nix::errno::Errno;
use thiserror::Error;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Failures the supervisor core reports to its caller
///
/// Most problems (bad service files, misbehaving services) are absorbed
/// where they happen and never show up here.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("fork failed while starting {service}: {source}")]
    Fork {
        service: String,
        #[source]
        source: Errno,
    },

    #[error("no service with index {0}")]
    UnknownService(usize),

    #[error("invalid string for {what}: contains an interior NUL byte")]
    InteriorNul { what: String },

    #[error("could not install handler for {signal}: {source}")]
    SignalSetup {
        signal: nix::sys::signal::Signal,
        #[source]
        source: Errno,
    },

    #[error("unrecoverable failure in {operation}: {source}")]
    Unrecoverable {
        operation: &'static str,
        #[source]
        source: Errno,
    },
}

impl SupervisorError {
    /// True when the control loop itself can no longer operate
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            SupervisorError::Unrecoverable { .. } | SupervisorError::SignalSetup { .. }
        )
    }
}
