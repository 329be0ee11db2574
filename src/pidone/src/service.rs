//! Service definitions and their runtime bookkeeping

use std::{
    fmt,
    path::{Path, PathBuf},
};

use nix::unistd::Pid;

use crate::process::ChildExit;

/// Restart policy for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Leave the service stopped once it exits
    #[default]
    Never,
    /// Restart only after a non-zero exit code or a fatal signal
    OnFailure,
    /// Restart regardless of how the service exited
    Always,
}

impl RestartPolicy {
    /// Resolve the value of a `Restart=` line
    ///
    /// Matching is case-insensitive and anything unknown means `Never`.
    pub fn from_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("always") {
            RestartPolicy::Always
        } else if value.eq_ignore_ascii_case("on-failure") {
            RestartPolicy::OnFailure
        } else {
            RestartPolicy::Never
        }
    }

    pub fn should_restart(self, exit: &ChildExit) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => exit.is_failure(),
            RestartPolicy::Always => true,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartPolicy::Never => "no",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Always => "always",
        };
        f.write_str(s)
    }
}

/// Position of a service inside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub(crate) usize);

impl ServiceId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Reported status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Running { pid: Pid },
}

/// A supervised unit
///
/// The definition part (`name`, `command`, `restart_policy`, `log_path`) is
/// fixed at load time. Only the supervisor touches the runtime part.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    command: String,
    restart_policy: RestartPolicy,
    log_path: PathBuf,
    pub(crate) state: ServiceState,
    pub(crate) generation: u64,
    pub(crate) last_exit: Option<ChildExit>,
    pub(crate) restarts: u32,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        restart_policy: RestartPolicy,
        log_dir: &Path,
    ) -> Self {
        let name = name.into();
        let log_path = log_path(log_dir, &name);
        Self {
            name,
            command: command.into(),
            restart_policy,
            log_path,
            state: ServiceState::Stopped,
            generation: 0,
            last_exit: None,
            restarts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ServiceState::Running { .. })
    }

    /// Pid of the current launch, if the service is running
    pub fn pid(&self) -> Option<Pid> {
        match self.state {
            ServiceState::Running { pid } => Some(pid),
            ServiceState::Stopped => None,
        }
    }

    /// Number of successful launches so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_exit(&self) -> Option<ChildExit> {
        self.last_exit
    }

    /// Number of relaunches triggered by the restart policy
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// `<log_dir>/<name>.log`
pub fn log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}.log", name))
}
