//! Start, stop and restart of individual services
//!
//! Every service moves between `Stopped` and `Running`. A launch is
//! identified by its pid together with the generation of the entry at the
//! time it started, so an exit that arrives after the entry was stopped or
//! relaunched is never mistaken for the current process.

use std::{collections::HashMap, thread};

use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SupervisorConfig,
    error::{SupervisorError, SupervisorResult},
    process::{self, ChildExit, LaunchSpec},
    registry::ServiceRegistry,
    service::{ServiceId, ServiceState},
};

/// What `stop` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The service was not running, nothing was sent
    NotRunning,
    /// The process went away within the grace period. The exit is known
    /// unless something else reaped it first.
    Exited(Option<ChildExit>),
    /// The grace period ran out and the group got `SIGKILL`
    Killed,
}

/// What `handle_exit` did with a reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The policy asked for a relaunch, which now runs as `pid`
    Restarted { pid: Pid },
    /// The policy asked for a relaunch but it could not be started
    RestartFailed,
    /// The service stays stopped
    Stopped,
    /// A launch that is no longer the current one of its entry
    Stale,
    /// A pid that was never launched by the supervisor
    Orphan,
}

#[derive(Debug, Clone, Copy)]
struct Launch {
    id: ServiceId,
    generation: u64,
}

pub struct ProcessSupervisor {
    registry: ServiceRegistry,
    config: SupervisorConfig,
    launches: HashMap<Pid, Launch>,
}

impl ProcessSupervisor {
    pub fn new(registry: ServiceRegistry, config: SupervisorConfig) -> Self {
        Self {
            registry,
            config,
            launches: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch `id` unless it is already running
    pub fn start(&mut self, id: ServiceId) -> SupervisorResult<Pid> {
        let service = self
            .registry
            .get(id)
            .ok_or(SupervisorError::UnknownService(id.index()))?;
        if let ServiceState::Running { pid } = service.state() {
            debug!("{} is already running as pid {}", service.name(), pid);
            return Ok(pid);
        }

        let launch = LaunchSpec::shell_command(
            &self.config.shell,
            service.command(),
            &self.config.null_device,
            service.log_path(),
        )?;
        let pid = process::spawn(&launch).map_err(|source| {
            error!("Could not fork {}: {}", service.name(), source);
            SupervisorError::Fork {
                service: service.name().to_string(),
                source,
            }
        })?;

        let service = self
            .registry
            .get_mut(id)
            .ok_or(SupervisorError::UnknownService(id.index()))?;
        service.state = ServiceState::Running { pid };
        service.generation += 1;
        self.launches.insert(
            pid,
            Launch {
                id,
                generation: service.generation,
            },
        );
        info!(pid = pid.as_raw(), "Started {}", service.name());
        Ok(pid)
    }

    /// Launch every service in load order
    ///
    /// A service that cannot be started stays stopped and does not keep the
    /// others from starting. Returns the number of launched services.
    pub fn start_all(&mut self) -> usize {
        let ids: Vec<_> = self.registry.ids().collect();
        ids.into_iter()
            .filter(|&id| match self.start(id) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Service {} left stopped: {}", id.index(), e);
                    false
                }
            })
            .count()
    }

    /// Terminate `id` and its whole process group
    ///
    /// `SIGTERM` first, then `SIGKILL` once the grace period has passed
    /// without the process going away. The restart policy is not consulted.
    pub fn stop(&mut self, id: ServiceId) -> StopOutcome {
        let Some(service) = self.registry.get(id) else {
            return StopOutcome::NotRunning;
        };
        let ServiceState::Running { pid } = service.state() else {
            return StopOutcome::NotRunning;
        };
        let name = service.name().to_string();

        if let Err(e) = process::signal_group(pid, Signal::SIGTERM) {
            debug!("SIGTERM to {} (pid {}) failed: {}", name, pid, e);
        }

        let attempts = self.config.stop_poll_attempts();
        let mut gone = None;
        for _ in 0..attempts {
            gone = poll_exit(pid);
            if gone.is_some() {
                break;
            }
            thread::sleep(self.config.stop_poll_interval);
        }
        if gone.is_none() {
            gone = poll_exit(pid);
        }

        let outcome = match gone {
            Some(exit) => {
                // The pid is consumed here, the reap loop will not see it
                self.launches.remove(&pid);
                StopOutcome::Exited(exit)
            }
            None => {
                warn!(
                    "{} (pid {}) ignored SIGTERM for {:?}, sending SIGKILL",
                    name, pid, self.config.stop_grace_period
                );
                if let Err(e) = process::signal_group(pid, Signal::SIGKILL) {
                    warn!("SIGKILL to {} (pid {}) failed: {}", name, pid, e);
                }
                StopOutcome::Killed
            }
        };

        if let Some(service) = self.registry.get_mut(id) {
            service.state = ServiceState::Stopped;
            if let StopOutcome::Exited(Some(exit)) = outcome {
                service.last_exit = Some(exit);
            }
        }
        info!(pid = pid.as_raw(), "Stopped {}", name);
        outcome
    }

    /// Stop every service in load order
    pub fn stop_all(&mut self) {
        let ids: Vec<_> = self.registry.ids().collect();
        for id in ids {
            self.stop(id);
        }
    }

    /// Account for a reaped child and apply the restart policy
    pub fn handle_exit(&mut self, pid: Pid, exit: ChildExit) -> ExitDisposition {
        let Some(launch) = self.launches.remove(&pid) else {
            debug!("Reaped pid {} ({}), not a service", pid, exit);
            return ExitDisposition::Orphan;
        };
        let Some(service) = self.registry.get_mut(launch.id) else {
            return ExitDisposition::Orphan;
        };
        if service.pid() != Some(pid) || service.generation != launch.generation {
            debug!(
                "Reaped pid {} ({}) from an earlier launch of {}",
                pid,
                exit,
                service.name()
            );
            return ExitDisposition::Stale;
        }

        service.state = ServiceState::Stopped;
        service.last_exit = Some(exit);
        let policy = service.restart_policy();
        info!(pid = pid.as_raw(), "Service {} exited: {}", service.name(), exit);

        if !policy.should_restart(&exit) {
            return ExitDisposition::Stopped;
        }

        // Bounds the rate of a service that keeps crashing
        thread::sleep(self.config.restart_backoff);
        match self.start(launch.id) {
            Ok(pid) => {
                if let Some(service) = self.registry.get_mut(launch.id) {
                    service.restarts += 1;
                }
                ExitDisposition::Restarted { pid }
            }
            Err(e) => {
                error!("Restart failed: {}", e);
                ExitDisposition::RestartFailed
            }
        }
    }
}

/// Non-blocking check whether `pid` is gone
///
/// `Some(None)` means the process no longer exists as our child, so
/// something else already collected it.
fn poll_exit(pid: Pid) -> Option<Option<ChildExit>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => ChildExit::from_wait_status(status).map(|(_, exit)| Some(exit)),
        Err(Errno::EINTR) => None,
        Err(_) => Some(None),
    }
}
