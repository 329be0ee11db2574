//! Paths and timings the supervisor runs with.
//!
//! The binary always runs with [`SupervisorConfig::default`], which is built
//! from the constants in [`crate::defaults`]. Everything is gathered in one
//! place so that tests can point the supervisor at scratch directories and
//! shrink the timings.

use std::{path::PathBuf, time::Duration};

use crate::defaults;

/// Configuration of the console session loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub device: PathBuf,
    pub fallback_device: PathBuf,
    pub login_program: PathBuf,
    /// Started with `-l` when the login program cannot be executed
    pub fallback_shell: PathBuf,
    pub respawn_pause: Duration,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(defaults::CONSOLE_DEVICE),
            fallback_device: PathBuf::from(defaults::FALLBACK_CONSOLE_DEVICE),
            login_program: PathBuf::from(defaults::LOGIN_PROGRAM),
            fallback_shell: PathBuf::from(defaults::SHELL),
            respawn_pause: defaults::CONSOLE_RESPAWN_PAUSE,
        }
    }
}

/// Everything the supervisor core needs to know about its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub services_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Maximum number of services kept by the registry
    pub capacity: usize,
    /// Interpreter that receives `-c <ExecStart>`
    pub shell: PathBuf,
    /// Bound to the standard input of every service
    pub null_device: PathBuf,
    pub stop_grace_period: Duration,
    pub stop_poll_interval: Duration,
    pub restart_backoff: Duration,
    /// Sleep between two passes of the control loop
    pub tick: Duration,
    pub console: ConsoleConfig,
    pub poweroff_helper: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            services_dir: PathBuf::from(defaults::SERVICES_DIR),
            log_dir: PathBuf::from(defaults::LOG_DIR),
            capacity: defaults::MAX_SERVICES,
            shell: PathBuf::from(defaults::SHELL),
            null_device: PathBuf::from(defaults::NULL_DEVICE),
            stop_grace_period: defaults::STOP_GRACE_PERIOD,
            stop_poll_interval: defaults::STOP_POLL_INTERVAL,
            restart_backoff: defaults::RESTART_BACKOFF,
            tick: defaults::SUPERVISOR_TICK,
            console: ConsoleConfig::default(),
            poweroff_helper: PathBuf::from(defaults::POWEROFF_HELPER),
        }
    }
}

impl SupervisorConfig {
    /// Number of `waitpid` samples taken during the stop grace period
    pub fn stop_poll_attempts(&self) -> u32 {
        if self.stop_poll_interval.is_zero() {
            return 1;
        }
        let attempts = self.stop_grace_period.as_nanos() / self.stop_poll_interval.as_nanos();
        attempts.clamp(1, u32::MAX as u128) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grace_is_sampled_fifty_times() {
        let config = SupervisorConfig::default();
        assert_eq!(config.stop_poll_attempts(), 50);
        assert_eq!(config.capacity, 128);
        assert_eq!(config.log_dir, PathBuf::from("/var/log"));
    }

    #[test]
    fn test_poll_attempts_never_zero() {
        let config = SupervisorConfig {
            stop_grace_period: Duration::from_millis(10),
            stop_poll_interval: Duration::from_millis(100),
            ..SupervisorConfig::default()
        };
        assert_eq!(config.stop_poll_attempts(), 1);

        let config = SupervisorConfig {
            stop_poll_interval: Duration::ZERO,
            ..SupervisorConfig::default()
        };
        assert_eq!(config.stop_poll_attempts(), 1);
    }
}
