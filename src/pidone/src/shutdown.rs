use std::{
    fmt,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    unistd::{access, execv, sync, AccessFlags},
};
use tracing::{info, warn};

use crate::{process::path_cstring, supervisor::ProcessSupervisor};

/// How the shutdown sequence ended when the power-off helper did not take
/// over the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// No executable helper at the configured path
    HelperMissing,
    /// The helper exists but replacing the image with it failed
    HandoffFailed(Errno),
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownOutcome::HelperMissing => f.write_str("power-off helper is missing"),
            ShutdownOutcome::HandoffFailed(errno) => {
                write!(f, "could not execute power-off helper: {}", errno)
            }
        }
    }
}

pub struct ShutdownSequencer {
    poweroff_helper: PathBuf,
}

impl ShutdownSequencer {
    pub fn new(poweroff_helper: impl Into<PathBuf>) -> Self {
        Self {
            poweroff_helper: poweroff_helper.into(),
        }
    }

    pub fn poweroff_helper(&self) -> &Path {
        &self.poweroff_helper
    }

    /// Perform a graceful shutdown of the system
    ///
    /// There are several stages here:
    ///  1. Stop every service, in the order they were loaded
    ///  2. Sync the filesystem
    ///  3. Hand the process over to the power-off helper
    ///
    /// Only returns if the last stage could not happen.
    pub fn run(&self, supervisor: &mut ProcessSupervisor) -> ShutdownOutcome {
        info!("Stopping {} services", supervisor.registry().len());
        supervisor.stop_all();

        // Services are gone, flush whatever they wrote before power is cut
        sync();
        self.power_off()
    }

    fn power_off(&self) -> ShutdownOutcome {
        if let Err(e) = access(self.poweroff_helper.as_path(), AccessFlags::X_OK) {
            warn!(
                "Power-off helper {} is not executable: {}",
                self.poweroff_helper.display(),
                e
            );
            return ShutdownOutcome::HelperMissing;
        }

        let (program, arg0) = match (
            path_cstring("power-off helper", &self.poweroff_helper),
            path_cstring(
                "power-off helper name",
                Path::new(self.poweroff_helper.file_name().unwrap_or_default()),
            ),
        ) {
            (Ok(program), Ok(arg0)) => (program, arg0),
            _ => return ShutdownOutcome::HandoffFailed(Errno::EINVAL),
        };

        info!("Handing over to {}", self.poweroff_helper.display());
        match execv(&program, &[arg0]) {
            Ok(never) => match never {},
            Err(errno) => {
                warn!("exec {} failed: {}", self.poweroff_helper.display(), errno);
                ShutdownOutcome::HandoffFailed(errno)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::SupervisorConfig, registry::discover, service::ServiceId};
    use serial_test::serial;
    use std::{fs, os::unix::fs::PermissionsExt, time::Duration};
    use tempfile::TempDir;

    fn supervisor_with(definitions: &[(&str, &str)], services: &TempDir, logs: &TempDir) -> ProcessSupervisor {
        for (name, exec) in definitions {
            fs::write(
                services.path().join(format!("{}.conf", name)),
                format!("Name={}\nExecStart={}\nRestart=always\n", name, exec),
            )
            .unwrap();
        }
        let config = SupervisorConfig {
            services_dir: services.path().to_path_buf(),
            log_dir: logs.path().to_path_buf(),
            stop_grace_period: Duration::from_millis(300),
            stop_poll_interval: Duration::from_millis(20),
            ..SupervisorConfig::default()
        };
        let discovery = discover(&config.services_dir, &config.log_dir, config.capacity);
        ProcessSupervisor::new(discovery.registry, config)
    }

    #[test]
    #[serial]
    fn test_missing_helper_returns_after_stopping_everything() {
        let services = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let mut supervisor =
            supervisor_with(&[("a", "sleep 30"), ("b", "sleep 30")], &services, &logs);
        assert_eq!(supervisor.start_all(), 2);

        let sequencer = ShutdownSequencer::new(logs.path().join("no-such-poweroff"));
        assert_eq!(sequencer.run(&mut supervisor), ShutdownOutcome::HelperMissing);

        assert!(supervisor.registry().iter().all(|(_, s)| !s.is_running()));
        assert!(supervisor
            .registry()
            .get(ServiceId(1))
            .unwrap()
            .last_exit()
            .is_some());
    }

    #[test]
    #[serial]
    fn test_helper_that_cannot_run_is_reported() {
        let services = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&[], &services, &logs);

        // Executable bit set but neither ELF nor script
        let helper = logs.path().join("poweroff");
        fs::write(&helper, [0u8, 1, 2, 3]).unwrap();
        fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();

        let outcome = ShutdownSequencer::new(&helper).run(&mut supervisor);
        assert_eq!(outcome, ShutdownOutcome::HandoffFailed(Errno::ENOEXEC));
    }

    #[test]
    #[serial]
    fn test_non_executable_helper_counts_as_missing() {
        let services = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let mut supervisor = supervisor_with(&[], &services, &logs);

        let helper = logs.path().join("poweroff");
        fs::write(&helper, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&helper, fs::Permissions::from_mode(0o644)).unwrap();

        // root passes X_OK checks only when some execute bit is set
        let outcome = ShutdownSequencer::new(&helper).run(&mut supervisor);
        assert_eq!(outcome, ShutdownOutcome::HelperMissing);
    }
}
