//! The control loop of the supervisor

use std::thread;

use tracing::{debug, info, warn};

use crate::{error::SupervisorResult, reaper::SignalReaper, supervisor::ProcessSupervisor};

/// Owns the supervisor and the reaper for the lifetime of the loop
pub struct Runtime {
    supervisor: ProcessSupervisor,
    reaper: SignalReaper,
}

impl Runtime {
    pub fn new(supervisor: ProcessSupervisor, reaper: SignalReaper) -> Self {
        Self { supervisor, reaper }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Give the supervisor back, typically to hand it to shutdown
    pub fn into_supervisor(self) -> ProcessSupervisor {
        self.supervisor
    }

    /// One pass: reap and dispatch if a child changed state
    pub fn pass(&mut self) -> SupervisorResult<usize> {
        let supervisor = &mut self.supervisor;
        self.reaper.reap_if_requested(|pid, exit| {
            let disposition = supervisor.handle_exit(pid, exit);
            debug!("pid {} handled: {:?}", pid, disposition);
        })
    }

    /// Loop until a termination request arrives
    ///
    /// Sleeps one tick between passes, which bounds reap latency. Returns
    /// early only when reaping itself can no longer work.
    pub fn run(&mut self) -> SupervisorResult<()> {
        let tick = self.supervisor.config().tick;
        while !self.reaper.terminate_requested() {
            match self.pass() {
                Ok(_) => {}
                Err(e) if e.is_unrecoverable() => return Err(e),
                Err(e) => warn!("Reap pass failed: {}", e),
            }
            thread::sleep(tick);
        }
        info!("Termination requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SupervisorConfig,
        reaper::SignalFlags,
        registry::discover,
        service::ServiceId,
    };
    use nix::sys::{
        signal::{raise, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    };
    use nix::unistd::Pid;
    use serial_test::serial;
    use std::{fs, time::Duration};
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_loop_restarts_until_terminated() {
        let services = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        fs::write(
            services.path().join("crash.conf"),
            "Name=crash\nExecStart=exit 1\nRestart=always\n",
        )
        .unwrap();
        let config = SupervisorConfig {
            services_dir: services.path().to_path_buf(),
            log_dir: logs.path().to_path_buf(),
            restart_backoff: Duration::from_millis(10),
            tick: Duration::from_millis(20),
            stop_grace_period: Duration::from_millis(200),
            stop_poll_interval: Duration::from_millis(20),
            ..SupervisorConfig::default()
        };
        let discovery = discover(&config.services_dir, &config.log_dir, config.capacity);

        let flags = SignalFlags::install().unwrap();
        flags.reset();
        let mut supervisor = ProcessSupervisor::new(discovery.registry, config);
        assert_eq!(supervisor.start_all(), 1);
        let mut runtime = Runtime::new(supervisor, SignalReaper::new(flags));

        let generation = |runtime: &Runtime| {
            runtime
                .supervisor()
                .registry()
                .get(ServiceId(0))
                .unwrap()
                .generation()
        };
        for _ in 0..200 {
            if generation(&runtime) >= 3 {
                break;
            }
            runtime.pass().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(generation(&runtime) >= 3);

        raise(Signal::SIGTERM).unwrap();
        runtime.run().unwrap();

        let mut supervisor = runtime.into_supervisor();
        supervisor.stop_all();
        while let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            if status == WaitStatus::StillAlive {
                thread::sleep(Duration::from_millis(10));
            }
        }
        SignalFlags::install().unwrap().reset();
    }
}
