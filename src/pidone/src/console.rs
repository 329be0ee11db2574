//! Interactive login on the console
//!
//! Runs in its own process, outside of the service registry: attach a login
//! program to the console device, wait for it to exit, pause, repeat. There
//! is no policy to configure and no restart limit. Shutdown does not stop
//! it either.

use std::{ffi::CString, thread};

use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    sys::{stat::Mode, wait::waitpid},
    unistd::{execv, fork, ForkResult, Pid},
};
use tracing::info;

use crate::{
    config::ConsoleConfig,
    error::{SupervisorError, SupervisorResult},
    process::{
        cstring, exit_after_exec_failure, path_cstring, redirect, restore_default_dispositions,
    },
};

/// Strings for one session, prepared before the loop process is forked
#[derive(Debug, Clone)]
struct SessionLaunch {
    device: CString,
    fallback_device: CString,
    login: CString,
    login_argv: Vec<CString>,
    shell: CString,
    shell_argv: Vec<CString>,
}

pub struct ConsoleSessionManager {
    config: ConsoleConfig,
    launch: SessionLaunch,
}

impl ConsoleSessionManager {
    pub fn new(config: ConsoleConfig) -> SupervisorResult<Self> {
        let launch = SessionLaunch {
            device: path_cstring("console device", &config.device)?,
            fallback_device: path_cstring("console device", &config.fallback_device)?,
            login: path_cstring("login program", &config.login_program)?,
            login_argv: vec![cstring("login name", "login")?],
            shell: path_cstring("shell", &config.fallback_shell)?,
            shell_argv: vec![cstring("shell name", "sh")?, cstring("shell flag", "-l")?],
        };
        Ok(Self { config, launch })
    }

    /// Fork the respawn loop and return its pid
    pub fn spawn(&self) -> SupervisorResult<Pid> {
        // SAFETY: the child only runs `respawn_loop`, which never returns.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                info!(
                    pid = child.as_raw(),
                    "Console sessions on {}",
                    self.config.device.display()
                );
                Ok(child)
            }
            Ok(ForkResult::Child) => self.respawn_loop(),
            Err(source) => Err(SupervisorError::Fork {
                service: "console".to_string(),
                source,
            }),
        }
    }

    fn respawn_loop(&self) -> ! {
        loop {
            // SAFETY: the session child only performs async-signal-safe
            // calls before exec.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => exec_session(&self.launch),
                Ok(ForkResult::Parent { child }) => wait_session(child),
                Err(_) => {}
            }
            thread::sleep(self.config.respawn_pause);
        }
    }
}

fn wait_session(child: Pid) {
    loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => continue,
            _ => return,
        }
    }
}

fn exec_session(launch: &SessionLaunch) -> ! {
    restore_default_dispositions();
    let console = open(launch.device.as_c_str(), OFlag::O_RDWR, Mode::empty())
        .or_else(|_| open(launch.fallback_device.as_c_str(), OFlag::O_RDWR, Mode::empty()));
    // Without any console the inherited stdio is kept
    if let Ok(fd) = console {
        redirect(fd, &[0, 1, 2]);
    }

    let _ = execv(&launch.login, &launch.login_argv);
    let errno = match execv(&launch.shell, &launch.shell_argv) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    exit_after_exec_failure(errno)
}
