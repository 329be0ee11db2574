//! Turning asynchronous signals into reap work on the control thread
//!
//! The handlers installed here do nothing but store `true` into one of two
//! atomics. The control loop reads and clears them and does the actual
//! waiting, so no allocation, locking or blocking ever happens in signal
//! context.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::{
    errno::Errno,
    sys::{
        signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use tracing::{debug, trace};

use crate::{
    error::{SupervisorError, SupervisorResult},
    process::ChildExit,
};

// Only reachable through `SignalFlags`
static REAP_REQUESTED: AtomicBool = AtomicBool::new(false);
static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_child_state_change(_signal: libc::c_int) {
    REAP_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_terminate_request(_signal: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
}

/// Handle to the two flags written by the signal handlers
///
/// Obtained from [`SignalFlags::install`]; holding one means the handlers
/// are in place.
#[derive(Debug)]
pub struct SignalFlags {
    _installed: (),
}

impl SignalFlags {
    /// Install handlers for `SIGCHLD`, `SIGTERM` and `SIGINT`
    pub fn install() -> SupervisorResult<Self> {
        let child = SigAction::new(
            SigHandler::Handler(on_child_state_change),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        let terminate = SigAction::new(
            SigHandler::Handler(on_terminate_request),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for (signal, action) in [
            (Signal::SIGCHLD, &child),
            (Signal::SIGTERM, &terminate),
            (Signal::SIGINT, &terminate),
        ] {
            // SAFETY: both handlers only perform an atomic store.
            unsafe { sigaction(signal, action) }
                .map_err(|source| SupervisorError::SignalSetup { signal, source })?;
        }
        debug!("Signal handlers installed");
        Ok(Self { _installed: () })
    }

    /// Clear the reap flag and report whether it was set
    pub fn take_reap_request(&self) -> bool {
        REAP_REQUESTED.swap(false, Ordering::SeqCst)
    }

    pub fn terminate_requested(&self) -> bool {
        TERMINATE_REQUESTED.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        REAP_REQUESTED.store(false, Ordering::SeqCst);
        TERMINATE_REQUESTED.store(false, Ordering::SeqCst);
    }
}

/// Collect every child that has already terminated, without blocking
///
/// Each `(pid, exit)` pair goes to `dispatch`. The loop runs until no
/// finished child is left, so any number of coalesced `SIGCHLD`s are
/// covered by a single pass. Returns how many children were reaped.
pub fn drain<F>(mut dispatch: F) -> SupervisorResult<usize>
where
    F: FnMut(Pid, ChildExit),
{
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(status) => {
                if let Some((pid, exit)) = ChildExit::from_wait_status(status) {
                    trace!("Reaped pid {}: {}", pid, exit);
                    reaped += 1;
                    dispatch(pid, exit);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(source) => {
                return Err(SupervisorError::Unrecoverable {
                    operation: "waitpid",
                    source,
                })
            }
        }
    }
    Ok(reaped)
}

/// The bridge between signal flags and the exit handler
#[derive(Debug)]
pub struct SignalReaper {
    flags: SignalFlags,
}

impl SignalReaper {
    pub fn new(flags: SignalFlags) -> Self {
        Self { flags }
    }

    pub fn flags(&self) -> &SignalFlags {
        &self.flags
    }

    /// Drain finished children if a `SIGCHLD` arrived since the last call
    ///
    /// The flag is cleared before draining. A notification that arrives
    /// during the drain sets it again and triggers another pass next time.
    pub fn reap_if_requested<F>(&self, dispatch: F) -> SupervisorResult<usize>
    where
        F: FnMut(Pid, ChildExit),
    {
        if !self.flags.take_reap_request() {
            return Ok(0);
        }
        drain(dispatch)
    }

    pub fn terminate_requested(&self) -> bool {
        self.flags.terminate_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{
        sys::signal::raise,
        unistd::{fork, ForkResult},
    };
    use serial_test::serial;
    use std::{thread, time::Duration};

    fn spawn_exiting(code: i32) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => child,
            ForkResult::Child => unsafe { libc::_exit(code) },
        }
    }

    #[test]
    #[serial]
    fn test_handlers_only_set_flags() {
        let flags = SignalFlags::install().unwrap();
        flags.reset();

        raise(Signal::SIGCHLD).unwrap();
        assert!(!flags.terminate_requested());
        assert!(flags.take_reap_request());
        assert!(!flags.take_reap_request());

        raise(Signal::SIGINT).unwrap();
        assert!(flags.terminate_requested());
        flags.reset();

        raise(Signal::SIGTERM).unwrap();
        assert!(flags.terminate_requested());
        flags.reset();
    }

    #[test]
    #[serial]
    fn test_drain_collects_every_finished_child() {
        let a = spawn_exiting(0);
        let b = spawn_exiting(4);
        thread::sleep(Duration::from_millis(200));

        let mut seen = Vec::new();
        let count = drain(|pid, exit| seen.push((pid, exit))).unwrap();

        assert_eq!(count, 2);
        seen.sort_by_key(|(pid, _)| pid.as_raw());
        let mut expected = vec![(a, ChildExit::Exited(0)), (b, ChildExit::Exited(4))];
        expected.sort_by_key(|(pid, _)| pid.as_raw());
        assert_eq!(seen, expected);

        assert_eq!(drain(|_, _| panic!("nothing left to reap")).unwrap(), 0);
    }

    #[test]
    #[serial]
    fn test_reap_waits_for_the_flag() {
        let reaper = SignalReaper::new(SignalFlags::install().unwrap());
        reaper.flags().reset();

        let pid = spawn_exiting(0);
        thread::sleep(Duration::from_millis(200));

        // The real SIGCHLD has been delivered by now
        let mut seen = Vec::new();
        assert_eq!(reaper.reap_if_requested(|p, e| seen.push((p, e))).unwrap(), 1);
        assert_eq!(seen, vec![(pid, ChildExit::Exited(0))]);

        assert_eq!(reaper.reap_if_requested(|_, _| unreachable!()).unwrap(), 0);
    }
}
