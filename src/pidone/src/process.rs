//! Process primitives shared by services and the console session
//!
//! Everything a forked child needs is prepared in the parent. Between
//! `fork` and `exec` the child only calls async-signal-safe functions and
//! never touches supervisor state or the logger.

use std::{
    ffi::CString,
    fmt,
    os::{fd::RawFd, unix::ffi::OsStrExt},
    path::Path,
};

use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    sys::{
        signal::{
            kill, killpg, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet,
            SigmaskHow, Signal,
        },
        stat::Mode,
        wait::WaitStatus,
    },
    unistd::{close, dup2, execv, fork, setsid, ForkResult, Pid},
};

use crate::{
    defaults::EXEC_FAILURE_STATUS,
    error::{SupervisorError, SupervisorResult},
};

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
}

impl ChildExit {
    /// Classify a wait status, `None` for anything that is not a termination
    pub fn from_wait_status(status: WaitStatus) -> Option<(Pid, ChildExit)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, ChildExit::Exited(code))),
            WaitStatus::Signaled(pid, signal, _core_dumped) => {
                Some((pid, ChildExit::Signaled(signal)))
            }
            _ => None,
        }
    }

    /// A fatal signal or a non-zero exit code
    pub fn is_failure(&self) -> bool {
        !matches!(self, ChildExit::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Exited(code) => Some(*code),
            ChildExit::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exit code {}", code),
            ChildExit::Signaled(signal) => write!(f, "killed by {}", signal),
        }
    }
}

pub(crate) fn cstring(what: &str, bytes: impl Into<Vec<u8>>) -> SupervisorResult<CString> {
    CString::new(bytes).map_err(|_| SupervisorError::InteriorNul {
        what: what.to_string(),
    })
}

pub(crate) fn path_cstring(what: &str, path: &Path) -> SupervisorResult<CString> {
    cstring(what, path.as_os_str().as_bytes())
}

/// Everything needed to launch a service, prepared before forking
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: CString,
    argv: Vec<CString>,
    stdin: CString,
    log: CString,
}

impl LaunchSpec {
    /// `<shell> -c <command>` with stdin from `null_device` and both output
    /// streams appended to `log_path`
    pub fn shell_command(
        shell: &Path,
        command: &str,
        null_device: &Path,
        log_path: &Path,
    ) -> SupervisorResult<Self> {
        let arg0 = shell
            .file_name()
            .map(|name| name.as_bytes().to_vec())
            .unwrap_or_else(|| b"sh".to_vec());
        Ok(Self {
            program: path_cstring("shell", shell)?,
            argv: vec![
                cstring("shell name", arg0)?,
                cstring("shell flag", "-c")?,
                cstring("command", command)?,
            ],
            stdin: path_cstring("null device", null_device)?,
            log: path_cstring("log path", log_path)?,
        })
    }
}

/// Signals the supervisor handles itself
const SUPERVISOR_SIGNALS: [Signal; 3] = [Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT];

/// Dispositions a child must not inherit: the supervisor's handlers, and
/// the `SIGPIPE` ignore set up by the Rust runtime, which would survive
/// `exec` and break pipelines inside the command
const CHILD_DEFAULT_SIGNALS: [Signal; 4] = [
    Signal::SIGCHLD,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGPIPE,
];

/// Fork a child running `launch` as the leader of a new session
///
/// The supervisor's signals stay blocked across the fork. The child puts
/// their default dispositions back before unblocking, so a `SIGTERM` that
/// arrives before `exec` terminates it instead of running the
/// supervisor's handler in the child.
pub fn spawn(launch: &LaunchSpec) -> nix::Result<Pid> {
    let mut blocked = SigSet::empty();
    for signal in SUPERVISOR_SIGNALS {
        blocked.add(signal);
    }
    let mut previous = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))?;

    // SAFETY: the child branch only performs async-signal-safe calls on
    // data prepared before the fork and never returns.
    let forked = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            restore_default_dispositions();
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
            exec_service_child(launch)
        }
        Err(errno) => Err(errno),
    };

    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
    forked
}

/// Put every signal a child cares about back to `SIG_DFL`
///
/// Only for use in a forked child before `exec`.
pub(crate) fn restore_default_dispositions() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in CHILD_DEFAULT_SIGNALS {
        // SAFETY: installing SIG_DFL has no handler code to run.
        let _ = unsafe { sigaction(signal, &default) };
    }
}

fn exec_service_child(launch: &LaunchSpec) -> ! {
    if let Ok(fd) = open(launch.stdin.as_c_str(), OFlag::O_RDONLY, Mode::empty()) {
        redirect(fd, &[0]);
    }
    if let Ok(fd) = open(
        launch.log.as_c_str(),
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_APPEND,
        Mode::from_bits_truncate(0o644),
    ) {
        redirect(fd, &[1, 2]);
    }
    // New session: no controlling terminal, and a process group that a
    // single killpg reaches together with every descendant.
    let _ = setsid();

    let errno = match execv(&launch.program, &launch.argv) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    exit_after_exec_failure(errno)
}

/// Point every fd in `targets` at `fd`, then drop `fd` unless it is a target
pub(crate) fn redirect(fd: RawFd, targets: &[RawFd]) {
    for &target in targets {
        let _ = dup2(fd, target);
    }
    if !targets.contains(&fd) {
        let _ = close(fd);
    }
}

/// Report a failed exec on stderr and leave with the reserved status
///
/// Only for use in a forked child: skips every exit handler of the parent
/// image.
pub(crate) fn exit_after_exec_failure(errno: Errno) -> ! {
    let parts: [&[u8]; 3] = [b"pidone: exec failed: ", errno.desc().as_bytes(), b"\n"];
    for part in parts {
        // SAFETY: write(2) and _exit(2) are async-signal-safe and the
        // buffers outlive the calls.
        unsafe {
            libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len());
        }
    }
    unsafe { libc::_exit(EXEC_FAILURE_STATUS) }
}

/// Send `signal` to the process group led by `pid`
///
/// A child that has not reached `setsid` yet has no group of its own, in
/// which case the signal goes to the child alone.
pub fn signal_group(pid: Pid, signal: Signal) -> nix::Result<()> {
    match killpg(pid, signal) {
        Err(Errno::ESRCH) => kill(pid, signal),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;
    use serial_test::serial;
    use std::{fs, path::PathBuf};
    use tempfile::TempDir;

    fn launch_for(command: &str, log: &Path) -> LaunchSpec {
        LaunchSpec::shell_command(
            Path::new("/bin/sh"),
            command,
            Path::new("/dev/null"),
            log,
        )
        .unwrap()
    }

    fn wait_exit(pid: Pid) -> ChildExit {
        let (reaped, exit) = ChildExit::from_wait_status(waitpid(pid, None).unwrap()).unwrap();
        assert_eq!(reaped, pid);
        exit
    }

    #[test]
    fn test_exit_classification() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ChildExit::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some((pid, ChildExit::Exited(3)))
        );
        assert_eq!(
            ChildExit::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some((pid, ChildExit::Signaled(Signal::SIGTERM)))
        );
        assert_eq!(ChildExit::from_wait_status(WaitStatus::StillAlive), None);

        assert!(!ChildExit::Exited(0).is_failure());
        assert!(ChildExit::Exited(127).is_failure());
        assert!(ChildExit::Signaled(Signal::SIGKILL).is_failure());
        assert_eq!(ChildExit::Signaled(Signal::SIGKILL).code(), None);
    }

    #[test]
    fn test_interior_nul_is_rejected() {
        let err = LaunchSpec::shell_command(
            Path::new("/bin/sh"),
            "echo a\0b",
            Path::new("/dev/null"),
            Path::new("/tmp/x.log"),
        )
        .unwrap_err();
        assert!(matches!(err, SupervisorError::InteriorNul { .. }));
    }

    #[test]
    #[serial]
    fn test_output_is_appended_to_log() {
        let logs = TempDir::new().unwrap();
        let log: PathBuf = logs.path().join("echo.log");
        fs::write(&log, "previous\n").unwrap();

        let pid = spawn(&launch_for("echo out; echo err >&2; read line || echo eof", &log)).unwrap();
        assert_eq!(wait_exit(pid), ChildExit::Exited(0));

        let contents = fs::read_to_string(&log).unwrap();
        assert_eq!(contents, "previous\nout\nerr\neof\n");
    }

    #[test]
    #[serial]
    fn test_child_leads_its_own_session() {
        let logs = TempDir::new().unwrap();
        let log = logs.path().join("sid.log");

        // Field 6 of /proc/<pid>/stat is the session id
        let pid = spawn(&launch_for("test \"$(cut -d' ' -f6 /proc/$$/stat)\" = \"$$\"", &log))
            .unwrap();
        assert_eq!(wait_exit(pid), ChildExit::Exited(0));
    }

    #[test]
    #[serial]
    fn test_exec_failure_exits_127() {
        let logs = TempDir::new().unwrap();
        let log = logs.path().join("missing.log");
        let launch = LaunchSpec::shell_command(
            Path::new("/nonexistent/shell"),
            "true",
            Path::new("/dev/null"),
            &log,
        )
        .unwrap();

        let pid = spawn(&launch).unwrap();
        assert_eq!(wait_exit(pid), ChildExit::Exited(EXEC_FAILURE_STATUS));
        assert!(fs::read_to_string(&log).unwrap().starts_with("pidone: exec failed"));
    }

    /// Bit mask of the `SigIgn` line in `/proc/<pid>/status` output
    fn ignored_signals(status: &str) -> u64 {
        let line = status
            .lines()
            .find(|line| line.starts_with("SigIgn:"))
            .unwrap();
        u64::from_str_radix(line["SigIgn:".len()..].trim(), 16).unwrap()
    }

    #[test]
    #[serial]
    fn test_child_does_not_inherit_ignored_sigpipe() {
        let logs = TempDir::new().unwrap();
        let log = logs.path().join("sigpipe.log");

        let pid = spawn(&launch_for(
            "grep SigIgn /proc/self/status; yes | head -c1 >/dev/null",
            &log,
        ))
        .unwrap();
        assert_eq!(wait_exit(pid), ChildExit::Exited(0));

        let contents = fs::read_to_string(&log).unwrap();
        let sigpipe = 1u64 << (Signal::SIGPIPE as i32 - 1);
        assert_eq!(ignored_signals(&contents) & sigpipe, 0, "{}", contents);
        assert!(!contents.contains("Broken pipe"), "{}", contents);
    }

    #[test]
    #[serial]
    fn test_signal_group_reaches_descendants() {
        let logs = TempDir::new().unwrap();
        let log = logs.path().join("group.log");

        // The shell waits on a background sleep; both share the group
        let pid = spawn(&launch_for("sleep 30 & wait", &log)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));

        signal_group(pid, Signal::SIGKILL).unwrap();
        assert_eq!(wait_exit(pid), ChildExit::Signaled(Signal::SIGKILL));
    }
}
