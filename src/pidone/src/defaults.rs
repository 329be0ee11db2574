use std::time::Duration;

/// The default logo to be printed at the boot banner
pub const DEFAULT_BANNER_LOGO: &'static str = r#"       _     _
 _ __ (_) __| | ___  _ __   ___
| '_ \| |/ _` |/ _ \| '_ \ / _ \
| |_) | | (_| | (_) | | | |  __/
| .__/|_|\__,_|\___/|_| |_|\___|
|_|                             "#;

/// Where a user supplied logo is looked up when `customizable_logo` is on
pub const BANNER_LOGO_PATH: &'static str = "/etc/pidone/logo.txt";

/// Set the defaults for the PATH variable we want to set up
pub const DEFAULT_PATH: &'static str = "/sbin:/bin:/usr/sbin:/usr/bin";

/// Directory holding one definition file per service
pub const SERVICES_DIR: &'static str = "/etc/pidone/services";

/// Directory receiving `<name>.log` for every service
pub const LOG_DIR: &'static str = "/var/log";

/// Upper bound on the number of services accepted at load time
pub const MAX_SERVICES: usize = 128;

/// Interpreter used to run `ExecStart` values
pub const SHELL: &'static str = "/bin/sh";

pub const NULL_DEVICE: &'static str = "/dev/null";

pub const CONSOLE_DEVICE: &'static str = "/dev/tty1";
pub const FALLBACK_CONSOLE_DEVICE: &'static str = "/dev/console";
pub const LOGIN_PROGRAM: &'static str = "/bin/login";

/// Helper that performs the actual power-off at the end of shutdown
pub const POWEROFF_HELPER: &'static str = "/sbin/poweroff";

/// Exit status a child reports when replacing its image failed
pub const EXEC_FAILURE_STATUS: i32 = 127;

pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);
pub const SUPERVISOR_TICK: Duration = Duration::from_secs(1);
pub const CONSOLE_RESPAWN_PAUSE: Duration = Duration::from_secs(1);
