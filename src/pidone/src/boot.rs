use std::{fs, path::Path};

use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    mount::{mount, MsFlags},
    sys::stat::Mode,
    unistd::{getpid, mkdir},
};
use tracing::{debug, info, warn};

use crate::{config::SupervisorConfig, defaults};

// Supress unused include warnings when the feature is disabled
#[cfg(feature = "customizable_logo")]
use std::borrow::Cow;

/// Pseudo-filesystems mounted at boot: (source, target, type)
const PSEUDO_FILESYSTEMS: [(&str, &str, &str); 3] = [
    ("proc", "/proc", "proc"),
    ("sysfs", "/sys", "sysfs"),
    ("devtmpfs", "/dev", "devtmpfs"),
];

/// Try to load the logo provided by a user from `defaults::BANNER_LOGO_PATH`
///
/// If this file cannot be found or read, this will provide a default logo
/// from `defaults::DEFAULT_BANNER_LOGO`.
#[cfg(feature = "customizable_logo")]
pub fn get_boot_banner_logo() -> Cow<'static, str> {
    match fs::read_to_string(defaults::BANNER_LOGO_PATH) {
        Ok(logo) => Cow::Owned(logo),
        Err(_) => Cow::Borrowed(defaults::DEFAULT_BANNER_LOGO),
    }
}

/// Load the default logo
#[cfg(not(feature = "customizable_logo"))]
pub fn get_boot_banner_logo() -> &'static str {
    defaults::DEFAULT_BANNER_LOGO
}

/// Print out useful information during boot including a nice logo
pub fn print_boot_banner_info() {
    let logo = get_boot_banner_logo();
    println!("{}", logo);
    println!("pidone {}", env!("CARGO_PKG_VERSION"));
}

/// Check if we are running as PID 1
pub fn is_pid1() -> bool {
    getpid().as_raw() == 1
}

fn mount_pseudo_filesystem(source: &str, target: &str, fstype: &str) -> Result<()> {
    match mkdir(target, Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to create {}", target)),
    }
    mount(
        Some(source),
        target,
        Some(fstype),
        MsFlags::empty(),
        None::<&str>,
    )
    .with_context(|| format!("Failed to mount {} on {}", fstype, target))
}

/// Attempt every pseudo-filesystem mount
///
/// Failures are logged and otherwise ignored, an image may well have some
/// of them mounted already.
pub fn mount_pseudo_filesystems() {
    for (source, target, fstype) in PSEUDO_FILESYSTEMS {
        match mount_pseudo_filesystem(source, target, fstype) {
            Ok(()) => debug!("Mounted {} on {}", fstype, target),
            Err(e) => warn!("{:#}", e),
        }
    }
}

fn create_log_dir(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))
}

/// Everything that has to happen before services are loaded
pub fn prepare_system(config: &SupervisorConfig) {
    if is_pid1() {
        info!("Running as PID 1, mounting pseudo-filesystems");
        mount_pseudo_filesystems();
    } else {
        debug!("Not PID 1 (pid={}), skipping mounts", getpid());
    }

    if let Err(e) = create_log_dir(&config.log_dir) {
        warn!("{:#}", e);
    }

    // The kernel starts us with a bare environment
    if std::env::var_os("PATH").is_none() {
        std::env::set_var("PATH", defaults::DEFAULT_PATH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_dir_is_created() {
        let scratch = TempDir::new().unwrap();
        let log_dir = scratch.path().join("var").join("log");
        create_log_dir(&log_dir).unwrap();
        assert!(log_dir.is_dir());
        // Already existing is fine
        create_log_dir(&log_dir).unwrap();
    }

    #[test]
    fn test_log_dir_failure_has_context() {
        let scratch = TempDir::new().unwrap();
        let file = scratch.path().join("file");
        fs::write(&file, "").unwrap();

        let err = create_log_dir(&file.join("log")).unwrap_err();
        assert!(format!("{:#}", err).starts_with("Failed to create log directory"));
    }

    #[test]
    fn test_default_logo() {
        assert!(!get_boot_banner_logo().is_empty());
    }
}
