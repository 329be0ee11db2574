//! Loading service definitions from a directory
//!
//! A definition file is a list of `Key=Value` lines. Only `Name`,
//! `ExecStart` and `Restart` are understood (case-insensitively), anything
//! else is ignored. A malformed file must never keep the system from
//! booting, so problems end up in a [`LoadReport`] instead of an error.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::service::{RestartPolicy, Service, ServiceId};

/// Why a definition file did not make it into the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Unreadable(String),
    MissingName,
    MissingExecStart,
    /// The name would not give a log file inside the log directory
    InvalidName(String),
    DuplicateName(String),
    /// A value holds a NUL byte and could never be passed to `exec`
    NulByte(&'static str),
    CapacityExceeded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unreadable(e) => write!(f, "unreadable: {}", e),
            SkipReason::MissingName => f.write_str("no Name"),
            SkipReason::MissingExecStart => f.write_str("no ExecStart"),
            SkipReason::InvalidName(name) => write!(f, "invalid name {:?}", name),
            SkipReason::DuplicateName(name) => write!(f, "duplicate name {:?}", name),
            SkipReason::NulByte(key) => write!(f, "{} contains a NUL byte", key),
            SkipReason::CapacityExceeded => f.write_str("registry is full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDefinition {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Outcome of a [`discover`] pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Set when the services directory itself could not be listed
    pub directory_error: Option<String>,
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedDefinition>,
}

impl LoadReport {
    fn skip(&mut self, path: PathBuf, reason: SkipReason) {
        self.skipped.push(SkippedDefinition { path, reason });
    }

    /// Emit the report through the logger
    pub fn log(&self, directory: &Path) {
        if let Some(error) = &self.directory_error {
            warn!("Cannot read services directory {}: {}", directory.display(), error);
        }
        for skipped in &self.skipped {
            warn!("Skipping service file {}: {}", skipped.path.display(), skipped.reason);
        }
        info!(
            loaded = self.loaded.len(),
            skipped = self.skipped.len(),
            "Loaded service definitions from {}",
            directory.display()
        );
    }
}

/// The values found in one definition file
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub exec_start: String,
    pub restart: RestartPolicy,
}

/// Parse the text of one definition file
///
/// Lines starting with `#` or `;` are comments. Everything after the first
/// `=` is the value, including any `#`, since shell commands may contain
/// one. A repeated key overrides the earlier value.
pub fn parse_definition(text: &str) -> Result<ServiceDefinition, SkipReason> {
    let mut definition = ServiceDefinition::default();

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key.eq_ignore_ascii_case("name") {
            definition.name = value.to_string();
        } else if key.eq_ignore_ascii_case("execstart") {
            definition.exec_start = value.to_string();
        } else if key.eq_ignore_ascii_case("restart") {
            definition.restart = RestartPolicy::from_value(value);
        }
    }

    if definition.name.is_empty() {
        return Err(SkipReason::MissingName);
    }
    if definition.exec_start.is_empty() {
        return Err(SkipReason::MissingExecStart);
    }
    if definition.name.contains('\0') {
        return Err(SkipReason::NulByte("Name"));
    }
    if definition.exec_start.contains('\0') {
        return Err(SkipReason::NulByte("ExecStart"));
    }
    if definition.name.contains('/') || definition.name == "." || definition.name == ".." {
        return Err(SkipReason::InvalidName(definition.name));
    }
    Ok(definition)
}

/// Ordered, bounded collection of services
///
/// Insertion order is load order, which is also the shutdown order. The
/// registry never grows after [`discover`] returns.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: Vec<Service>,
    capacity: usize,
}

impl ServiceRegistry {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            services: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.services.len() >= self.capacity
    }

    fn contains_name(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name() == name)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: ServiceId) -> Option<&mut Service> {
        self.services.get_mut(id.0)
    }

    /// Ids in load order
    pub fn ids(&self) -> impl Iterator<Item = ServiceId> {
        (0..self.services.len()).map(ServiceId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceId, &Service)> {
        self.services
            .iter()
            .enumerate()
            .map(|(i, s)| (ServiceId(i), s))
    }

    pub fn find(&self, name: &str) -> Option<ServiceId> {
        self.services
            .iter()
            .position(|s| s.name() == name)
            .map(ServiceId)
    }
}

pub struct Discovery {
    pub registry: ServiceRegistry,
    pub report: LoadReport,
}

/// Candidate definition files in `directory`, sorted by file name
fn definition_files(directory: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = fs::read_dir(directory)?.map(|entry| entry.map(|e| e.path()));
    Ok(select_definition_files(entries))
}

/// Keep the regular, non-hidden files among `entries`
///
/// An entry that cannot be read is left out, the rest of the listing is
/// still used.
fn select_definition_files<I>(entries: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = std::io::Result<PathBuf>>,
{
    let mut files = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                debug!("Ignoring unreadable directory entry: {}", e);
                continue;
            }
        };
        let hidden = path
            .file_name()
            .map_or(true, |name| name.to_string_lossy().starts_with('.'));
        if hidden {
            continue;
        }
        // Follows symlinks, a link to a regular file counts
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => files.push(path),
            Ok(_) => debug!("Ignoring non-regular entry {}", path.display()),
            Err(e) => debug!("Ignoring entry {}: {}", path.display(), e),
        }
    }
    files.sort();
    files
}

/// Build the registry from every definition file in `directory`
pub fn discover(directory: &Path, log_dir: &Path, capacity: usize) -> Discovery {
    let mut registry = ServiceRegistry::with_capacity(capacity);
    let mut report = LoadReport::default();

    let files = match definition_files(directory) {
        Ok(files) => files,
        Err(e) => {
            report.directory_error = Some(e.to_string());
            return Discovery { registry, report };
        }
    };

    for path in files {
        let text = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                report.skip(path, SkipReason::Unreadable(e.to_string()));
                continue;
            }
        };
        let definition = match parse_definition(&text) {
            Ok(definition) => definition,
            Err(reason) => {
                report.skip(path, reason);
                continue;
            }
        };
        if registry.is_full() {
            report.skip(path, SkipReason::CapacityExceeded);
            continue;
        }
        if registry.contains_name(&definition.name) {
            report.skip(path, SkipReason::DuplicateName(definition.name));
            continue;
        }

        debug!(
            name = %definition.name,
            restart = %definition.restart,
            "Found service definition {}",
            path.display()
        );
        report.loaded.push(definition.name.clone());
        registry.services.push(Service::new(
            definition.name,
            definition.exec_start,
            definition.restart,
            log_dir,
        ));
    }

    Discovery { registry, report }
}
