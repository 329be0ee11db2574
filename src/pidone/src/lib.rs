//! pidone - a small service supervisor meant to run as process 1
//!
//! Boot mounts the pseudo-filesystems, the [`registry`] loads one service per
//! definition file, the [`supervisor`] launches them, and the [`runtime`]
//! loop reaps exited children and applies restart policies until a
//! termination request arrives. [`shutdown`] then stops everything and hands
//! over to the power-off helper.

pub mod boot;
pub mod config;
pub mod console;
pub mod debug;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod shutdown;
pub mod supervisor;

pub use config::{ConsoleConfig, SupervisorConfig};
pub use error::{SupervisorError, SupervisorResult};
pub use process::ChildExit;
pub use registry::{discover, Discovery, LoadReport, ServiceRegistry, SkipReason};
pub use service::{RestartPolicy, Service, ServiceId, ServiceState};
pub use supervisor::{ExitDisposition, ProcessSupervisor, StopOutcome};
