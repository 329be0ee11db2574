use tracing_subscriber::EnvFilter;

/// Default level when `RUST_LOG` is not set
pub fn default_level() -> &'static str {
    if cfg!(feature = "verbose_debug") {
        "debug"
    } else {
        "info"
    }
}

/// Initialize logging to the console
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: debug with `verbose_debug`, info otherwise)
///
/// A second call, or any other failure, leaves the existing setup alone.
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stdout)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
