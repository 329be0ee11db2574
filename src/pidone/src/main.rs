use pidone::{
    boot,
    console::ConsoleSessionManager,
    debug::unrecoverable_error,
    logging,
    reaper::{SignalFlags, SignalReaper},
    registry,
    runtime::Runtime,
    shutdown::ShutdownSequencer,
    ProcessSupervisor, SupervisorConfig,
};
use tracing::{info, warn};

fn main() {
    logging::init_logging();
    boot::print_boot_banner_info();

    let config = SupervisorConfig::default();
    boot::prepare_system(&config);

    let discovery = registry::discover(&config.services_dir, &config.log_dir, config.capacity);
    discovery.report.log(&config.services_dir);
    let mut supervisor = ProcessSupervisor::new(discovery.registry, config.clone());

    // Handlers go in before the first fork so no SIGCHLD is missed
    match SignalFlags::install() {
        Ok(flags) => {
            let started = supervisor.start_all();
            info!("Started {} of {} services", started, supervisor.registry().len());

            match ConsoleSessionManager::new(config.console.clone()).and_then(|c| c.spawn()) {
                Ok(_) => {}
                Err(e) => warn!("No console session: {}", e),
            }

            let mut runtime = Runtime::new(supervisor, SignalReaper::new(flags));
            if let Err(e) = runtime.run() {
                unrecoverable_error(e);
            }
            supervisor = runtime.into_supervisor();
        }
        Err(e) => unrecoverable_error(e),
    }

    let outcome = ShutdownSequencer::new(&config.poweroff_helper).run(&mut supervisor);
    // Returning from process 1 is left to the kernel to deal with
    warn!("Shutdown finished without power-off: {}", outcome);
}
