use tracing::error;

/// Report that the supervisor cannot keep running and display a helpful message
///
/// This function should be called with a helpful message when the control
/// loop cannot recover from an error it has encountered. It does not return
/// into the loop: the caller is expected to continue with shutdown, which
/// is the only controlled way out for process 1.
pub fn unrecoverable_error<M: std::fmt::Display>(msg: M) {
    error!("pidone has encountered a serious error: {}", msg);
    error!("Stopping all services and powering off. Please report a bug.");
}
