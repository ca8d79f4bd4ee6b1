use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit status used when a second interrupt forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Cancels `cancel` on the first Ctrl+C and exits the process on the second.
///
/// In-flight downloads observe the cancellation and remove their temporary
/// files; a forced exit may leave them behind.
pub fn install_interrupt_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to install Ctrl+C handler");
            return;
        }
        tracing::warn!("interrupt received, stopping; press Ctrl+C again to force quit");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Force quit!");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
}
