use std::sync::{
    Arc, Once,
    atomic::{AtomicBool, Ordering},
};

use tracing::{info, warn};

/// Shared flag raised by Ctrl+C / SIGTERM. Every loop in the process polls it.
pub(crate) fn install_handler() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            if !handler_shutdown.swap(true, Ordering::SeqCst) {
                info!("shutdown requested");
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}
