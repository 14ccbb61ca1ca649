// Logging facade over `tracing`; debug output is gated separately so it stays quiet by default
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

const LOG_TARGET: &str = "spytester";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

// When enabled, debug messages are forwarded to the subscriber; otherwise only info and above
pub fn set_debug_enabled(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

pub(crate) fn info(args: fmt::Arguments) {
    tracing::info!(target: LOG_TARGET, "{args}");
}

pub(crate) fn debug(args: fmt::Arguments) {
    if !debug_enabled() {
        return;
    }
    tracing::debug!(target: LOG_TARGET, "{args}");
}

pub(crate) fn warn(args: fmt::Arguments) {
    tracing::warn!(target: LOG_TARGET, "{args}");
}

pub(crate) fn error(args: fmt::Arguments) {
    tracing::error!(target: LOG_TARGET, "{args}");
}
