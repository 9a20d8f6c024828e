//! Global panic hook with structured logging
//!
//! Installed early in main() so that a panic on any worker thread is
//! captured by the tracing subscribers before the process dies. Handler
//! panics inside the event bus are caught separately and never reach this
//! hook.

use std::panic;
use tracing::error;

/// Install a global panic hook that logs location and message via tracing,
/// then delegates to the previous hook.
pub fn install_panic_handler() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown location>".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "<no message>".to_string()
        };

        error!(location = %location, message = %message, "PANIC");

        default_hook(panic_info);
    }));
}
