//! Inbound device commands
//!
//! Commands arrive at QoS 0 on `/devices/{id}/commands/#` and are handed over
//! as opaque payloads. Handlers run on the dispatch path and must not block.

use tracing::info;

/// Receives commands addressed to this device
pub trait CommandHandler: Send + Sync {
    /// `subfolder` is the topic suffix after `commands/`, if any
    fn handle_command(&self, subfolder: Option<&str>, payload: &[u8]);
}

/// Default handler: log the command and drop it
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCommandHandler;

impl CommandHandler for LoggingCommandHandler {
    fn handle_command(&self, subfolder: Option<&str>, payload: &[u8]) {
        info!(
            subfolder = subfolder.unwrap_or(""),
            bytes = payload.len(),
            "Received command '{}'",
            String::from_utf8_lossy(payload)
        );
    }
}
