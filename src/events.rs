//! App lifecycle notifications

use std::fmt;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Why an app was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No traffic within the idle timeout
    Idle,
    /// Bulk purge or shutdown
    Purge,
    /// The process exited on its own
    Exited,
    /// Stopped by a direct call
    Explicit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Idle => "idle",
            StopReason::Purge => "purge",
            StopReason::Exited => "exited",
            StopReason::Explicit => "explicit",
        };
        f.write_str(s)
    }
}

/// A lifecycle event emitted by the app pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Started {
        name: String,
        addr: SocketAddr,
        pid: Option<u32>,
    },
    Stopped {
        name: String,
        reason: StopReason,
    },
    Failed {
        name: String,
        error: String,
    },
}

impl AppEvent {
    pub fn name(&self) -> &str {
        match self {
            AppEvent::Started { name, .. } | AppEvent::Stopped { name, .. } | AppEvent::Failed { name, .. } => {
                name
            }
        }
    }
}

/// Receiver of lifecycle events.
///
/// Implementations must not block: `notify` is called while the app's
/// state lock is held.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: AppEvent);
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEvents;

impl EventSink for LogEvents {
    fn notify(&self, event: AppEvent) {
        match event {
            AppEvent::Started { name, addr, pid } => {
                info!(name = %name, %addr, pid, "App started");
            }
            AppEvent::Stopped { name, reason } => {
                info!(name = %name, %reason, "App stopped");
            }
            AppEvent::Failed { name, error } => {
                warn!(name = %name, error = %error, "App failed to start");
            }
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventSink for NoopEvents {
    fn notify(&self, _event: AppEvent) {}
}
