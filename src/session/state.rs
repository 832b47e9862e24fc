//! Observable session state

use serde::Serialize;
use std::fmt;

/// Lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Idle,
    Uploading,
    Paused,
    Succeeded,
    Cancelled,
}

impl SessionState {
    /// `Succeeded` and `Cancelled` only leave through a new `start` or `reset`
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Uploading => "uploading",
            SessionState::Paused => "paused",
            SessionState::Succeeded => "succeeded",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `received / total` as a percentage rounded to two decimals
///
/// An empty total yields 0.
pub fn progress_percent(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let percent = received.min(total) as f64 / total as f64 * 100.0;
    (percent * 100.0).round() / 100.0
}

/// Everything a presentation layer needs, computed fresh from the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub state: SessionState,
    pub progress_percent: f64,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub active_file_name: Option<String>,
    /// Diagnostic for the last automatic pause
    pub message: Option<String>,
}

impl Snapshot {
    pub fn new(
        state: SessionState,
        received_bytes: u64,
        total_bytes: u64,
        active_file_name: Option<String>,
        message: Option<String>,
    ) -> Self {
        let progress_percent = if total_bytes == 0 && state == SessionState::Succeeded {
            100.0
        } else {
            progress_percent(received_bytes, total_bytes)
        };

        Self {
            state,
            progress_percent,
            received_bytes,
            total_bytes,
            active_file_name,
            message,
        }
    }

    pub fn idle() -> Self {
        Self::new(SessionState::Idle, 0, 0, None, None)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::idle()
    }
}
