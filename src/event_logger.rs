//! Logging hook for session-core activity.
//!
//! This module provides the [`EventLogger`] trait that lets embedders capture every decoded
//! stream event, every settled token refresh, and every finished stream session.

use crate::status::Phase;
use crate::StreamEvent;

/// How a token refresh settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new bundle was issued and saved.
    Refreshed,
    /// The stored bundle could not be refreshed (no refresh token, or it expired); no network
    /// exchange took place.
    Unavailable,
    /// The backend explicitly rejected the refresh token.
    Rejected,
    /// The exchange failed for any other reason (network, malformed response, storage).
    Failed,
}

/// A trait for logging session-core operations.
///
/// # Example
///
/// ```rust,ignore
/// use chatline::{EventLogger, RefreshOutcome, StreamEvent};
/// use chatline::status::Phase;
///
/// struct StderrLogger;
///
/// impl EventLogger for StderrLogger {
///     fn log_stream_event(&self, event: &StreamEvent) {
///         eprintln!("event: {}", serde_json::to_string(event).unwrap());
///     }
///
///     fn log_refresh(&self, outcome: RefreshOutcome) {
///         eprintln!("refresh: {outcome:?}");
///     }
///
///     fn log_session_end(&self, phase: &Phase) {
///         eprintln!("session ended: {}", phase.name());
///     }
/// }
/// ```
pub trait EventLogger: Send + Sync {
    /// Log one decoded stream event, before the state machine sees it.
    fn log_stream_event(&self, event: &StreamEvent);

    /// Log a settled refresh operation.
    ///
    /// Called once per network exchange (or skipped exchange), not once per waiting caller.
    fn log_refresh(&self, outcome: RefreshOutcome);

    /// Log the terminal phase a stream session settled in.
    fn log_session_end(&self, phase: &Phase);
}
