//! Effects (side effects as data).
//!
//! Transitions describe what has to happen alongside a state change. The
//! engine materializes these into a single repository commit and relays
//! messages only after that commit succeeded.

use serde::{Deserialize, Serialize};

/// All effects that can be produced by transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    // =========================================================================
    // Request effects
    // =========================================================================
    /// Fold the request into the non-terminal data sourcing of its triple,
    /// creating one if none exists.
    AssignDataSourcing,

    /// Publish `request.set-to-processing` after commit.
    NotifyProcessing,

    /// Collect the users of sibling requests and publish
    /// `request.set-to-withdrawn` after commit.
    NotifyWithdrawn,

    // =========================================================================
    // Data sourcing effects
    // =========================================================================
    /// Move every associated request still in Processing to Processed.
    CloseAssociatedRequests,

    /// Publish `data-sourcing.set-to-non-sourceable` after commit.
    NotifyNonSourceable,

    // =========================================================================
    // Logging effects
    // =========================================================================
    Log { level: LogLevel, message: String },
}

impl Effect {
    pub fn log_info(message: impl Into<String>) -> Self {
        Effect::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }
}

/// Log levels for the Log effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Emit a Log effect through tracing.
pub fn emit_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warn => tracing::warn!("{}", message),
    }
}
