use std::fmt;
use std::time::Duration;

/// Lifecycle and admission events emitted by buckets and the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaEvent {
    /// A bucket was registered for a key.
    Created {
        key: String,
        max_requests: u32,
        window: Duration,
    },
    /// A call found the window expired and reset the counter.
    Refreshed { key: String },
    /// A call was refused because the window's quota is spent.
    Denied {
        key: String,
        /// Backoff hint handed to the caller.
        retry_after: Duration,
    },
    /// A bucket ended and its directory entry was removed.
    Terminated { key: String, reason: TerminationReason },
}

impl QuotaEvent {
    /// Key the event refers to.
    pub fn key(&self) -> &str {
        match self {
            QuotaEvent::Created { key, .. }
            | QuotaEvent::Refreshed { key }
            | QuotaEvent::Denied { key, .. }
            | QuotaEvent::Terminated { key, .. } => key,
        }
    }
}

/// Why a bucket stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// No call arrived within the idle timeout.
    Idle,
    /// An explicit stop was requested.
    Stopped,
    /// Every handle was dropped, so no further call could arrive.
    Orphaned,
    /// Internal fault or panic in the processing step.
    Fault(String),
}

impl TerminationReason {
    /// Normal terminations never warrant attention; faults do.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, TerminationReason::Fault(_))
    }
}

impl fmt::Display for QuotaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaEvent::Created { key, max_requests, window } => {
                write!(f, "Created({}, max={}, window={:?})", key, max_requests, window)
            }
            QuotaEvent::Refreshed { key } => write!(f, "Refreshed({})", key),
            QuotaEvent::Denied { key, retry_after } => {
                write!(f, "Denied({}, retry_after={:?})", key, retry_after)
            }
            QuotaEvent::Terminated { key, reason } => {
                write!(f, "Terminated({}, reason={})", key, reason)
            }
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Idle => write!(f, "idle"),
            TerminationReason::Stopped => write!(f, "stopped"),
            TerminationReason::Orphaned => write!(f, "orphaned"),
            TerminationReason::Fault(msg) => write!(f, "fault: {}", msg),
        }
    }
}
