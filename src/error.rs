use std::fmt;

use thiserror::Error;

use crate::state::StateError;

/// Errors returned when a schedule or cancel request is refused.
///
/// Refusals happen before any state is touched, except `State`, which is
/// raised by the persistence layer or the index.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Missing or malformed parameter.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No policy covers the URL, or the source address is not allowed.
    /// Both cases share one variant so callers cannot tell them apart.
    #[error("not authorized")]
    Unauthorized,

    /// Dispatcher is saturated.
    /// Caller must retry or apply backoff.
    #[error("dispatcher at capacity")]
    Overloaded,

    /// Supervisor has not been started, or has been stopped.
    #[error("service is not running")]
    NotRunning,

    #[error(transparent)]
    State(#[from] StateError),
}

impl ScheduleError {
    /// HTTP status reported to the scheduling client.
    pub fn status_code(&self) -> u16 {
        match self {
            ScheduleError::InvalidRequest(_) => 400,
            ScheduleError::Unauthorized => 401,
            ScheduleError::Overloaded | ScheduleError::NotRunning => 503,
            ScheduleError::State(_) => 500,
        }
    }
}

/// Outcome of a single callback attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(FailureReason),
}

/// Reasons why a callback attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Target answered with a status that will not change on retry.
    Rejected(u16),

    /// Target answered with any other non-success status.
    RemoteError(u16),

    Timeout,

    Network,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Rejected(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected(status) =>
                write!(f, "target rejected callback with status {status} (non-retryable)"),
            FailureReason::RemoteError(status) =>
                write!(f, "target returned status {status}"),
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
        }
    }
}
