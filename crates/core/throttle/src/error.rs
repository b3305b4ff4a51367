use std::fmt;

#[derive(Clone, PartialEq, Eq, Debug)]
/// Throttle coordinator error.
pub enum Error {
    /// The future was cancelled before it produced a result
    Cancelled,
    /// Waiting on a future exceeded the given timeout
    Timeout,
    /// Failed to receive the completion from the channel for unknown reason
    RecvError,
    /// The submission was rejected before anything was scheduled
    InvalidConfiguration { reason: String },
    /// The scheduler could not accept a new runnable
    SchedulerRejected { reason: String },
    /// The task itself raised an error
    TaskFailed { message: String },
}

impl Error {
    /// Wraps a business-level task failure.
    pub fn task(error: impl fmt::Display) -> Self {
        Error::TaskFailed {
            message: error.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled => write!(f, "Future was cancelled before completion"),
            Error::Timeout => write!(f, "Timed out waiting for the future to complete"),
            Error::RecvError => write!(f, "Unable to receive the completion from the channel"),
            Error::InvalidConfiguration { reason } => {
                write!(f, "Invalid throttle configuration: {reason}")
            }
            Error::SchedulerRejected { reason } => {
                write!(f, "Scheduler rejected the task: {reason}")
            }
            Error::TaskFailed { message } => write!(f, "Throttled task failed: {message}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn display_includes_the_reason() {
        let error = Error::InvalidConfiguration {
            reason: "throttle key must not be blank".to_string(),
        };
        assert!(error.to_string().contains("must not be blank"));
    }

    #[test]
    fn task_wraps_any_displayable_error() {
        let error = Error::task("analysis backend unreachable");
        assert!(matches!(error, Error::TaskFailed { .. }));
    }
}
