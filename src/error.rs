use std::time::Duration;
use thiserror::Error;

/// Classified failure of a dispatched handler. Errors never escape the
/// executor loop: each is logged, counted, and the message acked.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("transient store error: {0}")]
    TransientStore(#[source] sqlx::Error),
    #[error("user callback failed: {0}")]
    UserCallback(#[source] anyhow::Error),
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("monitor {0:?} is not registered")]
    NotRegistered(String),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl ExecutionError {
    /// Store operations surface `anyhow`; unwrap the sqlx root cause when
    /// there is one so classification stays faithful.
    pub fn store(err: anyhow::Error) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(err) => Self::TransientStore(err),
            Err(other) => Self::TransientStore(sqlx::Error::Protocol(other.to_string())),
        }
    }

    /// Metric counter bumped when this error is handled.
    pub fn metric(&self) -> &'static str {
        match self {
            Self::TransientStore(_) => crate::metrics::STORE_ERRORS,
            Self::UserCallback(_) => crate::metrics::MONITOR_EXECUTION_ERRORS,
            Self::Timeout(_) => crate::metrics::EXECUTION_TIMEOUTS,
            Self::NotRegistered(_) => crate::metrics::MONITOR_NOT_REGISTERED,
            Self::Validation(_) => crate::metrics::VALIDATION_ERRORS,
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_follow_the_classification() {
        let err = ExecutionError::NotRegistered("cpu_load".to_string());
        assert_eq!(err.metric(), crate::metrics::MONITOR_NOT_REGISTERED);

        let err = ExecutionError::Timeout(Duration::from_secs(30));
        assert_eq!(err.metric(), crate::metrics::EXECUTION_TIMEOUTS);
    }
}
