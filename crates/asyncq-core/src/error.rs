use thiserror::Error;

/// Failure taxonomy shared across the crates.
///
/// Each variant maps to a distinct recovery strategy: malformed envelopes
/// are dead-lettered, unknown tasks fail terminally, connectivity problems
/// are retried with backoff, and result store problems defer
/// acknowledgment so the broker redelivers.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("task '{0}' is not registered with this worker")]
    UnknownTask(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("max retries ({0}) exceeded")]
    MaxRetriesExceeded(u32),

    #[error("broker connectivity: {0}")]
    BrokerConnectivity(String),

    #[error("result store unavailable: {0}")]
    ResultStoreUnavailable(String),

    #[error("the operation timed out")]
    Timeout,
}
