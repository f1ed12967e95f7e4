//! Core types shared by every asyncq crate: the task envelope, task
//! states, result records, retry policies, and the error taxonomy.

pub mod envelope;
pub mod error;
pub mod result;
pub mod retry;
pub mod status;

pub use envelope::{Envelope, EnvelopeBody, EnvelopeHeaders, EnvelopeProperties};
pub use error::TaskError;
pub use result::{ResultMeta, RESULT_KEY_PREFIX};
pub use retry::RetryPolicy;
pub use status::TaskState;

/// Queue used when a task or producer does not name one.
pub const DEFAULT_QUEUE: &str = "celery";

/// Automatic retry attempts granted to a task unless overridden.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Highest message priority a queue distinguishes.
pub const MAX_PRIORITY: u8 = 9;
