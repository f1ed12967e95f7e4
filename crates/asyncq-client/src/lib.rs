//! Producer-side API: send task calls, revoke them, and poll results.

mod client;
mod result;

pub use client::{Client, SendOptions};
pub use result::AsyncResult;

use std::time::Duration;

use thiserror::Error;

/// How often [`AsyncResult::get`] re-reads the result store by default.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("no result backend is configured")]
    NoResultBackend,

    #[error("the operation timed out")]
    Timeout,

    #[error(transparent)]
    Store(#[from] asyncq_core::TaskError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
