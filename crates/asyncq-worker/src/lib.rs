//! The asyncq worker: consumes queues, enforces the concurrency ceiling,
//! runs registered handlers, and settles every delivery exactly once.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod executor;
pub mod metrics;
pub mod registry;
pub mod revocation;
pub mod tasks;
pub mod worker;

pub use config::WorkerConfig;
pub use registry::{HandlerError, TaskContext, TaskHandler, TaskOptions, TaskRegistry};
pub use worker::Worker;
