//! Demo tasks registered by the stock worker binary.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::registry::{HandlerError, TaskContext, TaskHandler};

/// Echoes the call's arguments back as the result.
pub struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
    async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        Ok(json!({ "args": ctx.args, "kwargs": ctx.kwargs }))
    }
}

/// Sums its numeric arguments.
pub struct AddTask;

#[async_trait]
impl TaskHandler for AddTask {
    async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        let mut sum = 0.0;
        for value in &ctx.args {
            sum += value
                .as_f64()
                .ok_or_else(|| HandlerError::failed(format!("not a number: {value}")))?;
        }
        Ok(json!(sum))
    }
}

/// Sleeps for the number of seconds given as the first argument (default
/// one second) and returns it. Handy for exercising concurrency limits
/// and revocation by hand.
pub struct SleepTask;

#[async_trait]
impl TaskHandler for SleepTask {
    async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        let secs = ctx.args.first().and_then(Value::as_f64).unwrap_or(1.0);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(json!(secs))
    }
}
