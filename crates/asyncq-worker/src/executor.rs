//! Task execution and settlement.
//!
//! One executor invocation owns a delivery from handler start to the
//! single ack or nack that settles it. The handler runs on its own
//! spawned task so a panic is contained and cancellation can abort it
//! at the next await. Revocation is re-checked after the handler
//! finishes: a revoke that lands mid-execution still wins, and no
//! SUCCESS record is committed for a task the caller already gave up on.
//!
//! Settlement order is write-then-ack. If a terminal record cannot be
//! written the delivery is nacked back to the queue, so a result is
//! never silently lost. Two exceptions: a RETRY record is best-effort
//! once the retry copy is queued (requeueing here would duplicate the
//! attempt), and a REVOKED record is best-effort because a revoked task
//! must not come back.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use asyncq_backend::ResultStore;
use asyncq_core::{Envelope, ResultMeta, TaskError, TaskState};
use asyncq_protocol::message::PublishRequest;

use crate::connection::{BrokerHandle, TaskDelivery};
use crate::metrics::WorkerMetrics;
use crate::registry::{HandlerError, RegisteredTask, TaskContext, TaskOptions};
use crate::revocation::{InflightRegistry, RevocationRegistry};

/// What one attempt produced, before the result write and ack.
#[derive(Debug)]
pub(crate) enum Outcome {
    Success(Value),
    Retry { delay: Duration, reason: String },
    Failure(TaskError),
    Revoked,
}

/// Decide what follows a handler error on an attempt that has already
/// been retried `retries` times.
pub(crate) fn classify(error: HandlerError, retries: u32, options: &TaskOptions) -> Outcome {
    match error {
        HandlerError::Retry { countdown } => {
            if retries < options.max_retries {
                Outcome::Retry {
                    delay: countdown
                        .unwrap_or_else(|| options.retry_policy.delay_for(retries)),
                    reason: "retry requested".to_string(),
                }
            } else {
                Outcome::Failure(TaskError::MaxRetriesExceeded(options.max_retries))
            }
        }
        HandlerError::Failed(message) => {
            if retries < options.max_retries {
                Outcome::Retry {
                    delay: options.retry_policy.delay_for(retries),
                    reason: message,
                }
            } else {
                Outcome::Failure(TaskError::Handler(message))
            }
        }
    }
}

pub(crate) struct Executor {
    pub broker: BrokerHandle,
    pub backend: Option<Arc<ResultStore>>,
    pub revocations: Arc<RevocationRegistry>,
    pub inflight: Arc<InflightRegistry>,
    pub metrics: Arc<WorkerMetrics>,
}

impl Executor {
    /// Run one delivery to settlement. Holds `permit` for the duration,
    /// which is what bounds worker concurrency.
    pub(crate) async fn execute(
        self: Arc<Self>,
        delivery: TaskDelivery,
        envelope: Envelope,
        task: Arc<RegisteredTask>,
        permit: OwnedSemaphorePermit,
    ) {
        let task_id = envelope.id();
        self.metrics.inflight_tasks.inc();

        // A revoke may have landed while we waited for the permit.
        let mut outcome = if self.revocations.is_revoked(&task_id) {
            Outcome::Revoked
        } else {
            let (guard, token) = self.inflight.track(task_id);
            let outcome = self.run_handler(&envelope, &task, token).await;
            drop(guard);
            outcome
        };

        // Re-validate before committing: a revoke that raced the handler's
        // completion overrides whatever the handler produced.
        if !matches!(outcome, Outcome::Revoked) && self.revocations.is_revoked(&task_id) {
            outcome = Outcome::Revoked;
        }

        self.settle(&delivery, &envelope, &task, outcome).await;
        self.metrics.inflight_tasks.dec();
        drop(permit);
    }

    async fn run_handler(
        &self,
        envelope: &Envelope,
        task: &RegisteredTask,
        token: CancellationToken,
    ) -> Outcome {
        let ctx = TaskContext::new(
            envelope.id(),
            envelope.task().to_string(),
            envelope.headers.retries,
            envelope.args().to_vec(),
            envelope.kwargs().clone(),
            self.backend.clone(),
        );
        let handler = Arc::clone(&task.handler);
        let mut invocation = tokio::spawn(async move { handler.run(ctx).await });

        let finished = tokio::select! {
            _ = token.cancelled() => {
                invocation.abort();
                return Outcome::Revoked;
            }
            finished = &mut invocation => finished,
        };

        let retries = envelope.headers.retries;
        match finished {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(handler_error)) => {
                debug!(
                    task_id = %envelope.id(),
                    retries,
                    error = %handler_error,
                    "handler signalled an error"
                );
                classify(handler_error, retries, &task.options)
            }
            Err(join_error) if join_error.is_panic() => {
                error!(task_id = %envelope.id(), task = envelope.task(), "handler panicked");
                classify(
                    HandlerError::Failed("handler panicked".to_string()),
                    retries,
                    &task.options,
                )
            }
            // Aborted: only the cancellation path above does that.
            Err(_) => Outcome::Revoked,
        }
    }

    async fn settle(
        &self,
        delivery: &TaskDelivery,
        envelope: &Envelope,
        task: &RegisteredTask,
        outcome: Outcome,
    ) {
        let task_id = envelope.id();
        let ignore_result = envelope.headers.ignore_result || task.options.ignore_result;

        match outcome {
            Outcome::Success(value) => {
                info!(task_id = %task_id, task = envelope.task(), "task succeeded");
                if !ignore_result {
                    if let Err(error) = self.write_record(ResultMeta::success(task_id, value)).await
                    {
                        warn!(task_id = %task_id, %error, "result write failed; requeueing");
                        self.broker.nack(delivery.epoch, delivery.delivery_tag, true);
                        return;
                    }
                }
                self.count_settled(TaskState::Success);
                self.broker.ack(delivery.epoch, delivery.delivery_tag);
            }
            Outcome::Failure(error) => {
                warn!(task_id = %task_id, task = envelope.task(), %error, "task failed");
                // ignore_result only silences SUCCESS; failures stay visible.
                let record = ResultMeta::failure(task_id, &error.to_string());
                if let Err(store_error) = self.write_record(record).await {
                    warn!(task_id = %task_id, %store_error, "result write failed; requeueing");
                    self.broker.nack(delivery.epoch, delivery.delivery_tag, true);
                    return;
                }
                self.count_settled(TaskState::Failure);
                self.broker.ack(delivery.epoch, delivery.delivery_tag);
            }
            Outcome::Retry { delay, reason } => {
                let next = envelope.for_retry(delay);
                info!(
                    task_id = %task_id,
                    task = envelope.task(),
                    retries = next.headers.retries,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                match self.republish(&next).await {
                    Ok(()) => {
                        // The retry copy is queued; failing the write here
                        // must not requeue the original as well.
                        if let Err(error) =
                            self.write_record(ResultMeta::retry(task_id, &reason)).await
                        {
                            debug!(task_id = %task_id, %error, "retry record write failed");
                        }
                        self.count_settled(TaskState::Retry);
                        self.broker.ack(delivery.epoch, delivery.delivery_tag);
                    }
                    Err(error) => {
                        warn!(task_id = %task_id, %error, "retry publish failed; requeueing");
                        self.broker.nack(delivery.epoch, delivery.delivery_tag, true);
                    }
                }
            }
            Outcome::Revoked => {
                info!(task_id = %task_id, task = envelope.task(), "task revoked");
                // Never requeue a revoked task over a failed write.
                if let Err(error) = self.write_record(ResultMeta::revoked(task_id)).await {
                    debug!(task_id = %task_id, %error, "revoked record write failed");
                }
                self.count_settled(TaskState::Revoked);
                self.broker.ack(delivery.epoch, delivery.delivery_tag);
            }
        }
    }

    /// Write a record if a backend is configured; without one, writes
    /// succeed as no-ops.
    pub(crate) async fn write_record(&self, meta: ResultMeta) -> Result<(), TaskError> {
        match (&self.backend, meta.task_id) {
            (Some(store), Some(task_id)) => store.store(task_id, &meta).await,
            _ => Ok(()),
        }
    }

    pub(crate) fn count_settled(&self, state: TaskState) {
        self.metrics
            .tasks_total
            .with_label_values(&[state.as_str()])
            .inc();
    }

    async fn republish(&self, envelope: &Envelope) -> Result<(), TaskError> {
        let payload = asyncq_protocol::envelope::encode(envelope)?;
        self.broker
            .publish(PublishRequest {
                routing_key: envelope.queue().to_string(),
                priority: envelope.properties.priority.unwrap_or(0),
                eta: envelope.headers.eta,
                payload: payload.to_vec(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asyncq_core::RetryPolicy;

    fn options(max_retries: u32) -> TaskOptions {
        TaskOptions {
            max_retries,
            retry_policy: RetryPolicy::Fixed {
                delay: Duration::from_secs(5),
            },
            ignore_result: false,
        }
    }

    #[test]
    fn test_explicit_retry_uses_countdown() {
        let outcome = classify(
            HandlerError::retry_in(Duration::from_millis(250)),
            0,
            &options(3),
        );
        match outcome {
            Outcome::Retry { delay, .. } => assert_eq!(delay, Duration::from_millis(250)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_retry_falls_back_to_policy_delay() {
        let outcome = classify(HandlerError::retry(), 1, &options(3));
        match outcome {
            Outcome::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(5)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_retries_while_attempts_remain() {
        let outcome = classify(HandlerError::failed("boom"), 2, &options(3));
        match outcome {
            Outcome::Retry { reason, .. } => assert_eq!(reason, "boom"),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_with_no_retries_is_terminal() {
        let outcome = classify(HandlerError::failed("boom"), 0, &options(0));
        match outcome {
            Outcome::Failure(TaskError::Handler(message)) => assert_eq!(message, "boom"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_explicit_retry_is_terminal() {
        let outcome = classify(HandlerError::retry(), 3, &options(3));
        match outcome {
            Outcome::Failure(TaskError::MaxRetriesExceeded(max)) => assert_eq!(max, 3),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
