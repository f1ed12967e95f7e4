//! Delivery admission.
//!
//! The dispatcher sits between the connection actor and the executors.
//! For each delivery it decodes the envelope, filters out what must not
//! run (undecodable payloads, revoked ids, expired deadlines, unknown
//! task names), then waits for an execution permit before spawning an
//! executor. Waiting here is the backpressure mechanism: the permit
//! count equals the consume prefetch, so once the budget is full the
//! loop stops pulling and the broker stops sending.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use asyncq_core::{Envelope, ResultMeta, TaskError, TaskState};

use crate::connection::{BrokerHandle, TaskDelivery};
use crate::executor::Executor;
use crate::registry::TaskRegistry;
use crate::revocation::RevocationRegistry;

pub(crate) struct Dispatcher {
    pub registry: Arc<TaskRegistry>,
    pub revocations: Arc<RevocationRegistry>,
    pub broker: BrokerHandle,
    pub executor: Arc<Executor>,
    pub semaphore: Arc<Semaphore>,
    pub shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) async fn run(self, mut deliveries: mpsc::Receiver<TaskDelivery>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.dispatch(delivery).await,
                    None => return,
                },
            }
        }
    }

    async fn dispatch(&self, delivery: TaskDelivery) {
        let envelope = match asyncq_protocol::envelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Requeueing an unparseable payload would loop forever;
                // ack it away and count it.
                warn!(queue = %delivery.queue, %error, "dropping undecodable delivery");
                self.executor.metrics.decode_errors_total.inc();
                self.broker.ack(delivery.epoch, delivery.delivery_tag);
                return;
            }
        };
        let task_id = envelope.id();

        if self.revocations.is_revoked(&task_id) {
            debug!(task_id = %task_id, task = envelope.task(), "skipping revoked task");
            self.finalize_revoked(&delivery, &envelope).await;
            return;
        }
        if envelope.is_expired(Utc::now()) {
            info!(task_id = %task_id, task = envelope.task(), "task expired before execution");
            self.finalize_revoked(&delivery, &envelope).await;
            return;
        }

        let task = match self.registry.get(envelope.task()) {
            Some(task) => task,
            None => {
                warn!(task_id = %task_id, task = envelope.task(), "no handler registered");
                let error = TaskError::UnknownTask(envelope.task().to_string());
                self.finalize_failure(&delivery, &envelope, &error).await;
                return;
            }
        };

        let permit = tokio::select! {
            // Shutdown while waiting: the delivery stays unacked and the
            // broker requeues it when the connection drops.
            _ = self.shutdown.cancelled() => return,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let executor = Arc::clone(&self.executor);
        tokio::spawn(executor.execute(delivery, envelope, task, permit));
    }

    /// Settle a task that never ran: REVOKED record (best-effort), ack.
    async fn finalize_revoked(&self, delivery: &TaskDelivery, envelope: &Envelope) {
        let record = ResultMeta::revoked(envelope.id());
        if let Err(error) = self.executor.write_record(record).await {
            debug!(task_id = %envelope.id(), %error, "revoked record write failed");
        }
        self.executor.count_settled(TaskState::Revoked);
        self.broker.ack(delivery.epoch, delivery.delivery_tag);
    }

    /// Settle a task that can never run as FAILURE. The record must land
    /// before the ack; otherwise the delivery goes back to the queue.
    async fn finalize_failure(
        &self,
        delivery: &TaskDelivery,
        envelope: &Envelope,
        error: &TaskError,
    ) {
        let record = ResultMeta::failure(envelope.id(), &error.to_string());
        match self.executor.write_record(record).await {
            Ok(()) => {
                self.executor.count_settled(TaskState::Failure);
                self.broker.ack(delivery.epoch, delivery.delivery_tag);
            }
            Err(store_error) => {
                warn!(task_id = %envelope.id(), %store_error, "result write failed; requeueing");
                self.broker.nack(delivery.epoch, delivery.delivery_tag, true);
            }
        }
    }
}
