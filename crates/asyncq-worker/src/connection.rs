//! Broker connection actor.
//!
//! One task owns the TCP connection. Deliveries flow out through a
//! bounded channel sized to the consume windows, so the actor never
//! waits on a saturated dispatcher and revocations keep arriving while
//! every execution slot is busy. Acks, nacks, and publishes come in
//! over a command channel; publishes are answered in submission order.
//!
//! Each established connection gets an epoch. Delivery tags only mean
//! something on the connection that issued them, so acks and nacks
//! stamped with an older epoch are dropped: the broker already requeued
//! those messages when the connection died.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use asyncq_core::TaskError;
use asyncq_protocol::message::{
    AckRequest, ConsumeRequest, DeclareRequest, NackRequest, PublishRequest,
};
use asyncq_protocol::{Frame, FrameCodec};

use crate::metrics::WorkerMetrics;
use crate::revocation::{InflightRegistry, RevocationRegistry};

type Transport = Framed<TcpStream, FrameCodec>;

/// One message handed to the dispatcher, stamped with the connection
/// epoch it arrived on.
#[derive(Debug)]
pub struct TaskDelivery {
    pub epoch: u64,
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub payload: Vec<u8>,
}

enum Command {
    Publish {
        request: PublishRequest,
        reply: oneshot::Sender<Result<(), TaskError>>,
    },
    Ack {
        epoch: u64,
        delivery_tag: u64,
    },
    Nack {
        epoch: u64,
        delivery_tag: u64,
        requeue: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub broker_addr: String,
    pub queues: Vec<String>,
    pub prefetch: u16,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

/// Cheap cloneable handle to the connection actor.
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl BrokerHandle {
    /// Connect, declare and consume the configured queues, and spawn the
    /// actor. The first connection is made eagerly so a bad address fails
    /// at startup; later reconnects happen inside the actor with backoff.
    pub async fn connect(
        settings: ConnectionSettings,
        revocations: Arc<RevocationRegistry>,
        inflight: Arc<InflightRegistry>,
        metrics: Arc<WorkerMetrics>,
        shutdown: CancellationToken,
    ) -> Result<(BrokerHandle, mpsc::Receiver<TaskDelivery>), TaskError> {
        // Room for every consume window plus slack: the broker never has
        // more than `prefetch` unacked deliveries per queue in flight.
        let capacity = settings.queues.len().max(1) * settings.prefetch.max(1) as usize + 16;
        let (delivery_tx, delivery_rx) = mpsc::channel(capacity);

        let epoch = 1;
        let transport =
            ConnectionActor::establish(&settings, epoch, &delivery_tx, &revocations, &inflight)
                .await?;
        info!(addr = %settings.broker_addr, queues = ?settings.queues, "connected to broker");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor {
            settings,
            epoch,
            commands: command_rx,
            deliveries: delivery_tx,
            revocations,
            inflight,
            metrics,
            shutdown,
        };
        tokio::spawn(actor.run(transport));

        Ok((BrokerHandle { commands: command_tx }, delivery_rx))
    }

    /// Publish and wait for the broker's reply.
    pub async fn publish(&self, request: PublishRequest) -> Result<(), TaskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                request,
                reply: reply_tx,
            })
            .map_err(|_| TaskError::BrokerConnectivity("connection actor stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| TaskError::BrokerConnectivity("publish reply dropped".to_string()))?
    }

    /// Fire-and-forget; dropped if `epoch` is no longer current.
    pub fn ack(&self, epoch: u64, delivery_tag: u64) {
        let _ = self.commands.send(Command::Ack {
            epoch,
            delivery_tag,
        });
    }

    /// Fire-and-forget; dropped if `epoch` is no longer current.
    pub fn nack(&self, epoch: u64, delivery_tag: u64, requeue: bool) {
        let _ = self.commands.send(Command::Nack {
            epoch,
            delivery_tag,
            requeue,
        });
    }
}

enum Served {
    Shutdown,
    ConnectionLost,
}

struct ConnectionActor {
    settings: ConnectionSettings,
    epoch: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    deliveries: mpsc::Sender<TaskDelivery>,
    revocations: Arc<RevocationRegistry>,
    inflight: Arc<InflightRegistry>,
    metrics: Arc<WorkerMetrics>,
    shutdown: CancellationToken,
}

impl ConnectionActor {
    async fn run(mut self, mut transport: Transport) {
        loop {
            match self.serve(&mut transport).await {
                Served::Shutdown => {
                    debug!("connection actor stopping");
                    return;
                }
                Served::ConnectionLost => {}
            }
            match self.reconnect().await {
                Some(next) => transport = next,
                None => return,
            }
        }
    }

    /// Open a connection and bring it to the consuming state.
    async fn establish(
        settings: &ConnectionSettings,
        epoch: u64,
        deliveries: &mpsc::Sender<TaskDelivery>,
        revocations: &RevocationRegistry,
        inflight: &InflightRegistry,
    ) -> Result<Transport, TaskError> {
        let stream = TcpStream::connect(&settings.broker_addr)
            .await
            .map_err(|e| {
                TaskError::BrokerConnectivity(format!("connect {}: {e}", settings.broker_addr))
            })?;
        let mut transport = Framed::new(stream, FrameCodec);

        for queue in &settings.queues {
            transport
                .send(Frame::Declare(DeclareRequest {
                    queue: queue.clone(),
                    durable: true,
                }))
                .await
                .map_err(|e| TaskError::BrokerConnectivity(e.to_string()))?;
            Self::await_ok(&mut transport, epoch, deliveries, revocations, inflight).await?;
        }
        for queue in &settings.queues {
            transport
                .send(Frame::Consume(ConsumeRequest {
                    queue: queue.clone(),
                    prefetch: settings.prefetch,
                }))
                .await
                .map_err(|e| TaskError::BrokerConnectivity(e.to_string()))?;
            Self::await_ok(&mut transport, epoch, deliveries, revocations, inflight).await?;
        }
        Ok(transport)
    }

    /// Read until the pending request is answered. Deliveries and
    /// revocations can arrive out-of-band once the first consume is
    /// active, so they are handled here too rather than dropped.
    async fn await_ok(
        transport: &mut Transport,
        epoch: u64,
        deliveries: &mpsc::Sender<TaskDelivery>,
        revocations: &RevocationRegistry,
        inflight: &InflightRegistry,
    ) -> Result<(), TaskError> {
        loop {
            match transport.next().await {
                Some(Ok(Frame::Ok(_))) => return Ok(()),
                Some(Ok(Frame::Error(reply))) => {
                    return Err(TaskError::BrokerConnectivity(reply.message));
                }
                Some(Ok(Frame::Deliver(delivery))) => {
                    let _ = deliveries
                        .send(TaskDelivery {
                            epoch,
                            queue: delivery.queue,
                            delivery_tag: delivery.delivery_tag,
                            redelivered: delivery.redelivered,
                            payload: delivery.payload,
                        })
                        .await;
                }
                Some(Ok(Frame::Revoke(revoke))) => {
                    revocations.revoke(revoke.task_id);
                    inflight.cancel(&revoke.task_id);
                }
                Some(Ok(other)) => {
                    return Err(TaskError::BrokerConnectivity(format!(
                        "unexpected reply: {:?}",
                        other.frame_type()
                    )));
                }
                Some(Err(e)) => return Err(TaskError::BrokerConnectivity(e.to_string())),
                None => {
                    return Err(TaskError::BrokerConnectivity(
                        "connection closed during setup".to_string(),
                    ));
                }
            }
        }
    }

    async fn serve(&mut self, transport: &mut Transport) -> Served {
        let mut pending_publishes: VecDeque<oneshot::Sender<Result<(), TaskError>>> =
            VecDeque::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    Self::fail_pending(&mut pending_publishes, "worker shutting down");
                    return Served::Shutdown;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Publish { request, reply }) => {
                        match transport.send(Frame::Publish(request)).await {
                            Ok(()) => pending_publishes.push_back(reply),
                            Err(e) => {
                                let _ = reply.send(Err(TaskError::BrokerConnectivity(
                                    e.to_string(),
                                )));
                                Self::fail_pending(&mut pending_publishes, "connection lost");
                                return Served::ConnectionLost;
                            }
                        }
                    }
                    Some(Command::Ack { epoch, delivery_tag }) => {
                        if epoch != self.epoch {
                            debug!(delivery_tag, "dropping ack from a previous connection");
                            continue;
                        }
                        let frame = Frame::Ack(AckRequest { delivery_tag });
                        if transport.send(frame).await.is_err() {
                            Self::fail_pending(&mut pending_publishes, "connection lost");
                            return Served::ConnectionLost;
                        }
                    }
                    Some(Command::Nack { epoch, delivery_tag, requeue }) => {
                        if epoch != self.epoch {
                            debug!(delivery_tag, "dropping nack from a previous connection");
                            continue;
                        }
                        let frame = Frame::Nack(NackRequest { delivery_tag, requeue });
                        if transport.send(frame).await.is_err() {
                            Self::fail_pending(&mut pending_publishes, "connection lost");
                            return Served::ConnectionLost;
                        }
                    }
                    None => {
                        Self::fail_pending(&mut pending_publishes, "worker shutting down");
                        return Served::Shutdown;
                    }
                },
                frame = transport.next() => match frame {
                    Some(Ok(Frame::Deliver(delivery))) => {
                        let stamped = TaskDelivery {
                            epoch: self.epoch,
                            queue: delivery.queue,
                            delivery_tag: delivery.delivery_tag,
                            redelivered: delivery.redelivered,
                            payload: delivery.payload,
                        };
                        if self.deliveries.send(stamped).await.is_err() {
                            return Served::Shutdown;
                        }
                    }
                    Some(Ok(Frame::Revoke(revoke))) => {
                        self.revocations.revoke(revoke.task_id);
                        if self.inflight.cancel(&revoke.task_id) {
                            info!(task_id = %revoke.task_id, "cancelled in-flight task");
                        }
                    }
                    Some(Ok(Frame::Ok(_))) => match pending_publishes.pop_front() {
                        Some(reply) => {
                            let _ = reply.send(Ok(()));
                        }
                        None => warn!("unsolicited OK from broker"),
                    },
                    Some(Ok(Frame::Error(reply))) => match pending_publishes.pop_front() {
                        Some(waiter) => {
                            let _ = waiter.send(Err(TaskError::BrokerConnectivity(
                                reply.message,
                            )));
                        }
                        None => warn!(message = %reply.message, "broker error outside a request"),
                    },
                    Some(Ok(other)) => {
                        warn!(frame = ?other.frame_type(), "unexpected frame from broker");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "broker connection error");
                        Self::fail_pending(&mut pending_publishes, "connection lost");
                        return Served::ConnectionLost;
                    }
                    None => {
                        Self::fail_pending(&mut pending_publishes, "connection closed");
                        return Served::ConnectionLost;
                    }
                },
            }
        }
    }

    /// Retry with doubling, jittered waits until a connection sticks.
    /// Returns None if shutdown fires first.
    async fn reconnect(&mut self) -> Option<Transport> {
        let max_wait = Duration::from_millis(self.settings.reconnect_max_ms);
        let mut wait = Duration::from_millis(self.settings.reconnect_initial_ms).min(max_wait);
        loop {
            warn!(wait_ms = wait.as_millis() as u64, "broker connection lost; retrying");
            if self.pause(jittered(wait)).await {
                return None;
            }
            let next_epoch = self.epoch + 1;
            match Self::establish(
                &self.settings,
                next_epoch,
                &self.deliveries,
                &self.revocations,
                &self.inflight,
            )
            .await
            {
                Ok(transport) => {
                    self.epoch = next_epoch;
                    self.metrics.reconnects_total.inc();
                    info!(addr = %self.settings.broker_addr, "broker connection re-established");
                    return Some(transport);
                }
                Err(error) => {
                    debug!(%error, "reconnect attempt failed");
                    wait = (wait * 2).min(max_wait);
                }
            }
        }
    }

    /// Sleep while keeping the command channel drained: publishes fail
    /// fast instead of queueing against a dead connection, and stale
    /// acks are discarded. Returns true if shutdown fired.
    async fn pause(&mut self, wait: Duration) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return true,
                _ = &mut sleep => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Publish { reply, .. }) => {
                        let _ = reply.send(Err(TaskError::BrokerConnectivity(
                            "not connected".to_string(),
                        )));
                    }
                    Some(_) => {}
                    None => return true,
                },
            }
        }
    }

    fn fail_pending(
        pending: &mut VecDeque<oneshot::Sender<Result<(), TaskError>>>,
        reason: &str,
    ) {
        for reply in pending.drain(..) {
            let _ = reply.send(Err(TaskError::BrokerConnectivity(reason.to_string())));
        }
    }
}

fn jittered(wait: Duration) -> Duration {
    wait.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}
