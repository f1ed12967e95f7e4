use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use asyncq_protocol::message::{KvValueResponse, RevokeRequest};
use asyncq_protocol::{Frame, FrameCodec};

use crate::config::BrokerConfig;
use crate::kv::KvStore;
use crate::metrics::BrokerMetrics;
use crate::queue::{ConsumerHandle, Queue, UnackedDelivery};

/// Per-connection state. Delivery tags are allocated from `next_tag`
/// across every queue the connection consumes, and `unacked` is shared
/// with those queues' consumer handles.
struct Session {
    conn_id: u64,
    outbound: mpsc::Sender<Frame>,
    next_tag: Arc<AtomicU64>,
    unacked: Arc<DashMap<u64, UnackedDelivery>>,
    consuming: Vec<Arc<Queue>>,
}

/// The broker service: owns the queues, the KV store, and the listener.
pub struct Broker {
    config: BrokerConfig,
    queues: DashMap<String, Arc<Queue>>,
    kv: KvStore,
    /// Connections that issued a `Consume`; targets for revoke broadcasts.
    consumers: DashMap<u64, mpsc::Sender<Frame>>,
    metrics: Arc<BrokerMetrics>,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
    next_conn_id: AtomicU64,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            config,
            queues: DashMap::new(),
            kv: KvStore::new(),
            consumers: DashMap::new(),
            metrics: Arc::new(BrokerMetrics::new()?),
            listener: Mutex::new(None),
            shutdown: CancellationToken::new(),
            next_conn_id: AtomicU64::new(1),
        }))
    }

    /// Bind the listen socket without accepting yet, returning the bound
    /// address. Lets callers use port 0 and discover the real port.
    pub async fn bind(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen_addr())
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr()))?;
        let addr = listener.local_addr()?;
        *self.listener.lock() = Some(listener);
        Ok(addr)
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    /// Signal every task to stop; `run` returns shortly after.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let bound = self.listener.lock().take();
        let listener = match bound {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                match self.listener.lock().take() {
                    Some(listener) => listener,
                    None => anyhow::bail!("listener already taken"),
                }
            }
        };
        info!(addr = %listener.local_addr()?, "broker listening");

        tokio::spawn(self.clone().stats_loop());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("broker shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = self.next_conn_id.fetch_add(1, AtomicOrdering::SeqCst);
                        self.metrics.connections.inc();
                        tokio::spawn(self.clone().handle_connection(conn_id, stream, peer));
                    }
                    Err(error) => warn!(%error, "accept failed"),
                },
            }
        }
    }

    async fn stats_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.stats_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for entry in self.queues.iter() {
                        let (ready, delayed) = entry.value().depths();
                        self.metrics
                            .queue_depth
                            .with_label_values(&[entry.key()])
                            .set(ready as i64);
                        self.metrics
                            .delayed_depth
                            .with_label_values(&[entry.key()])
                            .set(delayed as i64);
                    }
                    debug!(queues = self.queues.len(), results = self.kv.len(), "stats refreshed");
                }
            }
        }
    }

    /// Get or create the queue bound to `name`. Idempotent.
    fn declare_queue(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self.queues.get(name) {
            return queue.clone();
        }
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(queue = name, "queue declared");
                Queue::spawn(name, self.metrics.clone(), self.shutdown.child_token())
            })
            .clone()
    }

    async fn handle_connection(self: Arc<Self>, conn_id: u64, stream: TcpStream, peer: SocketAddr) {
        debug!(conn_id, %peer, "connection opened");
        let framed = Framed::new(stream, FrameCodec);
        let (mut sink, mut frames) = framed.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(64);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let mut session = Session {
            conn_id,
            outbound,
            next_tag: Arc::new(AtomicU64::new(1)),
            unacked: Arc::new(DashMap::new()),
            consuming: Vec::new(),
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = frames.next() => match frame {
                    None => break,
                    Some(Err(error)) => {
                        warn!(conn_id, %error, "protocol error; closing connection");
                        break;
                    }
                    Some(Ok(frame)) => self.handle_frame(&mut session, frame).await,
                },
            }
        }

        self.cleanup_session(&session);
        debug!(conn_id, "connection closed");
    }

    fn cleanup_session(&self, session: &Session) {
        for queue in &session.consuming {
            queue.deregister_consumer(session.conn_id);
        }
        self.consumers.remove(&session.conn_id);

        let tags: Vec<u64> = session.unacked.iter().map(|entry| *entry.key()).collect();
        let requeued = tags.len();
        for tag in tags {
            if let Some((_, entry)) = session.unacked.remove(&tag) {
                entry.settle_disconnect();
                self.metrics.requeued_total.inc();
            }
        }
        if requeued > 0 {
            info!(conn_id = session.conn_id, requeued, "requeued unacknowledged deliveries");
        }
        self.metrics.connections.dec();
    }

    async fn handle_frame(&self, session: &mut Session, frame: Frame) {
        let reply = match frame {
            Frame::Declare(request) => {
                self.declare_queue(&request.queue);
                Some(Frame::ok())
            }
            Frame::Consume(request) => {
                let queue = self.declare_queue(&request.queue);
                queue.register_consumer(ConsumerHandle {
                    conn_id: session.conn_id,
                    prefetch: request.prefetch,
                    outstanding: Arc::new(AtomicU64::new(0)),
                    next_tag: session.next_tag.clone(),
                    outbound: session.outbound.clone(),
                    unacked: session.unacked.clone(),
                });
                session.consuming.push(queue);
                self.consumers
                    .insert(session.conn_id, session.outbound.clone());
                info!(
                    conn_id = session.conn_id,
                    queue = %request.queue,
                    prefetch = request.prefetch,
                    "consumer registered"
                );
                Some(Frame::ok())
            }
            Frame::Publish(request) => {
                let queue = self.declare_queue(&request.routing_key);
                self.metrics
                    .published_total
                    .with_label_values(&[&request.routing_key])
                    .inc();
                queue.publish(request.payload, request.priority, request.eta);
                Some(Frame::ok())
            }
            Frame::Ack(request) => {
                match session.unacked.remove(&request.delivery_tag) {
                    Some((_, entry)) => {
                        entry.settle_ack();
                        self.metrics.acked_total.inc();
                    }
                    None => debug!(
                        conn_id = session.conn_id,
                        tag = request.delivery_tag,
                        "ack for unknown delivery tag"
                    ),
                }
                None
            }
            Frame::Nack(request) => {
                if let Some((_, entry)) = session.unacked.remove(&request.delivery_tag) {
                    if request.requeue {
                        self.metrics.requeued_total.inc();
                    } else {
                        self.metrics.dead_lettered_total.inc();
                        warn!(
                            conn_id = session.conn_id,
                            tag = request.delivery_tag,
                            "delivery dead-lettered"
                        );
                    }
                    entry.settle_nack(request.requeue);
                }
                None
            }
            Frame::Revoke(request) => {
                self.broadcast_revoke(request.task_id).await;
                Some(Frame::ok())
            }
            Frame::KvSet(request) => {
                self.kv.set(request.key, request.value);
                Some(Frame::ok())
            }
            Frame::KvGet(request) => Some(Frame::KvValue(KvValueResponse {
                value: self.kv.get(&request.key),
            })),
            unexpected => {
                warn!(
                    conn_id = session.conn_id,
                    frame = ?unexpected.frame_type(),
                    "unexpected frame from client"
                );
                Some(Frame::error("unexpected frame"))
            }
        };

        if let Some(reply) = reply {
            let _ = session.outbound.send(reply).await;
        }
    }

    /// Push the revocation to every consuming connection; each worker
    /// drops or cancels the task locally.
    async fn broadcast_revoke(&self, task_id: Uuid) {
        let targets: Vec<(u64, mpsc::Sender<Frame>)> = self
            .consumers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        info!(%task_id, consumers = targets.len(), "broadcasting revoke");
        for (conn_id, outbound) in targets {
            if outbound
                .send(Frame::Revoke(RevokeRequest { task_id }))
                .await
                .is_err()
            {
                self.consumers.remove(&conn_id);
            }
        }
    }
}
