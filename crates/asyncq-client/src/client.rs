use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::debug;
use uuid::Uuid;

use asyncq_backend::ResultStore;
use asyncq_core::{Envelope, MAX_PRIORITY};
use asyncq_protocol::message::{DeclareRequest, PublishRequest, RevokeRequest};
use asyncq_protocol::{Frame, FrameCodec};

use crate::result::AsyncResult;
use crate::{ClientError, Result};

type Transport = Framed<TcpStream, FrameCodec>;

/// Options for one `send_task` call. Start from `Default` and chain what
/// differs.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub queue: Option<String>,
    pub countdown: Option<Duration>,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
    pub task_id: Option<Uuid>,
    pub ignore_result: bool,
}

impl SendOptions {
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Hold the task back for `countdown` before it becomes runnable.
    /// An explicit `eta` takes precedence.
    pub fn countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// After this instant the task is dropped instead of executed.
    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// 0 (lowest, default) through 9 (highest); larger values are capped.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.min(MAX_PRIORITY));
        self
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn task_id(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn ignore_result(mut self) -> Self {
        self.ignore_result = true;
        self
    }
}

struct ClientConn {
    transport: Transport,
    /// Queues declared on this connection; re-declaring is harmless but
    /// a round trip.
    declared: HashSet<String>,
}

/// Producer handle: publishes task calls to the broker and reads results
/// from the store.
///
/// One broker connection is shared behind a mutex, request/reply only.
/// A failed request drops the connection; the next call reconnects.
pub struct Client {
    broker_addr: String,
    origin: String,
    conn: Mutex<Option<ClientConn>>,
    backend: Option<Arc<ResultStore>>,
}

impl Client {
    /// Connect to the broker only. Tasks can be sent and revoked, but
    /// reading results back requires [`connect_with_backend`].
    ///
    /// [`connect_with_backend`]: Client::connect_with_backend
    pub async fn connect(broker_addr: &str) -> Result<Client> {
        Self::new(broker_addr, None).await
    }

    /// Connect to the broker and the result store.
    pub async fn connect_with_backend(broker_addr: &str, backend_addr: &str) -> Result<Client> {
        let backend = ResultStore::connect(backend_addr).await?;
        Self::new(broker_addr, Some(Arc::new(backend))).await
    }

    async fn new(broker_addr: &str, backend: Option<Arc<ResultStore>>) -> Result<Client> {
        let transport = Self::open(broker_addr).await?;
        Ok(Client {
            broker_addr: broker_addr.to_string(),
            origin: origin(),
            conn: Mutex::new(Some(ClientConn {
                transport,
                declared: HashSet::new(),
            })),
            backend,
        })
    }

    /// Publish a task call and return a handle to its result.
    pub async fn send_task(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: SendOptions,
    ) -> Result<AsyncResult> {
        let envelope = self.build_envelope(name, args, kwargs, &options);
        let task_id = envelope.id();
        let queue = envelope.queue().to_string();
        let payload = asyncq_protocol::envelope::encode(&envelope)?;

        let mut guard = self.conn.lock().await;
        let mut conn = self.checkout(guard.take()).await?;
        if !conn.declared.contains(&queue) {
            let declare = Frame::Declare(DeclareRequest {
                queue: queue.clone(),
                durable: true,
            });
            Self::exchange(&mut conn.transport, declare).await?;
            conn.declared.insert(queue.clone());
        }
        let publish = Frame::Publish(PublishRequest {
            routing_key: queue.clone(),
            priority: envelope.properties.priority.unwrap_or(0),
            eta: envelope.headers.eta,
            payload: payload.to_vec(),
        });
        Self::exchange(&mut conn.transport, publish).await?;
        *guard = Some(conn);

        debug!(%task_id, task = name, queue = %queue, "task sent");
        Ok(AsyncResult::new(task_id, self.backend.clone()))
    }

    /// Ask every consumer to drop `task_id`. Idempotent: double revokes
    /// and unknown ids are accepted.
    pub async fn revoke(&self, task_id: Uuid) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let mut conn = self.checkout(guard.take()).await?;
        Self::exchange(&mut conn.transport, Frame::Revoke(RevokeRequest { task_id })).await?;
        *guard = Some(conn);
        debug!(%task_id, "task revoked");
        Ok(())
    }

    /// Handle to an existing task's result. Fails without a backend.
    pub fn result_for(&self, task_id: Uuid) -> Result<AsyncResult> {
        match &self.backend {
            Some(backend) => Ok(AsyncResult::new(task_id, Some(Arc::clone(backend)))),
            None => Err(ClientError::NoResultBackend),
        }
    }

    fn build_envelope(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: &SendOptions,
    ) -> Envelope {
        let mut envelope = Envelope::new(name, args, kwargs);
        if let Some(task_id) = options.task_id {
            envelope.headers.id = task_id;
        }
        envelope.headers.origin = Some(self.origin.clone());
        envelope.headers.ignore_result = options.ignore_result;
        envelope.headers.expires = options.expires;
        envelope.headers.eta = match (options.eta, options.countdown) {
            (Some(eta), _) => Some(eta),
            (None, Some(countdown)) => {
                let delta =
                    chrono::Duration::from_std(countdown).unwrap_or(chrono::Duration::MAX);
                Utc::now().checked_add_signed(delta)
            }
            (None, None) => None,
        };
        if let Some(queue) = &options.queue {
            envelope.properties.routing_key = queue.clone();
        }
        envelope.properties.priority = options.priority;
        envelope
    }

    /// Reuse the pooled connection or open a fresh one. Callers put the
    /// connection back only after their exchange succeeds, so an error
    /// leaves the slot empty and the next call reconnects.
    async fn checkout(&self, pooled: Option<ClientConn>) -> Result<ClientConn> {
        match pooled {
            Some(conn) => Ok(conn),
            None => Ok(ClientConn {
                transport: Self::open(&self.broker_addr).await?,
                declared: HashSet::new(),
            }),
        }
    }

    async fn open(addr: &str) -> Result<Transport> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connection(format!("connect {addr}: {e}")))?;
        Ok(Framed::new(stream, FrameCodec))
    }

    async fn exchange(transport: &mut Transport, frame: Frame) -> Result<()> {
        transport
            .send(frame)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        match transport.next().await {
            Some(Ok(Frame::Ok(_))) => Ok(()),
            Some(Ok(Frame::Error(reply))) => Err(ClientError::Broker(reply.message)),
            Some(Ok(other)) => Err(ClientError::Broker(format!(
                "unexpected reply: {:?}",
                other.frame_type()
            ))),
            Some(Err(e)) => Err(ClientError::Connection(e.to_string())),
            None => Err(ClientError::Connection("connection closed".to_string())),
        }
    }
}

/// `gen{pid}@{host}`, the envelope origin stamp.
fn origin() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("gen{}@{host}", std::process::id())
}
