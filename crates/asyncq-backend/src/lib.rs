//! Result store client.
//!
//! Records live in the broker's key/value facility under
//! `celery-task-meta-{task_id}`. Writes overwrite whole records; a
//! missing record reads as PENDING. No retries happen here: callers
//! decide what an unavailable store means for acknowledgment.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

use asyncq_core::{ResultMeta, TaskError};
use asyncq_protocol::message::{KvGetRequest, KvSetRequest};
use asyncq_protocol::{Frame, FrameCodec};

type Transport = Framed<TcpStream, FrameCodec>;

/// Connection to the result store.
///
/// One connection is shared behind a mutex; traffic is strictly
/// request/reply, so no correlation state is needed. A failed request
/// drops the connection and the next call reconnects.
pub struct ResultStore {
    addr: String,
    conn: Mutex<Option<Transport>>,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl ResultStore {
    /// Connect eagerly so configuration problems surface at startup.
    pub async fn connect(addr: &str) -> Result<Self, TaskError> {
        let transport = Self::open(addr).await?;
        debug!(addr, "result store connected");
        Ok(Self {
            addr: addr.to_string(),
            conn: Mutex::new(Some(transport)),
        })
    }

    /// Write `meta` under the task's result key, overwriting any previous
    /// record.
    pub async fn store(&self, task_id: Uuid, meta: &ResultMeta) -> Result<(), TaskError> {
        let value = serde_json::to_string(meta)
            .map_err(|e| TaskError::ResultStoreUnavailable(format!("encode record: {e}")))?;
        let request = Frame::KvSet(KvSetRequest {
            key: ResultMeta::key_for(task_id),
            value,
        });
        match self.request(request).await? {
            Frame::Ok(_) => Ok(()),
            Frame::Error(reply) => Err(TaskError::ResultStoreUnavailable(reply.message)),
            other => Err(TaskError::ResultStoreUnavailable(format!(
                "unexpected reply: {:?}",
                other.frame_type()
            ))),
        }
    }

    /// Fetch the record for `task_id`. Absence reads as the PENDING
    /// sentinel, never as an error.
    pub async fn fetch(&self, task_id: Uuid) -> Result<ResultMeta, TaskError> {
        let request = Frame::KvGet(KvGetRequest {
            key: ResultMeta::key_for(task_id),
        });
        match self.request(request).await? {
            Frame::KvValue(reply) => match reply.value {
                None => Ok(ResultMeta::pending()),
                Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                    TaskError::ResultStoreUnavailable(format!("malformed record: {e}"))
                }),
            },
            Frame::Error(reply) => Err(TaskError::ResultStoreUnavailable(reply.message)),
            other => Err(TaskError::ResultStoreUnavailable(format!(
                "unexpected reply: {:?}",
                other.frame_type()
            ))),
        }
    }

    async fn open(addr: &str) -> Result<Transport, TaskError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TaskError::ResultStoreUnavailable(format!("connect {addr}: {e}")))?;
        Ok(Framed::new(stream, FrameCodec))
    }

    async fn request(&self, frame: Frame) -> Result<Frame, TaskError> {
        let mut guard = self.conn.lock().await;
        let mut transport = match guard.take() {
            Some(transport) => transport,
            None => Self::open(&self.addr).await?,
        };
        match Self::exchange(&mut transport, frame).await {
            Ok(reply) => {
                *guard = Some(transport);
                Ok(reply)
            }
            Err(error) => {
                // Leave the slot empty; the next request reconnects.
                warn!(%error, "result store request failed");
                Err(error)
            }
        }
    }

    async fn exchange(transport: &mut Transport, frame: Frame) -> Result<Frame, TaskError> {
        transport
            .send(frame)
            .await
            .map_err(|e| TaskError::ResultStoreUnavailable(e.to_string()))?;
        match transport.next().await {
            None => Err(TaskError::ResultStoreUnavailable(
                "connection closed".to_string(),
            )),
            Some(Err(e)) => Err(TaskError::ResultStoreUnavailable(e.to_string())),
            Some(Ok(reply)) => Ok(reply),
        }
    }
}
