use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use asyncq_backend::ResultStore;
use asyncq_core::{ResultMeta, TaskState};

use crate::{ClientError, Result, DEFAULT_POLL_INTERVAL};

/// Read-side handle to one task's result record.
///
/// The first record seen with a status other than PENDING is memoized;
/// later reads return it without touching the store. Memoization is per
/// instance, never shared: two handles for the same id poll
/// independently.
pub struct AsyncResult {
    task_id: Uuid,
    backend: Option<Arc<ResultStore>>,
    cached: Mutex<Option<ResultMeta>>,
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl AsyncResult {
    pub(crate) fn new(task_id: Uuid, backend: Option<Arc<ResultStore>>) -> AsyncResult {
        AsyncResult {
            task_id,
            backend,
            cached: Mutex::new(None),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// The task's record: memoized once non-PENDING, freshly fetched
    /// until then. Absence reads as PENDING.
    pub async fn meta(&self) -> Result<ResultMeta> {
        let mut cached = self.cached.lock().await;
        if let Some(meta) = cached.as_ref() {
            return Ok(meta.clone());
        }
        let backend = self.backend.as_ref().ok_or(ClientError::NoResultBackend)?;
        let meta = backend.fetch(self.task_id).await?;
        if meta.status != TaskState::Pending {
            *cached = Some(meta.clone());
        }
        Ok(meta)
    }

    pub async fn state(&self) -> Result<TaskState> {
        Ok(self.meta().await?.status)
    }

    /// Wait until a record exists and return its result payload, polling
    /// every [`DEFAULT_POLL_INTERVAL`].
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value> {
        self.get_with_interval(timeout, DEFAULT_POLL_INTERVAL).await
    }

    /// Like [`get`], re-reading every `interval` and giving up once more
    /// than `timeout` has elapsed.
    ///
    /// [`get`]: AsyncResult::get
    pub async fn get_with_interval(
        &self,
        timeout: Option<Duration>,
        interval: Duration,
    ) -> Result<Value> {
        let start = Instant::now();
        let mut meta = self.meta().await?;
        while meta.status == TaskState::Pending {
            tokio::time::sleep(interval).await;
            if let Some(limit) = timeout {
                if start.elapsed() > limit {
                    return Err(ClientError::Timeout);
                }
            }
            meta = self.meta().await?;
        }
        Ok(meta.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use asyncq_broker::{Broker, BrokerConfig};

    async fn start_store() -> (Arc<Broker>, Arc<ResultStore>) {
        let broker = Broker::new(BrokerConfig {
            port: 0,
            ..Default::default()
        })
        .unwrap();
        let addr = broker.bind().await.unwrap();
        tokio::spawn(broker.clone().run());
        let store = ResultStore::connect(&addr.to_string()).await.unwrap();
        (broker, Arc::new(store))
    }

    #[tokio::test]
    async fn test_get_times_out_against_missing_record() {
        let (_broker, store) = start_store().await;
        let result = AsyncResult::new(Uuid::new_v4(), Some(store));

        let started = Instant::now();
        let error = result
            .get_with_interval(
                Some(Duration::from_millis(300)),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, ClientError::Timeout));
        assert_eq!(error.to_string(), "the operation timed out");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_meta_memoizes_first_non_pending_record() {
        let (_broker, store) = start_store().await;
        let task_id = Uuid::new_v4();

        let handle = AsyncResult::new(task_id, Some(Arc::clone(&store)));
        assert_eq!(handle.state().await.unwrap(), TaskState::Pending);

        store
            .store(
                task_id,
                &ResultMeta::with_state(task_id, TaskState::Started, json!({"progress": 0.5})),
            )
            .await
            .unwrap();
        assert_eq!(handle.state().await.unwrap(), TaskState::Started);

        store
            .store(task_id, &ResultMeta::success(task_id, json!(42)))
            .await
            .unwrap();

        // The first handle froze at the record it saw; a new one reads
        // the final state.
        assert_eq!(handle.state().await.unwrap(), TaskState::Started);
        let fresh = AsyncResult::new(task_id, Some(store));
        assert_eq!(fresh.state().await.unwrap(), TaskState::Success);
        assert_eq!(fresh.get(None).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_no_backend_errors() {
        let result = AsyncResult::new(Uuid::new_v4(), None);
        let error = result.meta().await.unwrap_err();
        assert!(matches!(error, ClientError::NoResultBackend));
    }
}
