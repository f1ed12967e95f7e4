//! Worker assembly and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use asyncq_backend::ResultStore;

use crate::config::{validate_concurrency, WorkerConfig};
use crate::connection::{BrokerHandle, ConnectionSettings};
use crate::dispatcher::Dispatcher;
use crate::executor::Executor;
use crate::metrics::WorkerMetrics;
use crate::registry::{TaskHandler, TaskOptions, TaskRegistry};
use crate::revocation::{InflightRegistry, RevocationRegistry};

/// One worker process: a broker connection, a dispatch loop, and a
/// bounded pool of executors. Register handlers, then call [`run`].
///
/// [`run`]: Worker::run
pub struct Worker {
    config: WorkerConfig,
    registry: Arc<TaskRegistry>,
    metrics: Arc<WorkerMetrics>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        validate_concurrency(config.concurrency as i64).map_err(|message| anyhow!(message))?;
        Ok(Self {
            config,
            registry: Arc::new(TaskRegistry::new()),
            metrics: Arc::new(WorkerMetrics::new()?),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn register(&self, name: &str, options: TaskOptions, handler: Arc<dyn TaskHandler>) {
        self.registry.register(name, options, handler);
    }

    /// Token that stops the worker when cancelled. Cloneable; hand it to
    /// a signal handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Connect and serve deliveries until the shutdown token fires, then
    /// wait up to the grace period for in-flight tasks to settle.
    pub async fn run(self) -> Result<()> {
        let node = self.config.node_name();
        info!(
            node,
            broker = %self.config.broker_addr,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            tasks = ?self.registry.names(),
            "worker starting"
        );
        if self.registry.is_empty() {
            warn!("no tasks registered; every delivery will fail as unknown");
        }

        let backend = match &self.config.result_backend_addr {
            Some(addr) => {
                let store = ResultStore::connect(addr)
                    .await
                    .with_context(|| format!("connecting result store at {addr}"))?;
                Some(Arc::new(store))
            }
            None => {
                warn!("no result backend configured; results will not be stored");
                None
            }
        };

        let revocations = Arc::new(RevocationRegistry::new());
        let inflight = Arc::new(InflightRegistry::new());

        let settings = ConnectionSettings {
            broker_addr: self.config.broker_addr.clone(),
            queues: self.config.queues.clone(),
            prefetch: self.config.effective_prefetch(),
            reconnect_initial_ms: self.config.reconnect_initial_ms,
            reconnect_max_ms: self.config.reconnect_max_ms,
        };
        let (broker, deliveries) = BrokerHandle::connect(
            settings,
            Arc::clone(&revocations),
            Arc::clone(&inflight),
            Arc::clone(&self.metrics),
            self.shutdown.clone(),
        )
        .await
        .context("connecting to broker")?;

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency as usize));
        let executor = Arc::new(Executor {
            broker: broker.clone(),
            backend,
            revocations: Arc::clone(&revocations),
            inflight: Arc::clone(&inflight),
            metrics: Arc::clone(&self.metrics),
        });
        let dispatcher = Dispatcher {
            registry: Arc::clone(&self.registry),
            revocations,
            broker,
            executor,
            semaphore: Arc::clone(&semaphore),
            shutdown: self.shutdown.clone(),
        };

        dispatcher.run(deliveries).await;

        // Executors hold permits until they settle; owning every permit
        // again means the pool has drained.
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        info!(node, "draining in-flight tasks");
        match tokio::time::timeout(
            grace,
            semaphore.acquire_many(self.config.concurrency as u32),
        )
        .await
        {
            Ok(Ok(_permits)) => info!(node, "worker stopped"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                node,
                grace_secs = self.config.shutdown_grace_secs,
                "shutdown grace expired with tasks still running"
            ),
        }
        Ok(())
    }
}
