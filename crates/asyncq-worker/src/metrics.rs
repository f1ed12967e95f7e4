use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Worker-side counters and gauges, rendered in Prometheus text format.
pub struct WorkerMetrics {
    registry: Registry,
    pub tasks_total: IntCounterVec,
    pub decode_errors_total: IntCounter,
    pub reconnects_total: IntCounter,
    pub inflight_tasks: IntGauge,
}

impl WorkerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new("aq_worker_tasks_total", "Tasks settled, by final state"),
            &["state"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let decode_errors_total = IntCounter::new(
            "aq_worker_decode_errors_total",
            "Deliveries dropped because the payload failed to decode",
        )?;
        registry.register(Box::new(decode_errors_total.clone()))?;

        let reconnects_total = IntCounter::new(
            "aq_worker_reconnects_total",
            "Times the broker connection was re-established",
        )?;
        registry.register(Box::new(reconnects_total.clone()))?;

        let inflight_tasks = IntGauge::new(
            "aq_worker_inflight_tasks",
            "Tasks currently executing",
        )?;
        registry.register(Box::new(inflight_tasks.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            decode_errors_total,
            reconnects_total,
            inflight_tasks,
        })
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
