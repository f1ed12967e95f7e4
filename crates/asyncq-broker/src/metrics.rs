use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Broker-side Prometheus metrics.
pub struct BrokerMetrics {
    registry: Registry,
    pub published_total: IntCounterVec,
    pub deliveries_total: IntCounterVec,
    pub acked_total: IntCounter,
    pub requeued_total: IntCounter,
    pub dead_lettered_total: IntCounter,
    pub queue_depth: IntGaugeVec,
    pub delayed_depth: IntGaugeVec,
    pub connections: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let published_total = IntCounterVec::new(
            Opts::new("aq_broker_published_total", "Messages accepted for queuing"),
            &["queue"],
        )?;
        registry.register(Box::new(published_total.clone()))?;

        let deliveries_total = IntCounterVec::new(
            Opts::new("aq_broker_deliveries_total", "Messages pushed to consumers"),
            &["queue"],
        )?;
        registry.register(Box::new(deliveries_total.clone()))?;

        let acked_total = IntCounter::new("aq_broker_acked_total", "Deliveries acknowledged")?;
        registry.register(Box::new(acked_total.clone()))?;

        let requeued_total =
            IntCounter::new("aq_broker_requeued_total", "Deliveries returned to their queue")?;
        registry.register(Box::new(requeued_total.clone()))?;

        let dead_lettered_total = IntCounter::new(
            "aq_broker_dead_lettered_total",
            "Deliveries rejected without requeue",
        )?;
        registry.register(Box::new(dead_lettered_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("aq_broker_queue_depth", "Deliverable messages per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let delayed_depth = IntGaugeVec::new(
            Opts::new("aq_broker_delayed_depth", "Messages held back by eta per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(delayed_depth.clone()))?;

        let connections = IntGauge::new("aq_broker_connections", "Open client connections")?;
        registry.register(Box::new(connections.clone()))?;

        Ok(Self {
            registry,
            published_total,
            deliveries_total,
            acked_total,
            requeued_total,
            dead_lettered_total,
            queue_depth,
            delayed_depth,
            connections,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
