//! The asyncq broker: in-memory priority queues behind the framed TCP
//! protocol, plus the key/value facility that backs result records.

pub mod broker;
pub mod config;
pub mod kv;
pub mod metrics;
pub mod queue;

pub use broker::Broker;
pub use config::BrokerConfig;
