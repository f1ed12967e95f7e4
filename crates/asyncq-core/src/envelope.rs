use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::DEFAULT_QUEUE;

/// A task call as it travels through the broker.
///
/// The JSON layout follows the Celery v2 message protocol: call metadata
/// under `headers`, delivery metadata under `properties`, and the
/// arguments in a three-element `body` array. Envelopes captured from
/// existing deployments decode unchanged, and headers this runtime does
/// not interpret are preserved across a decode/encode round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: EnvelopeHeaders,
    #[serde(default)]
    pub properties: EnvelopeProperties,
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub id: Uuid,
    pub task: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub root_id: Option<Uuid>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub ignore_result: bool,
    /// Headers we do not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeProperties {
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl Default for EnvelopeProperties {
    fn default() -> Self {
        Self {
            routing_key: default_routing_key(),
            priority: None,
        }
    }
}

fn default_routing_key() -> String {
    DEFAULT_QUEUE.to_string()
}

/// `[args, kwargs, options]`, exactly as Celery lays a body out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeBody(
    pub Vec<Value>,
    pub Map<String, Value>,
    pub Map<String, Value>,
);

impl Envelope {
    pub fn new(task: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            headers: EnvelopeHeaders {
                id: Uuid::new_v4(),
                task: task.to_string(),
                retries: 0,
                eta: None,
                expires: None,
                origin: None,
                root_id: None,
                parent_id: None,
                ignore_result: false,
                extra: Map::new(),
            },
            properties: EnvelopeProperties::default(),
            body: EnvelopeBody(args, kwargs, Map::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.headers.id
    }

    pub fn task(&self) -> &str {
        &self.headers.task
    }

    pub fn args(&self) -> &[Value] {
        &self.body.0
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.body.1
    }

    pub fn queue(&self) -> &str {
        &self.properties.routing_key
    }

    /// Whether the expiry deadline has passed as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.headers
            .expires
            .map_or(false, |deadline| deadline <= now)
    }

    /// A copy of this envelope scheduled for another attempt after `delay`.
    ///
    /// The retry counter increases and the eta moves into the future; the
    /// id stays the same, so all attempts share one result record.
    pub fn for_retry(&self, delay: Duration) -> Envelope {
        let mut next = self.clone();
        next.headers.retries += 1;
        let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        next.headers.eta = Utc::now().checked_add_signed(delta);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        let mut kwargs = Map::new();
        kwargs.insert("retries_left".to_string(), json!(2));
        Envelope::new("orders.settle", vec![json!(42), json!("eur")], kwargs)
    }

    #[test]
    fn test_body_is_three_element_array() {
        let value = serde_json::to_value(sample()).unwrap();
        let body = value["body"].as_array().unwrap();
        assert_eq!(body.len(), 3);
        assert_eq!(body[0], json!([42, "eur"]));
        assert_eq!(body[1], json!({"retries_left": 2}));
        assert_eq!(body[2], json!({}));
    }

    #[test]
    fn test_unknown_headers_survive_round_trip() {
        let mut envelope = sample();
        envelope
            .headers
            .extra
            .insert("lang".to_string(), json!("py"));
        envelope
            .headers
            .extra
            .insert("timelimit".to_string(), json!([null, null]));

        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.headers.extra["lang"], json!("py"));
    }

    #[test]
    fn test_missing_required_headers_rejected() {
        let missing_task = json!({
            "headers": {"id": Uuid::new_v4()},
            "body": [[], {}, {}],
        });
        assert!(serde_json::from_value::<Envelope>(missing_task).is_err());

        let missing_id = json!({
            "headers": {"task": "orders.settle"},
            "body": [[], {}, {}],
        });
        assert!(serde_json::from_value::<Envelope>(missing_id).is_err());
    }

    #[test]
    fn test_missing_properties_default_to_celery_queue() {
        let raw = json!({
            "headers": {"id": Uuid::new_v4(), "task": "t"},
            "body": [[], {}, {}],
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.queue(), DEFAULT_QUEUE);
        assert_eq!(envelope.properties.priority, None);
        assert_eq!(envelope.headers.retries, 0);
        assert!(!envelope.headers.ignore_result);
    }

    #[test]
    fn test_for_retry_bumps_counter_and_sets_eta() {
        let envelope = sample();
        let before = Utc::now();
        let next = envelope.for_retry(Duration::from_secs(180));

        assert_eq!(next.headers.id, envelope.headers.id);
        assert_eq!(next.headers.retries, 1);
        let eta = next.headers.eta.unwrap();
        assert!(eta >= before + chrono::Duration::seconds(179));
        assert!(eta <= Utc::now() + chrono::Duration::seconds(181));
    }

    #[test]
    fn test_expiry() {
        let mut envelope = sample();
        let now = Utc::now();
        assert!(!envelope.is_expired(now));

        envelope.headers.expires = Some(now - chrono::Duration::seconds(1));
        assert!(envelope.is_expired(now));

        envelope.headers.expires = Some(now + chrono::Duration::seconds(60));
        assert!(!envelope.is_expired(now));
    }
}
