use bytes::Bytes;

use asyncq_core::{Envelope, TaskError};

/// Serialize an envelope to its JSON wire form.
pub fn encode(envelope: &Envelope) -> Result<Bytes, TaskError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| TaskError::MalformedEnvelope(format!("encode: {e}")))
}

/// Decode and validate an envelope from broker payload bytes.
///
/// Unparseable JSON, a missing `id` or `task`, or a body that is not
/// `[args, kwargs, options]` all map to [`TaskError::MalformedEnvelope`],
/// which callers dead-letter rather than requeue.
pub fn decode(payload: &[u8]) -> Result<Envelope, TaskError> {
    let envelope: Envelope =
        serde_json::from_slice(payload).map_err(|e| TaskError::MalformedEnvelope(e.to_string()))?;

    if envelope.headers.task.is_empty() {
        return Err(TaskError::MalformedEnvelope("empty task name".to_string()));
    }

    Ok(envelope)
}
