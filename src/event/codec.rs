use serde_json::Value;

use super::{EventEnvelope, EventKey, EventMessage};
use crate::Error;
use crate::broker::ConsumerRecord;

/// Turns a raw log record into a domain-agnostic envelope.
///
/// Implementations that depend on remote state (a schema registry, a key
/// service) should report lookups that may succeed later as
/// [`Error::TransientInfra`]; the consumer runtime retries those.
pub trait Decoder: Send + Sync {
    fn decode(&self, record: &ConsumerRecord) -> Result<EventEnvelope<Value>, Error>;
}

/// Decodes JSON keys and values as written by [`EventEnvelope::encode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, record: &ConsumerRecord) -> Result<EventEnvelope<Value>, Error> {
        let key: EventKey = serde_json::from_slice(&record.key)?;
        let value = match &record.value {
            None => None,
            Some(bytes) => Some(serde_json::from_slice::<EventMessage<Value>>(bytes)?),
        };
        Ok(EventEnvelope { key, value })
    }
}
