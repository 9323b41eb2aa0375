//! Event envelopes: the immutable record of one successful state transition.
//!
//! An envelope is a key plus an optional message. The key names the aggregate
//! (type, identifier, version) and the root context used for partitioning; the
//! message carries the event name, the aggregate state *at the new version* and
//! auditing information. An envelope without a message is a **tombstone**: the
//! log's way of saying "this identifier no longer exists".
//!
//! ```rust
//! use klio::{AggregateIdentifier, AggregateType, AggregateVersion, EventEnvelope, EventKey,
//!     RootContextIdentifier};
//! use uuid::Uuid;
//!
//! let key = EventKey::new(
//!     AggregateIdentifier::new(
//!         AggregateType::try_new("USER").unwrap(),
//!         Uuid::new_v4(),
//!         AggregateVersion::new(3),
//!     ),
//!     RootContextIdentifier::new(),
//! );
//! let tombstone: EventEnvelope<()> = EventEnvelope::tombstone(key);
//! assert!(tombstone.is_tombstone());
//! ```

mod codec;

pub use codec::{Decoder, JsonDecoder};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::{Actor, AggregateIdentifier, AggregateType, AggregateVersion, Error, RootContextIdentifier};

/// State carried through envelopes and snapshots.
///
/// Implemented automatically for every type with the required bounds; the
/// coordination layer never looks inside a payload except to compare it for
/// equality (no-op detection) and to serialize it.
pub trait Payload:
    Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Payload for T where
    T: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// The kind of transition an event records.
///
/// `Other` carries domain-specific names such as `REGISTERED`; consumers match
/// exhaustively and decide per name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventName {
    Created,
    Updated,
    Deleted,
    Other(String),
}

impl From<String> for EventName {
    fn from(value: String) -> Self {
        let value = value.to_uppercase();
        match value.as_str() {
            "CREATED" => EventName::Created,
            "UPDATED" => EventName::Updated,
            "DELETED" => EventName::Deleted,
            _ => EventName::Other(value),
        }
    }
}

impl From<&str> for EventName {
    fn from(value: &str) -> Self {
        EventName::from(value.to_string())
    }
}

impl From<EventName> for String {
    fn from(value: EventName) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventName::Created => write!(f, "CREATED"),
            EventName::Updated => write!(f, "UPDATED"),
            EventName::Deleted => write!(f, "DELETED"),
            EventName::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Who created and last modified an aggregate, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditingInformation {
    pub created_by: Actor,
    pub created_date: DateTime<Utc>,
    pub last_modified_by: Actor,
    pub last_modified_date: DateTime<Utc>,
}

impl AuditingInformation {
    pub fn created(actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            created_by: actor,
            created_date: at,
            last_modified_by: actor,
            last_modified_date: at,
        }
    }

    pub fn modified(&self, actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            last_modified_by: actor,
            last_modified_date: at,
            ..self.clone()
        }
    }
}

/// Message key: what the event is about and where it is routed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventKey {
    pub aggregate_identifier: AggregateIdentifier,
    pub root_context_identifier: RootContextIdentifier,
}

impl EventKey {
    pub fn new(
        aggregate_identifier: AggregateIdentifier,
        root_context_identifier: RootContextIdentifier,
    ) -> Self {
        Self {
            aggregate_identifier,
            root_context_identifier,
        }
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_identifier.aggregate_type
    }

    pub fn version(&self) -> AggregateVersion {
        self.aggregate_identifier.version
    }
}

/// Message value of a non-tombstone envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage<P> {
    pub name: EventName,
    pub aggregate: P,
    pub auditing_information: AuditingInformation,
}

/// Key plus optional message; `None` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<P> {
    pub key: EventKey,
    pub value: Option<EventMessage<P>>,
}

impl<P> EventEnvelope<P> {
    pub fn event(key: EventKey, message: EventMessage<P>) -> Self {
        Self {
            key,
            value: Some(message),
        }
    }

    pub fn tombstone(key: EventKey) -> Self {
        Self { key, value: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn name(&self) -> Option<&EventName> {
        self.value.as_ref().map(|message| &message.name)
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Serializes the key and (if present) the message to their wire form.
    pub fn encode(&self) -> Result<(bytes::Bytes, Option<bytes::Bytes>), Error> {
        let key = serde_json::to_vec(&self.key)?;
        let value = self
            .value
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;
        Ok((key.into(), value.map(Into::into)))
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Converts a domain-agnostic envelope into one carrying a typed payload.
    pub fn into_typed<P: DeserializeOwned>(self) -> Result<EventEnvelope<P>, Error> {
        let value = match self.value {
            None => None,
            Some(message) => Some(EventMessage {
                name: message.name,
                aggregate: serde_json::from_value(message.aggregate)?,
                auditing_information: message.auditing_information,
            }),
        };
        Ok(EventEnvelope {
            key: self.key,
            value,
        })
    }
}
