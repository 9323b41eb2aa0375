//! Versioned aggregate snapshots and the store that owns them.
//!
//! The store is the single point of mutual exclusion for an aggregate: a save
//! only succeeds when the stored version is exactly one below the version being
//! written. Two commands loaded from the same version can therefore never both
//! commit; the loser observes [`Error::Concurrency`].
//!
//! Consumers use [`SnapshotStore::apply`] to fold incoming envelopes into a
//! local copy. Apply is idempotent by version, so redelivered events and full
//! log replays leave the store unchanged.

mod memory;

pub use memory::InMemorySnapshotStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

use crate::event::{AuditingInformation, EventEnvelope, EventKey, EventMessage, EventName, Payload};
use crate::{Actor, AggregateIdentifier, AggregateType, AggregateVersion, Error, RootContextIdentifier};

/// The latest materialized state of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<P> {
    pub identifier: AggregateIdentifier,
    pub root_context_identifier: RootContextIdentifier,
    pub payload: P,
    pub auditing_information: AuditingInformation,
}

impl<P> Snapshot<P> {
    /// A not yet persisted snapshot at [`AggregateVersion::INITIAL`].
    pub fn new(
        aggregate_type: AggregateType,
        identifier: Uuid,
        root_context_identifier: RootContextIdentifier,
        payload: P,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: AggregateIdentifier::new(aggregate_type, identifier, AggregateVersion::INITIAL),
            root_context_identifier,
            payload,
            auditing_information: AuditingInformation::created(actor, at),
        }
    }

    pub fn version(&self) -> AggregateVersion {
        self.identifier.version
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.identifier.aggregate_type
    }

    pub fn id(&self) -> Uuid {
        self.identifier.identifier
    }

    pub fn key(&self) -> EventKey {
        EventKey::new(self.identifier.clone(), self.root_context_identifier)
    }
}

impl<P: Clone> Snapshot<P> {
    /// The envelope announcing this snapshot's state at its own version.
    pub fn to_envelope(&self, name: EventName) -> EventEnvelope<P> {
        EventEnvelope::event(
            self.key(),
            EventMessage {
                name,
                aggregate: self.payload.clone(),
                auditing_information: self.auditing_information.clone(),
            },
        )
    }

    /// Rebuilds a snapshot from a non-tombstone envelope.
    pub fn from_envelope(envelope: &EventEnvelope<P>) -> Option<Self> {
        envelope.value.as_ref().map(|message| Self {
            identifier: envelope.key.aggregate_identifier.clone(),
            root_context_identifier: envelope.key.root_context_identifier,
            payload: message.aggregate.clone(),
            auditing_information: message.auditing_information.clone(),
        })
    }
}

/// Where an applied event comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Incremental consumption; side effects are allowed.
    Online,
    /// Full replay into an empty store; side effects are suppressed.
    Restore,
}

/// Result of [`SnapshotStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(AggregateVersion),
    Deleted(AggregateVersion),
    /// Already at or past this version, or the aggregate is gone.
    Skipped,
}

impl ApplyOutcome {
    pub fn changed_state(&self) -> bool {
        !matches!(self, ApplyOutcome::Skipped)
    }
}

/// Decision for a non-tombstone event against the stored version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VersionCheck {
    Apply,
    Duplicate,
    Gap,
}

pub(crate) fn check_version(stored: Option<AggregateVersion>, received: AggregateVersion) -> VersionCheck {
    match stored {
        None => VersionCheck::Apply,
        Some(stored) if received <= stored => VersionCheck::Duplicate,
        Some(stored) if received == stored.next() => VersionCheck::Apply,
        Some(_) => VersionCheck::Gap,
    }
}

pub trait SnapshotStore<P: Payload>: Send + Sync {
    /// Current snapshot, `None` if absent or deleted.
    fn find(
        &self,
        aggregate_type: &AggregateType,
        identifier: Uuid,
    ) -> impl Future<Output = Result<Option<Snapshot<P>>, Error>> + Send;

    /// Like [`SnapshotStore::find`] but fails with [`Error::NotFound`].
    fn find_or_fail(
        &self,
        aggregate_type: &AggregateType,
        identifier: Uuid,
    ) -> impl Future<Output = Result<Snapshot<P>, Error>> + Send {
        async move {
            self.find(aggregate_type, identifier)
                .await?
                .ok_or(Error::NotFound { identifier })
        }
    }

    /// Persists `snapshot`, which must carry the loaded version plus one, and
    /// records the resulting envelope for publication in the same unit of work.
    fn save(
        &self,
        snapshot: Snapshot<P>,
        event_name: EventName,
    ) -> impl Future<Output = Result<EventEnvelope<P>, Error>> + Send;

    /// Marks the aggregate deleted and records a tombstone for publication.
    ///
    /// With `final_event` the state is first saved at the next version under
    /// that name and the tombstone carries the new version; otherwise the
    /// tombstone carries the loaded version.
    fn delete(
        &self,
        snapshot: Snapshot<P>,
        final_event: Option<EventName>,
    ) -> impl Future<Output = Result<EventKey, Error>> + Send;

    /// The outcome [`SnapshotStore::apply`] would have, without changing the store.
    fn preview(
        &self,
        envelope: &EventEnvelope<P>,
        source: EventSource,
    ) -> impl Future<Output = Result<ApplyOutcome, Error>> + Send;

    /// Folds an envelope received from the log into the store.
    fn apply(
        &self,
        envelope: EventEnvelope<P>,
        source: EventSource,
    ) -> impl Future<Output = Result<ApplyOutcome, Error>> + Send;
}

impl<P: Payload, S: SnapshotStore<P>> SnapshotStore<P> for std::sync::Arc<S> {
    fn find(
        &self,
        aggregate_type: &AggregateType,
        identifier: Uuid,
    ) -> impl Future<Output = Result<Option<Snapshot<P>>, Error>> + Send {
        (**self).find(aggregate_type, identifier)
    }

    fn save(
        &self,
        snapshot: Snapshot<P>,
        event_name: EventName,
    ) -> impl Future<Output = Result<EventEnvelope<P>, Error>> + Send {
        (**self).save(snapshot, event_name)
    }

    fn delete(
        &self,
        snapshot: Snapshot<P>,
        final_event: Option<EventName>,
    ) -> impl Future<Output = Result<EventKey, Error>> + Send {
        (**self).delete(snapshot, final_event)
    }

    fn preview(
        &self,
        envelope: &EventEnvelope<P>,
        source: EventSource,
    ) -> impl Future<Output = Result<ApplyOutcome, Error>> + Send {
        (**self).preview(envelope, source)
    }

    fn apply(
        &self,
        envelope: EventEnvelope<P>,
        source: EventSource,
    ) -> impl Future<Output = Result<ApplyOutcome, Error>> + Send {
        (**self).apply(envelope, source)
    }
}
