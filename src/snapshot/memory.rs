use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ApplyOutcome, EventSource, Snapshot, SnapshotStore, VersionCheck, check_version};
use crate::broker::ProducerRecord;
use crate::bus::InMemoryOutbox;
use crate::event::{EventEnvelope, EventKey, EventName, Payload};
use crate::{AggregateType, AggregateVersion, Error};

#[derive(Debug, Clone)]
enum Entry<P> {
    Live(Snapshot<P>),
    /// Keeps the last version so older events cannot resurrect the aggregate.
    Deleted(AggregateVersion),
}

impl<P> Entry<P> {
    fn live_version(&self) -> Option<AggregateVersion> {
        match self {
            Entry::Live(snapshot) => Some(snapshot.version()),
            Entry::Deleted(_) => None,
        }
    }
}

type TableKey = (AggregateType, Uuid);

/// Snapshot store backed by a process-local table.
///
/// Built with [`InMemorySnapshotStore::with_outbox`] it is a command-side store:
/// every save and delete appends the resulting records to the outbox while
/// the table lock is held. Built with [`InMemorySnapshotStore::new`] it is a
/// consumer-side replica fed through [`SnapshotStore::apply`].
pub struct InMemorySnapshotStore<P> {
    table: Mutex<HashMap<TableKey, Entry<P>>>,
    outbox: Option<(String, Arc<InMemoryOutbox>)>,
}

impl<P> Default for InMemorySnapshotStore<P> {
    fn default() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            outbox: None,
        }
    }
}

impl<P> InMemorySnapshotStore<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbox(topic: impl Into<String>, outbox: Arc<InMemoryOutbox>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            outbox: Some((topic.into(), outbox)),
        }
    }

    /// Number of live (not deleted) snapshots.
    pub async fn len(&self) -> usize {
        self.table
            .lock()
            .await
            .values()
            .filter(|entry| matches!(entry, Entry::Live(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_deleted(&self, aggregate_type: &AggregateType, identifier: Uuid) -> bool {
        matches!(
            self.table
                .lock()
                .await
                .get(&(aggregate_type.clone(), identifier)),
            Some(Entry::Deleted(_))
        )
    }

    async fn record(&self, records: Vec<ProducerRecord>) {
        if let Some((_, outbox)) = &self.outbox {
            for record in records {
                outbox.append(record).await;
            }
        }
    }

    fn encode<Q: serde::Serialize>(
        &self,
        envelopes: &[&EventEnvelope<Q>],
    ) -> Result<Vec<ProducerRecord>, Error> {
        match &self.outbox {
            None => Ok(Vec::new()),
            Some((topic, _)) => envelopes
                .iter()
                .map(|envelope| ProducerRecord::from_envelope(topic, envelope))
                .collect(),
        }
    }
}

fn table_key<P>(snapshot: &Snapshot<P>) -> TableKey {
    (snapshot.aggregate_type().clone(), snapshot.id())
}

impl<P: Payload> SnapshotStore<P> for InMemorySnapshotStore<P> {
    async fn find(
        &self,
        aggregate_type: &AggregateType,
        identifier: Uuid,
    ) -> Result<Option<Snapshot<P>>, Error> {
        let table = self.table.lock().await;
        Ok(match table.get(&(aggregate_type.clone(), identifier)) {
            Some(Entry::Live(snapshot)) => Some(snapshot.clone()),
            _ => None,
        })
    }

    #[tracing::instrument(skip(self, snapshot), fields(aggregate = %snapshot.identifier, event = %event_name))]
    async fn save(
        &self,
        snapshot: Snapshot<P>,
        event_name: EventName,
    ) -> Result<EventEnvelope<P>, Error> {
        let mut table = self.table.lock().await;
        let key = table_key(&snapshot);
        let entry = table.get(&key);
        let stored = entry.and_then(Entry::live_version);
        let expected = AggregateVersion::new(snapshot.version().value().saturating_sub(1));

        let matches = match (entry, stored) {
            (Some(Entry::Deleted(_)), _) => false,
            (_, None) => expected.is_initial() && !snapshot.version().is_initial(),
            (_, Some(version)) => version == expected,
        };
        if !matches {
            return Err(Error::Concurrency {
                identifier: snapshot.id(),
                expected,
                actual: stored,
            });
        }

        let envelope = snapshot.to_envelope(event_name);
        let records = self.encode(&[&envelope])?;
        self.record(records).await;
        table.insert(key, Entry::Live(snapshot));

        tracing::debug!("snapshot saved");
        Ok(envelope)
    }

    #[tracing::instrument(skip(self, snapshot), fields(aggregate = %snapshot.identifier))]
    async fn delete(
        &self,
        snapshot: Snapshot<P>,
        final_event: Option<EventName>,
    ) -> Result<EventKey, Error> {
        let mut table = self.table.lock().await;
        let key = table_key(&snapshot);
        let stored = table.get(&key).and_then(Entry::live_version);

        if stored != Some(snapshot.version()) {
            return Err(Error::Concurrency {
                identifier: snapshot.id(),
                expected: snapshot.version(),
                actual: stored,
            });
        }

        let (records, tombstone_key) = match final_event {
            Some(name) => {
                let mut last = snapshot;
                last.identifier = last.identifier.with_version(last.version().next());
                let final_envelope = last.to_envelope(name);
                let tombstone: EventEnvelope<P> = EventEnvelope::tombstone(last.key());
                let records = self.encode(&[&final_envelope, &tombstone])?;
                (records, last.key())
            }
            None => {
                let tombstone: EventEnvelope<P> = EventEnvelope::tombstone(snapshot.key());
                (self.encode(&[&tombstone])?, snapshot.key())
            }
        };

        self.record(records).await;
        table.insert(key, Entry::Deleted(tombstone_key.version()));

        tracing::debug!(version = %tombstone_key.version(), "snapshot deleted");
        Ok(tombstone_key)
    }

    async fn preview(
        &self,
        envelope: &EventEnvelope<P>,
        source: EventSource,
    ) -> Result<ApplyOutcome, Error> {
        let table = self.table.lock().await;
        let key = (envelope.key.aggregate_type().clone(), envelope.key.aggregate_identifier.identifier);
        let received = envelope.key.version();

        Ok(match plan(table.get(&key), envelope, source)? {
            Plan::Store { .. } => ApplyOutcome::Applied(received),
            Plan::Delete => ApplyOutcome::Deleted(received),
            Plan::Skip(_) => ApplyOutcome::Skipped,
        })
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(aggregate = %envelope.key.aggregate_identifier, tombstone = envelope.is_tombstone())
    )]
    async fn apply(
        &self,
        envelope: EventEnvelope<P>,
        source: EventSource,
    ) -> Result<ApplyOutcome, Error> {
        let mut table = self.table.lock().await;
        let key = (envelope.key.aggregate_type().clone(), envelope.key.aggregate_identifier.identifier);
        let received = envelope.key.version();

        match plan(table.get(&key), &envelope, source)? {
            Plan::Skip(reason) => {
                tracing::info!(reason, "skipping event");
                Ok(ApplyOutcome::Skipped)
            }
            Plan::Delete => {
                table.insert(key, Entry::Deleted(received));
                Ok(ApplyOutcome::Deleted(received))
            }
            Plan::Store { gap } => {
                if gap {
                    tracing::warn!("version gap tolerated during restore");
                }
                match Snapshot::from_envelope(&envelope) {
                    Some(snapshot) => {
                        table.insert(key, Entry::Live(snapshot));
                        Ok(ApplyOutcome::Applied(received))
                    }
                    None => Ok(ApplyOutcome::Skipped),
                }
            }
        }
    }
}

/// What applying an envelope does to the stored entry.
enum Plan {
    Store { gap: bool },
    Delete,
    Skip(&'static str),
}

fn plan<P>(
    entry: Option<&Entry<P>>,
    envelope: &EventEnvelope<P>,
    source: EventSource,
) -> Result<Plan, Error> {
    let received = envelope.key.version();

    if envelope.is_tombstone() {
        return Ok(match entry.and_then(Entry::live_version) {
            Some(version) if received >= version => Plan::Delete,
            Some(_) => Plan::Skip("stale tombstone"),
            None => Plan::Skip("tombstone for absent aggregate"),
        });
    }

    let stored = match entry {
        Some(Entry::Deleted(_)) => return Ok(Plan::Skip("aggregate is deleted")),
        Some(Entry::Live(snapshot)) => Some(snapshot.version()),
        None => None,
    };

    match check_version(stored, received) {
        VersionCheck::Apply => Ok(Plan::Store { gap: false }),
        VersionCheck::Duplicate => Ok(Plan::Skip("duplicate event")),
        VersionCheck::Gap => match source {
            EventSource::Restore => Ok(Plan::Store { gap: true }),
            EventSource::Online => Err(Error::OutOfOrder {
                identifier: envelope.key.aggregate_identifier.identifier,
                stored: stored.unwrap_or_default(),
                received,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Actor, RootContextIdentifier};
    use chrono::Utc;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Project {
        name: String,
    }

    fn project_type() -> AggregateType {
        AggregateType::try_new("PROJECT").unwrap()
    }

    fn fresh(name: &str) -> Snapshot<Project> {
        Snapshot::new(
            project_type(),
            Uuid::new_v4(),
            RootContextIdentifier::new(),
            Project { name: name.into() },
            Actor::system(),
            Utc::now(),
        )
    }

    fn at(snapshot: &Snapshot<Project>, version: u64) -> Snapshot<Project> {
        let mut next = snapshot.clone();
        next.identifier = next.identifier.with_version(AggregateVersion::new(version));
        next
    }

    fn command_store() -> (InMemorySnapshotStore<Project>, Arc<InMemoryOutbox>) {
        let outbox = Arc::new(InMemoryOutbox::new());
        (
            InMemorySnapshotStore::with_outbox("project", outbox.clone()),
            outbox,
        )
    }

    #[tokio::test]
    async fn saves_require_the_next_version() {
        let (store, outbox) = command_store();
        let snapshot = fresh("Tower");

        store.save(at(&snapshot, 1), EventName::Created).await.unwrap();
        store.save(at(&snapshot, 2), EventName::Updated).await.unwrap();

        match store.save(at(&snapshot, 2), EventName::Updated).await {
            Err(Error::Concurrency { expected, actual, .. }) => {
                assert_eq!(expected, AggregateVersion::new(1));
                assert_eq!(actual, Some(AggregateVersion::new(2)));
            }
            other => panic!("Expected Concurrency error, got {:?}", other),
        }

        let found = store.find_or_fail(&project_type(), snapshot.id()).await.unwrap();
        assert_eq!(found.version(), AggregateVersion::new(2));
        assert_eq!(outbox.len().await, 2);
    }

    #[tokio::test]
    async fn first_save_must_be_version_one() {
        let (store, outbox) = command_store();
        let snapshot = fresh("Bridge");

        assert!(store.save(at(&snapshot, 2), EventName::Created).await.is_err());
        assert!(store.save(snapshot.clone(), EventName::Created).await.is_err());
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn deleted_snapshots_are_not_found() {
        let (store, outbox) = command_store();
        let snapshot = at(&fresh("Tunnel"), 1);
        store.save(snapshot.clone(), EventName::Created).await.unwrap();

        let key = store.delete(snapshot.clone(), None).await.unwrap();
        assert_eq!(key.version(), AggregateVersion::new(1));

        assert!(matches!(
            store.find_or_fail(&project_type(), snapshot.id()).await,
            Err(Error::NotFound { .. })
        ));
        assert!(store.is_deleted(&project_type(), snapshot.id()).await);

        let pending = outbox.pending().await;
        assert_eq!(pending.len(), 2);
        assert!(pending[1].record.value.is_none());
    }

    #[tokio::test]
    async fn final_events_precede_the_tombstone() {
        let (store, outbox) = command_store();
        let snapshot = at(&fresh("Dam"), 1);
        store.save(snapshot.clone(), EventName::Created).await.unwrap();

        let key = store
            .delete(snapshot, Some(EventName::Deleted))
            .await
            .unwrap();
        assert_eq!(key.version(), AggregateVersion::new(2));

        let pending = outbox.pending().await;
        assert_eq!(pending.len(), 3);
        assert!(pending[1].record.value.is_some());
        assert!(pending[2].record.value.is_none());
    }

    #[tokio::test]
    async fn saving_a_deleted_aggregate_conflicts() {
        let (store, _) = command_store();
        let snapshot = at(&fresh("Road"), 1);
        store.save(snapshot.clone(), EventName::Created).await.unwrap();
        store.delete(snapshot.clone(), None).await.unwrap();

        assert!(matches!(
            store.save(at(&snapshot, 2), EventName::Updated).await,
            Err(Error::Concurrency { actual: None, .. })
        ));
    }

    #[tokio::test]
    async fn deleted_aggregates_cannot_be_created_again() {
        let (store, outbox) = command_store();
        let snapshot = fresh("Canal");
        store.save(at(&snapshot, 1), EventName::Created).await.unwrap();
        store.save(at(&snapshot, 2), EventName::Updated).await.unwrap();
        store
            .delete(at(&snapshot, 2), Some(EventName::Deleted))
            .await
            .unwrap();
        let published = outbox.len().await;

        assert!(matches!(
            store.save(at(&snapshot, 1), EventName::Created).await,
            Err(Error::Concurrency { .. })
        ));
        assert!(store.find(&project_type(), snapshot.id()).await.unwrap().is_none());
        assert!(store.is_deleted(&project_type(), snapshot.id()).await);
        assert_eq!(outbox.len().await, published);
    }

    #[tokio::test]
    async fn apply_skips_duplicates() {
        let store = InMemorySnapshotStore::<Project>::new();
        let snapshot = fresh("Mill");
        let v1 = at(&snapshot, 1).to_envelope(EventName::Created);

        assert_eq!(
            store.apply(v1.clone(), EventSource::Online).await.unwrap(),
            ApplyOutcome::Applied(AggregateVersion::new(1))
        );
        assert_eq!(
            store.apply(v1, EventSource::Online).await.unwrap(),
            ApplyOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn gaps_are_rejected_online_and_tolerated_on_restore() {
        let snapshot = fresh("Harbor");
        let v1 = at(&snapshot, 1).to_envelope(EventName::Created);
        let v3 = at(&snapshot, 3).to_envelope(EventName::Updated);

        let online = InMemorySnapshotStore::<Project>::new();
        online.apply(v1.clone(), EventSource::Online).await.unwrap();
        assert!(matches!(
            online.apply(v3.clone(), EventSource::Online).await,
            Err(Error::OutOfOrder { .. })
        ));

        let restoring = InMemorySnapshotStore::<Project>::new();
        restoring.apply(v1, EventSource::Restore).await.unwrap();
        assert_eq!(
            restoring.apply(v3, EventSource::Restore).await.unwrap(),
            ApplyOutcome::Applied(AggregateVersion::new(3))
        );
    }

    #[tokio::test]
    async fn tombstones_are_final() {
        let store = InMemorySnapshotStore::<Project>::new();
        let snapshot = fresh("Quay");
        let v1 = at(&snapshot, 1).to_envelope(EventName::Created);
        let v2 = at(&snapshot, 2).to_envelope(EventName::Updated);

        store.apply(v1.clone(), EventSource::Online).await.unwrap();
        let outcome = store
            .apply(EventEnvelope::tombstone(v1.key.clone()), EventSource::Online)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Deleted(AggregateVersion::new(1)));

        assert_eq!(
            store.apply(v2, EventSource::Online).await.unwrap(),
            ApplyOutcome::Skipped
        );
        assert!(store.find(&project_type(), snapshot.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_tombstones_are_skipped() {
        let store = InMemorySnapshotStore::<Project>::new();
        let key = at(&fresh("Pier"), 4).key();
        assert_eq!(
            store
                .apply(EventEnvelope::tombstone(key), EventSource::Online)
                .await
                .unwrap(),
            ApplyOutcome::Skipped
        );
        assert!(store.is_empty().await);
    }
}
