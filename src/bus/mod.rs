//! Publishing committed changes.
//!
//! The event bus is the side-effect boundary of the command pipeline: it
//! persists the new snapshot and makes the resulting envelope available to the
//! log as one logical unit. [`LocalEventBus`] does this with a transactional
//! outbox. The snapshot write and the outbox append commit together; the relay
//! then publishes the entry, immediately when the broker is reachable and from
//! its recovery sweep otherwise. Delivery to the log is at-least-once;
//! consumers get effectively-once application through version-checked apply.

mod outbox;

pub use outbox::{InMemoryOutbox, OutboxEntry, OutboxRelay, RelayHandle};

use std::future::Future;
use std::sync::Arc;

use crate::Error;
use crate::broker::Publisher;
use crate::event::{EventEnvelope, EventKey, EventName, Payload};
use crate::snapshot::{Snapshot, SnapshotStore};

pub trait EventBus<P: Payload>: Send + Sync {
    /// Commits `snapshot` (already at its new version) and publishes `name`.
    fn emit(
        &self,
        snapshot: Snapshot<P>,
        name: EventName,
    ) -> impl Future<Output = Result<EventEnvelope<P>, Error>> + Send;

    /// Deletes the aggregate and publishes a tombstone, optionally preceded by
    /// a final named event.
    fn emit_tombstone(
        &self,
        snapshot: Snapshot<P>,
        final_event: Option<EventName>,
    ) -> impl Future<Output = Result<EventKey, Error>> + Send;
}

/// Snapshot store plus outbox relay.
pub struct LocalEventBus<S, B> {
    store: S,
    relay: Arc<OutboxRelay<B>>,
}

impl<S, B: Publisher> LocalEventBus<S, B> {
    /// `store` must append to the outbox drained by `relay`.
    pub fn new(store: S, relay: Arc<OutboxRelay<B>>) -> Self {
        Self { store, relay }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn relay(&self) -> &Arc<OutboxRelay<B>> {
        &self.relay
    }

    async fn publish_pending(&self) {
        if let Err(error) = self.relay.flush().await {
            tracing::warn!(%error, "publish deferred to outbox sweep");
        }
    }
}

impl<P, S, B> EventBus<P> for LocalEventBus<S, B>
where
    P: Payload,
    S: SnapshotStore<P>,
    B: Publisher,
{
    #[tracing::instrument(skip(self, snapshot), fields(aggregate = %snapshot.identifier, event = %name))]
    async fn emit(&self, snapshot: Snapshot<P>, name: EventName) -> Result<EventEnvelope<P>, Error> {
        let envelope = self.store.save(snapshot, name).await?;
        self.publish_pending().await;
        Ok(envelope)
    }

    #[tracing::instrument(skip(self, snapshot), fields(aggregate = %snapshot.identifier))]
    async fn emit_tombstone(
        &self,
        snapshot: Snapshot<P>,
        final_event: Option<EventName>,
    ) -> Result<EventKey, Error> {
        let key = self.store.delete(snapshot, final_event).await?;
        self.publish_pending().await;
        Ok(key)
    }
}
