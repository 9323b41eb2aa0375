use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::event::{EventEnvelope, Payload};
use crate::snapshot::{ApplyOutcome, EventSource, SnapshotStore};
use crate::{AggregateType, Error};

/// Applies the events of one aggregate type.
///
/// Implementations must be idempotent by version: the runtime delivers at
/// least once and replays the whole log on restore.
pub trait EventListener: Send + Sync {
    fn aggregate_type(&self) -> &AggregateType;

    fn on_event(
        &self,
        envelope: EventEnvelope<Value>,
        source: EventSource,
    ) -> BoxFuture<'_, Result<ApplyOutcome, Error>>;
}

type SideEffect<P> = Arc<dyn Fn(EventEnvelope<P>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Keeps a local snapshot store in sync with the log.
///
/// The optional side effect runs only for [`EventSource::Online`] events that
/// change local state, so replays and restores never trigger it. It runs
/// before the event is applied: when it fails the event stays unapplied, and
/// when the apply fails afterwards the retry runs the side effect again.
pub struct SnapshotListener<P, S> {
    aggregate_type: AggregateType,
    store: S,
    side_effect: Option<SideEffect<P>>,
    payload: PhantomData<fn() -> P>,
}

impl<P: Payload, S: SnapshotStore<P>> SnapshotListener<P, S> {
    pub fn new(aggregate_type: AggregateType, store: S) -> Self {
        Self {
            aggregate_type,
            store,
            side_effect: None,
            payload: PhantomData,
        }
    }

    pub fn with_side_effect<F, Fut>(self, effect: F) -> Self
    where
        F: Fn(EventEnvelope<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            side_effect: Some(Arc::new(move |envelope| effect(envelope).boxed())),
            ..self
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn handle(
        &self,
        envelope: EventEnvelope<Value>,
        source: EventSource,
    ) -> Result<ApplyOutcome, Error> {
        let envelope = envelope.into_typed::<P>()?;

        if let (EventSource::Online, Some(effect)) = (source, &self.side_effect) {
            if self.store.preview(&envelope, source).await?.changed_state() {
                effect(envelope.clone()).await?;
            }
        }
        self.store.apply(envelope, source).await
    }
}

impl<P: Payload, S: SnapshotStore<P>> EventListener for SnapshotListener<P, S> {
    fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    fn on_event(
        &self,
        envelope: EventEnvelope<Value>,
        source: EventSource,
    ) -> BoxFuture<'_, Result<ApplyOutcome, Error>> {
        self.handle(envelope, source).boxed()
    }
}

/// Listeners by aggregate type.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    listeners: HashMap<AggregateType, Arc<dyn EventListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: impl EventListener + 'static) -> Result<(), Error> {
        let aggregate_type = listener.aggregate_type().clone();
        if self.listeners.contains_key(&aggregate_type) {
            return Err(Error::invalid_config(
                "listeners",
                format!("a listener for {aggregate_type} is already registered"),
            ));
        }
        self.listeners.insert(aggregate_type, Arc::new(listener));
        Ok(())
    }

    pub fn with(mut self, listener: impl EventListener + 'static) -> Result<Self, Error> {
        self.register(listener)?;
        Ok(self)
    }

    pub fn get(&self, aggregate_type: &AggregateType) -> Option<&Arc<dyn EventListener>> {
        self.listeners.get(aggregate_type)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
