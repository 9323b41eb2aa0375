//! Consumer runtime: keeps local state in sync with the event log.
//!
//! Each worker owns a fixed share of the topic's partitions and processes
//! their records strictly in order. A record moves through the stages of
//! [`Stage`]; its offset is committed only after the listener finished, so a
//! crash in between redelivers the record and the listener's version check
//! turns the redelivery into a no-op.
//!
//! Failure handling per record:
//!
//! - no listener for a tombstone's aggregate type: ignored and committed
//! - no listener for any other record: fatal, the runtime halts
//! - transient failures: retried per [`crate::RetryPolicy`], nothing committed
//!   meanwhile
//! - exhausted retries or undecodable records: skipped under
//!   [`DeliveryMode::NonTransactional`], halt under
//!   [`DeliveryMode::Transactional`]
//! - any other permanent failure: logged, committed and skipped

mod listener;
mod worker;

pub use listener::{EventListener, ListenerRegistry, SnapshotListener};

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::{ConsumerRecord, EventLog};
use crate::config::{ConsumerConfig, DeliveryMode};
use crate::event::{Decoder, EventEnvelope, JsonDecoder};
use crate::retry::retry;
use crate::snapshot::{ApplyOutcome, EventSource};
use crate::{Error, FailureClass};

/// Processing stage of a record, reported in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Deserializing,
    Dispatching,
    Applying,
    Committed,
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The listener ran; see [`ApplyOutcome`] for whether state changed.
    Applied(ApplyOutcome),
    /// Tombstone for an aggregate type nobody listens to.
    Ignored,
    /// The listener refused the record permanently.
    Rejected,
    /// Given up after exhausted retries in non-transactional mode.
    Skipped,
}

/// Counts of a finished [`ConsumerRuntime::restore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub partitions: u32,
    pub records: u64,
    pub applied: u64,
    pub skipped: u64,
}

pub struct ConsumerRuntime<L, D = JsonDecoder> {
    log: L,
    decoder: D,
    listeners: ListenerRegistry,
    config: ConsumerConfig,
}

impl<L: EventLog> ConsumerRuntime<L> {
    pub fn new(log: L, config: ConsumerConfig, listeners: ListenerRegistry) -> Self {
        Self {
            log,
            decoder: JsonDecoder,
            listeners,
            config,
        }
    }
}

impl<L: EventLog, D: Decoder> ConsumerRuntime<L, D> {
    pub fn with_decoder<E: Decoder>(self, decoder: E) -> ConsumerRuntime<L, E> {
        ConsumerRuntime {
            log: self.log,
            decoder,
            listeners: self.listeners,
            config: self.config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    fn topic(&self) -> &str {
        self.config.topic().as_ref()
    }

    fn group(&self) -> &str {
        self.config.group().as_ref()
    }

    /// Retries a log operation under the configured policies.
    async fn with_retry<T, F, Fut>(&self, what: &str, operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        retry(
            what,
            self.config.retry_policy(),
            self.config.auth_retry_policy(),
            operation,
        )
        .await
    }

    /// Runs one record through decoding, dispatch and the listener.
    ///
    /// Does not commit; the caller commits once this returns `Ok`. An `Err`
    /// means the record must not be committed and the partition has to halt.
    #[tracing::instrument(
        skip(self, record),
        fields(partition = record.partition, offset = record.offset)
    )]
    pub async fn process_record(
        &self,
        record: &ConsumerRecord,
        source: EventSource,
    ) -> Result<RecordOutcome, Error> {
        tracing::debug!(stage = ?Stage::Received, tombstone = record.value.is_none());

        tracing::debug!(stage = ?Stage::Deserializing);
        let envelope = match self
            .with_retry("deserialize", || async move { self.decoder.decode(record) })
            .await
        {
            Ok(envelope) => envelope,
            Err(error) => return self.give_up(error, record),
        };

        tracing::debug!(
            stage = ?Stage::Dispatching,
            aggregate_type = %envelope.key.aggregate_type(),
            version = %envelope.key.version(),
        );
        let Some(listener) = self.listeners.get(envelope.key.aggregate_type()) else {
            return self.unhandled(envelope);
        };

        tracing::debug!(stage = ?Stage::Applying);
        let result = self
            .with_retry("apply", || listener.on_event(envelope.clone(), source))
            .await;

        match result {
            Ok(outcome) => Ok(RecordOutcome::Applied(outcome)),
            Err(error) if error.class() == FailureClass::Fatal => Err(error),
            Err(error @ (Error::RetriesExhausted { .. } | Error::Deserialization(_))) => {
                self.give_up(error, record)
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    identifier = %envelope.key.aggregate_identifier.identifier,
                    "event rejected by listener, skipping"
                );
                Ok(RecordOutcome::Rejected)
            }
        }
    }

    fn unhandled(&self, envelope: EventEnvelope<Value>) -> Result<RecordOutcome, Error> {
        let aggregate_type = envelope.key.aggregate_type();
        if envelope.is_tombstone() {
            tracing::info!(%aggregate_type, "ignoring tombstone without listener");
            return Ok(RecordOutcome::Ignored);
        }
        Err(Error::fatal(format!(
            "no listener registered for aggregate type {aggregate_type}"
        )))
    }

    fn give_up(&self, error: Error, record: &ConsumerRecord) -> Result<RecordOutcome, Error> {
        match self.config.delivery_mode() {
            DeliveryMode::Transactional => {
                tracing::error!(
                    %error,
                    partition = record.partition,
                    offset = record.offset,
                    "cannot process record, halting partition"
                );
                Err(error)
            }
            DeliveryMode::NonTransactional => {
                tracing::warn!(
                    %error,
                    partition = record.partition,
                    offset = record.offset,
                    "cannot process record, skipping"
                );
                Ok(RecordOutcome::Skipped)
            }
        }
    }

    async fn commit(&self, record: &ConsumerRecord) -> Result<(), Error> {
        let next = record.offset + 1;
        self.with_retry("commit", || {
            self.log.commit(self.group(), self.topic(), record.partition, next)
        })
        .await?;
        tracing::debug!(
            stage = ?Stage::Committed,
            partition = record.partition,
            offset = record.offset
        );
        Ok(())
    }

    /// Replays every partition from the beginning into empty local stores.
    ///
    /// Listeners receive [`EventSource::Restore`], so side effects stay
    /// suppressed. Progress is committed, and a runtime started afterwards
    /// continues after the replayed records.
    #[tracing::instrument(skip(self), fields(topic = %self.config.topic()))]
    pub async fn restore(&self) -> Result<RestoreSummary, Error> {
        let partitions = self
            .with_retry("partitions", || self.log.partitions(self.topic()))
            .await?;
        let mut summary = RestoreSummary {
            partitions,
            ..RestoreSummary::default()
        };

        for partition in 0..partitions {
            let end = self
                .with_retry("end_offset", || self.log.end_offset(self.topic(), partition))
                .await?;
            let mut offset = 0;

            while offset < end {
                let records = self
                    .with_retry("poll", || {
                        self.log.poll(
                            self.topic(),
                            partition,
                            offset,
                            self.config.max_poll_records(),
                        )
                    })
                    .await?;
                if records.is_empty() {
                    break;
                }

                for record in records.iter().take_while(|record| record.offset < end) {
                    match self.process_record(record, EventSource::Restore).await? {
                        RecordOutcome::Applied(outcome) if outcome.changed_state() => {
                            summary.applied += 1
                        }
                        RecordOutcome::Skipped | RecordOutcome::Rejected => summary.skipped += 1,
                        _ => {}
                    }
                    summary.records += 1;
                    offset = record.offset + 1;
                }
            }

            if end > 0 {
                self.with_retry("commit", || {
                    self.log.commit(self.group(), self.topic(), partition, end)
                })
                .await?;
            }
        }

        tracing::info!(
            records = summary.records,
            applied = summary.applied,
            skipped = summary.skipped,
            "restore finished"
        );
        Ok(summary)
    }
}

impl<L, D> ConsumerRuntime<L, D>
where
    L: EventLog + 'static,
    D: Decoder + 'static,
{
    /// Spawns the workers and returns immediately.
    ///
    /// Dropping the returned handle stops the runtime. The runtime waits for a missing topic unless
    /// [`ConsumerConfig::missing_topics_fatal`] is set.
    pub fn start(self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker::supervise(Arc::new(self), shutdown_rx));
        ConsumerHandle { shutdown_tx, task }
    }
}

/// Controls a started [`ConsumerRuntime`].
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), Error>>,
}

impl ConsumerHandle {
    /// `true` once every worker stopped, either halted or shut down.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops all workers; a record in flight is abandoned uncommitted.
    pub async fn shutdown(self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Waits until the runtime stops by itself, which only happens on a halt.
    pub async fn join(self) -> Result<(), Error> {
        self.task
            .await
            .map_err(|e| Error::fatal(format!("consumer runtime task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryLog, ProducerRecord, Publisher};
    use crate::config::{ConsumerGroup, TopicName};
    use crate::event::EventName;
    use crate::snapshot::{InMemorySnapshotStore, Snapshot, SnapshotStore};
    use crate::{
        Actor, AggregateType, AggregateVersion, AuthRetryPolicy, RetryDelay, RetryPolicy,
        RootContextIdentifier,
    };
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Company {
        name: String,
    }

    type Store = Arc<InMemorySnapshotStore<Company>>;

    fn company_type() -> AggregateType {
        AggregateType::try_new("COMPANY").unwrap()
    }

    fn config(mode: DeliveryMode) -> ConsumerConfig {
        ConsumerConfig::new(
            TopicName::try_new("company").unwrap(),
            ConsumerGroup::try_new("tests").unwrap(),
        )
        .with_delivery_mode(mode)
        .with_retry_policy(RetryPolicy::bounded(RetryDelay::exponential(1, 2.0, 5), 2).unwrap())
    }

    fn snapshot(aggregate_type: AggregateType, id: u128, version: u64, name: &str) -> Snapshot<Company> {
        let mut snapshot = Snapshot::new(
            aggregate_type,
            Uuid::from_u128(id),
            RootContextIdentifier::from_uuid(Uuid::from_u128(1)),
            Company {
                name: name.to_string(),
            },
            Actor::system(),
            chrono::Utc::now(),
        );
        snapshot.identifier = snapshot
            .identifier
            .with_version(AggregateVersion::new(version));
        snapshot
    }

    fn record(envelope: &EventEnvelope<Company>, offset: u64) -> ConsumerRecord {
        let (key, value) = envelope.encode().unwrap();
        ConsumerRecord {
            topic: "company".to_string(),
            partition: 0,
            offset,
            key,
            value,
        }
    }

    fn runtime(mode: DeliveryMode) -> (Store, ConsumerRuntime<Arc<InMemoryLog>>) {
        let store: Store = Arc::new(InMemorySnapshotStore::new());
        let listeners = ListenerRegistry::new()
            .with(SnapshotListener::new(company_type(), store.clone()))
            .unwrap();
        let runtime = ConsumerRuntime::new(Arc::new(InMemoryLog::new()), config(mode), listeners);
        (store, runtime)
    }

    #[tokio::test]
    async fn applies_known_events() {
        let (store, runtime) = runtime(DeliveryMode::Transactional);
        let created = snapshot(company_type(), 7, 1, "Acme").to_envelope(EventName::Created);

        let outcome = runtime
            .process_record(&record(&created, 0), EventSource::Online)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::Applied(ApplyOutcome::Applied(AggregateVersion::new(1)))
        );
        let stored = store.find_or_fail(&company_type(), Uuid::from_u128(7)).await.unwrap();
        assert_eq!(stored.payload.name, "Acme");
    }

    #[tokio::test]
    async fn unknown_aggregate_types_are_fatal() {
        let (_, runtime) = runtime(DeliveryMode::NonTransactional);
        let stranger = AggregateType::try_new("INVOICE").unwrap();
        let event = snapshot(stranger, 7, 1, "Acme").to_envelope(EventName::Created);

        let result = runtime
            .process_record(&record(&event, 0), EventSource::Online)
            .await;

        assert!(matches!(result, Err(Error::FatalConfiguration { .. })));
    }

    #[tokio::test]
    async fn unknown_tombstones_are_ignored() {
        let (_, runtime) = runtime(DeliveryMode::Transactional);
        let stranger = AggregateType::try_new("INVOICE").unwrap();
        let tombstone: EventEnvelope<Company> =
            EventEnvelope::tombstone(snapshot(stranger, 7, 3, "Acme").key());

        let outcome = runtime
            .process_record(&record(&tombstone, 0), EventSource::Online)
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Ignored);
    }

    #[tokio::test]
    async fn undecodable_records_depend_on_delivery_mode() {
        let garbage = ConsumerRecord {
            topic: "company".to_string(),
            partition: 0,
            offset: 0,
            key: bytes::Bytes::from_static(b"not json"),
            value: None,
        };

        let (_, transactional) = runtime(DeliveryMode::Transactional);
        assert!(matches!(
            transactional.process_record(&garbage, EventSource::Online).await,
            Err(Error::Deserialization(_))
        ));

        let (_, lenient) = runtime(DeliveryMode::NonTransactional);
        assert_eq!(
            lenient
                .process_record(&garbage, EventSource::Online)
                .await
                .unwrap(),
            RecordOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn version_gaps_are_rejected_online() {
        let (store, runtime) = runtime(DeliveryMode::Transactional);
        let first = snapshot(company_type(), 7, 1, "Acme").to_envelope(EventName::Created);
        let third = snapshot(company_type(), 7, 3, "Acme Corp").to_envelope(EventName::Updated);

        runtime
            .process_record(&record(&first, 0), EventSource::Online)
            .await
            .unwrap();
        let outcome = runtime
            .process_record(&record(&third, 1), EventSource::Online)
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Rejected);
        let stored = store.find_or_fail(&company_type(), Uuid::from_u128(7)).await.unwrap();
        assert_eq!(stored.version(), AggregateVersion::new(1));
    }

    #[tokio::test]
    async fn restore_replays_and_commits() {
        let (store, runtime) = runtime(DeliveryMode::Transactional);
        runtime.log().create_topic("company", 2).await.unwrap();

        let created = snapshot(company_type(), 7, 1, "Acme");
        let updated = snapshot(company_type(), 7, 2, "Acme Corp");
        for envelope in [
            created.to_envelope(EventName::Created),
            updated.to_envelope(EventName::Updated),
        ] {
            let record = ProducerRecord::from_envelope("company", &envelope).unwrap();
            runtime.log().publish(record).await.unwrap();
        }

        let summary = runtime.restore().await.unwrap();

        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.applied, 2);
        let stored = store.find_or_fail(&company_type(), Uuid::from_u128(7)).await.unwrap();
        assert_eq!(stored.payload.name, "Acme Corp");

        let partition = created.root_context_identifier.partition(2);
        let committed = runtime
            .log()
            .committed("tests", "company", partition)
            .await
            .unwrap();
        assert_eq!(committed, Some(2));
    }

    /// Fails with a transient error for the first `failures` calls.
    struct FlakyDecoder {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl Decoder for FlakyDecoder {
        fn decode(&self, record: &ConsumerRecord) -> Result<EventEnvelope<Value>, Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(Error::transient("schema registry unavailable"));
            }
            JsonDecoder.decode(record)
        }
    }

    /// Fails with `error()` for the first `failures` calls.
    struct FailingListener {
        aggregate_type: AggregateType,
        failures: u32,
        error: fn() -> Error,
        calls: Arc<AtomicU32>,
    }

    impl EventListener for FailingListener {
        fn aggregate_type(&self) -> &AggregateType {
            &self.aggregate_type
        }

        fn on_event(
            &self,
            _envelope: EventEnvelope<Value>,
            _source: EventSource,
        ) -> BoxFuture<'_, Result<ApplyOutcome, Error>> {
            let result = if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err((self.error)())
            } else {
                Ok(ApplyOutcome::Skipped)
            };
            async move { result }.boxed()
        }
    }

    fn failing_runtime(
        mode: DeliveryMode,
        failures: u32,
        error: fn() -> Error,
    ) -> (Arc<AtomicU32>, ConsumerRuntime<Arc<InMemoryLog>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let listeners = ListenerRegistry::new()
            .with(FailingListener {
                aggregate_type: company_type(),
                failures,
                error,
                calls: calls.clone(),
            })
            .unwrap();
        let config = config(mode)
            .with_auth_retry_policy(AuthRetryPolicy::new(Duration::from_millis(1)).unwrap());
        let runtime = ConsumerRuntime::new(Arc::new(InMemoryLog::new()), config, listeners);
        (calls, runtime)
    }

    #[tokio::test]
    async fn transient_decode_failures_are_retried() {
        let (store, runtime) = runtime(DeliveryMode::Transactional);
        let calls = Arc::new(AtomicU32::new(0));
        let runtime = runtime.with_decoder(FlakyDecoder {
            failures: 1,
            calls: calls.clone(),
        });
        let created = snapshot(company_type(), 7, 1, "Acme").to_envelope(EventName::Created);

        let outcome = runtime
            .process_record(&record(&created, 0), EventSource::Online)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RecordOutcome::Applied(ApplyOutcome::Applied(AggregateVersion::new(1)))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.find(&company_type(), Uuid::from_u128(7)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn exhausted_decode_retries_depend_on_delivery_mode() {
        let created = snapshot(company_type(), 7, 1, "Acme").to_envelope(EventName::Created);
        let record = record(&created, 0);

        let calls = Arc::new(AtomicU32::new(0));
        let (_, transactional) = runtime(DeliveryMode::Transactional);
        let transactional = transactional.with_decoder(FlakyDecoder {
            failures: u32::MAX,
            calls: calls.clone(),
        });
        match transactional.process_record(&record, EventSource::Online).await {
            Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected RetriesExhausted error, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let (store, lenient) = runtime(DeliveryMode::NonTransactional);
        let lenient = lenient.with_decoder(FlakyDecoder {
            failures: u32::MAX,
            calls: Arc::new(AtomicU32::new(0)),
        });
        assert_eq!(
            lenient.process_record(&record, EventSource::Online).await.unwrap(),
            RecordOutcome::Skipped
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn exhausted_listener_retries_halt_without_committing() {
        let (calls, runtime) = failing_runtime(DeliveryMode::Transactional, u32::MAX, || {
            Error::transient("database unavailable")
        });
        runtime.log().create_topic("company", 1).await.unwrap();
        let created = snapshot(company_type(), 7, 1, "Acme").to_envelope(EventName::Created);
        let record = ProducerRecord::from_envelope("company", &created).unwrap();
        runtime.log().publish(record).await.unwrap();
        let log = runtime.log().clone();

        let halted = tokio::time::timeout(Duration::from_secs(5), runtime.start().join())
            .await
            .expect("runtime did not halt");

        assert!(matches!(halted, Err(Error::RetriesExhausted { attempts: 2, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(log.committed("tests", "company", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn authentication_failures_do_not_use_the_retry_budget() {
        let (calls, runtime) = failing_runtime(DeliveryMode::Transactional, 3, || {
            Error::Authentication {
                message: "token expired".to_string(),
            }
        });
        let created = snapshot(company_type(), 7, 1, "Acme").to_envelope(EventName::Created);

        let outcome = runtime
            .process_record(&record(&created, 0), EventSource::Online)
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Applied(ApplyOutcome::Skipped));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
