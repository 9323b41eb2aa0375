mod broker;
mod bus;
mod command;
mod config;
mod consumer;
mod delay;
mod error;
mod event;
mod identifier;
mod kurrent_adapter;
mod retry;
mod snapshot;

pub use broker::{ConsumerRecord, EventLog, InMemoryLog, LogPosition, ProducerRecord, Publisher};
pub use bus::{EventBus, InMemoryOutbox, LocalEventBus, OutboxEntry, OutboxRelay, RelayHandle};
pub use command::{Authorizer, Command, CommandHandler, Committed, PendingEmission};
pub use config::{ConsumerConfig, ConsumerGroup, DeliveryMode, ExecuteConfig, TopicName};
pub use consumer::{
    ConsumerHandle, ConsumerRuntime, EventListener, ListenerRegistry, RecordOutcome,
    RestoreSummary, SnapshotListener, Stage,
};
pub use delay::RetryDelay;
pub use error::{Error, FailureClass};
pub use event::{
    AuditingInformation, Decoder, EventEnvelope, EventKey, EventMessage, EventName, JsonDecoder,
    Payload,
};
pub use identifier::{Actor, AggregateIdentifier, AggregateType, AggregateVersion, RootContextIdentifier};
pub use kurrent_adapter::{ConnectionSettings, ConnectionSettingsBuilder, ContextStreamName, KurrentPublisher};
pub use retry::{Attempts, AuthRetryPolicy, RetryPolicy, retry};
pub use snapshot::{ApplyOutcome, EventSource, InMemorySnapshotStore, Snapshot, SnapshotStore};

use uuid::Uuid;

/// Runs `attempt` until it commits, reloading and retrying after concurrent
/// modifications.
///
/// `attempt` must load the aggregate afresh on every call; only
/// [`Error::Concurrency`] is retried, any other result is returned as is.
/// After `config.max_retries()` retries the call fails with
/// [`Error::MaxRetriesExceeded`].
pub async fn execute<T, F, Fut>(
    identifier: Uuid,
    config: ExecuteConfig,
    mut attempt: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut retries = 0;

    loop {
        match attempt().await {
            Err(error @ Error::Concurrency { .. }) => {
                if retries >= config.max_retries() {
                    return Err(Error::MaxRetriesExceeded {
                        stream: identifier.to_string(),
                        max_retries: config.max_retries(),
                    });
                }

                let delay = config.retry_delay().calculate_delay(retries);
                tracing::debug!(
                    %identifier,
                    %error,
                    retry = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "concurrent modification, reloading"
                );
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            result => return result,
        }
    }
}
