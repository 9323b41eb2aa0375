//! KurrentDB as the event log's producing side.
//!
//! Every record is appended to the stream of its root context (see
//! [`ContextStreamName`]); the outbox message id becomes the KurrentDB event
//! id, so a re-published outbox entry is deduplicated by the server.

mod settings;
mod stream;

pub use settings::{ConnectionSettings, ConnectionSettingsBuilder};
pub use stream::ContextStreamName;

use eventstore::{AppendToStreamOptions, Client, DeleteStreamOptions, EventData};

use crate::Error;
use crate::broker::{LogPosition, ProducerRecord, Publisher};

const EVENT_TYPE: &str = "klio.event";
const TOMBSTONE_TYPE: &str = "klio.tombstone";

pub struct KurrentPublisher {
    client: Client,
}

impl KurrentPublisher {
    pub fn new(settings: &ConnectionSettings) -> Result<Self, Error> {
        let client = Client::new(settings.client_settings()?)
            .map_err(|e| Error::fatal(format!("cannot create KurrentDB client: {e:?}")))?;
        Ok(Self { client })
    }

    /// Removes a context stream; a stream that does not exist is not an error.
    pub async fn delete_stream(&self, stream: ContextStreamName) -> Result<(), Error> {
        match self
            .client
            .delete_stream(stream, &DeleteStreamOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(eventstore::Error::Grpc { code, .. })
                if code == tonic::Code::FailedPrecondition || code == tonic::Code::NotFound =>
            {
                Ok(())
            }
            Err(eventstore::Error::ResourceNotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn event_data(record: &ProducerRecord) -> EventData {
    let (event_type, payload) = match &record.value {
        Some(value) => (EVENT_TYPE, value.clone()),
        None => (TOMBSTONE_TYPE, bytes::Bytes::new()),
    };
    EventData::binary(event_type, payload)
        .id(record.message_id)
        .metadata(record.key.clone())
}

impl Publisher for KurrentPublisher {
    #[tracing::instrument(skip(self, record), fields(topic = %record.topic, message_id = %record.message_id))]
    async fn publish(&self, record: ProducerRecord) -> Result<LogPosition, Error> {
        let stream = ContextStreamName::new(record.topic.clone(), record.root_context);
        let result = self
            .client
            .append_to_stream(stream, &AppendToStreamOptions::default(), event_data(&record))
            .await?;

        tracing::trace!(revision = result.next_expected_version, "record appended");
        Ok(LogPosition {
            partition: 0,
            offset: result.next_expected_version,
        })
    }
}
