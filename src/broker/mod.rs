//! The partitioned, append-only event log.
//!
//! [`Publisher`] is the producing side used by the outbox relay; [`EventLog`]
//! is the consuming side used by the consumer runtime. Records are routed to a
//! partition by their root context, so everything belonging to one context is
//! delivered in publish order. Consumer groups track a committed offset per
//! partition; the committed offset is the offset of the *next* record to read.

mod memory;

pub use memory::InMemoryLog;

use bytes::Bytes;
use std::future::Future;
use uuid::Uuid;

use crate::event::EventEnvelope;
use crate::{Error, RootContextIdentifier};

/// A record handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub root_context: RootContextIdentifier,
    /// Unique per outbox entry; lets idempotent brokers drop re-publishes.
    pub message_id: Uuid,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl ProducerRecord {
    /// Encodes `envelope` for `topic` under a fresh message id.
    pub fn from_envelope<P: serde::Serialize>(
        topic: &str,
        envelope: &EventEnvelope<P>,
    ) -> Result<Self, Error> {
        let (key, value) = envelope.encode()?;
        Ok(Self {
            topic: topic.to_string(),
            root_context: envelope.key.root_context_identifier,
            message_id: Uuid::new_v4(),
            key,
            value,
        })
    }
}

/// A record read back from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

/// Where a published record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub partition: u32,
    pub offset: u64,
}

pub trait Publisher: Send + Sync {
    /// Publishes one record; resolves once the broker acknowledged it.
    fn publish(
        &self,
        record: ProducerRecord,
    ) -> impl Future<Output = Result<LogPosition, Error>> + Send;
}

pub trait EventLog: Send + Sync {
    /// Number of partitions of `topic`; [`Error::TopicNotFound`] if it does not exist.
    fn partitions(&self, topic: &str) -> impl Future<Output = Result<u32, Error>> + Send;

    /// Reads up to `max_records` records starting at `from_offset`.
    fn poll(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> impl Future<Output = Result<Vec<ConsumerRecord>, Error>> + Send;

    /// Offset one past the last record currently in the partition.
    fn end_offset(
        &self,
        topic: &str,
        partition: u32,
    ) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Committed offset of `group` for the partition, if any.
    fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> impl Future<Output = Result<Option<u64>, Error>> + Send;

    /// Records that `group` has processed everything before `next_offset`.
    fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Resolves when new records may be available, or after `timeout`.
    fn wait_for_records(
        &self,
        timeout: std::time::Duration,
    ) -> impl Future<Output = ()> + Send;
}

impl<P: Publisher> Publisher for std::sync::Arc<P> {
    fn publish(
        &self,
        record: ProducerRecord,
    ) -> impl Future<Output = Result<LogPosition, Error>> + Send {
        (**self).publish(record)
    }
}

impl<L: EventLog> EventLog for std::sync::Arc<L> {
    fn partitions(&self, topic: &str) -> impl Future<Output = Result<u32, Error>> + Send {
        (**self).partitions(topic)
    }

    fn poll(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> impl Future<Output = Result<Vec<ConsumerRecord>, Error>> + Send {
        (**self).poll(topic, partition, from_offset, max_records)
    }

    fn end_offset(
        &self,
        topic: &str,
        partition: u32,
    ) -> impl Future<Output = Result<u64, Error>> + Send {
        (**self).end_offset(topic, partition)
    }

    fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> impl Future<Output = Result<Option<u64>, Error>> + Send {
        (**self).committed(group, topic, partition)
    }

    fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).commit(group, topic, partition, next_offset)
    }

    fn wait_for_records(
        &self,
        timeout: std::time::Duration,
    ) -> impl Future<Output = ()> + Send {
        (**self).wait_for_records(timeout)
    }
}
