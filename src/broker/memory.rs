use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use super::{ConsumerRecord, EventLog, LogPosition, ProducerRecord, Publisher};
use crate::Error;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: bytes::Bytes,
    value: Option<bytes::Bytes>,
}

type OffsetKey = (String, String, u32);

const DEFAULT_DEDUPE_WINDOW: usize = 10_000;

/// Positions of the most recently published message ids.
#[derive(Debug)]
struct DedupeWindow {
    positions: HashMap<Uuid, LogPosition>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            positions: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, message_id: &Uuid) -> Option<LogPosition> {
        self.positions.get(message_id).copied()
    }

    fn insert(&mut self, message_id: Uuid, position: LogPosition) {
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.positions.remove(&oldest);
            }
        }
        self.order.push_back(message_id);
        self.positions.insert(message_id, position);
    }
}

impl Default for DedupeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_WINDOW)
    }
}

/// A process-local partitioned log.
///
/// Behaves like a broker topic with an idempotent producer: a record whose
/// `message_id` was already appended is acknowledged again without being
/// duplicated. Only the last 10 000 message ids are remembered, see
/// [`InMemoryLog::with_dedupe_window`]. [`InMemoryLog::set_available`]
/// simulates a broker outage.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    topics: RwLock<HashMap<String, Vec<Vec<StoredRecord>>>>,
    published: Mutex<DedupeWindow>,
    offsets: Mutex<HashMap<OffsetKey, u64>>,
    unavailable: AtomicBool,
    notify: Notify,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers the last `window` message ids for duplicate detection.
    pub fn with_dedupe_window(window: usize) -> Result<Self, Error> {
        if window == 0 {
            return Err(Error::invalid_config(
                "dedupe_window",
                "dedupe_window cannot be 0",
            ));
        }
        Ok(Self {
            published: Mutex::new(DedupeWindow::new(window)),
            ..Self::default()
        })
    }

    /// Creates `topic` with `partitions` partitions; existing topics are kept as is.
    pub async fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), Error> {
        if partitions == 0 {
            return Err(Error::invalid_config(
                "partitions",
                "partitions cannot be 0",
            ));
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
        Ok(())
    }

    /// Toggles a simulated outage; while unavailable every call fails transiently.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Total number of records across all partitions of `topic`.
    pub async fn len(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Every record of `topic` as `(partition, offset)` ordered pairs, mostly for tests.
    pub async fn records(&self, topic: &str) -> Vec<ConsumerRecord> {
        let topics = self.topics.read().await;
        let Some(partitions) = topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records
                    .iter()
                    .enumerate()
                    .map(move |(offset, record)| ConsumerRecord {
                        topic: topic.to_string(),
                        partition: partition as u32,
                        offset: offset as u64,
                        key: record.key.clone(),
                        value: record.value.clone(),
                    })
            })
            .collect()
    }

    fn ensure_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::transient("broker unavailable"));
        }
        Ok(())
    }
}

fn topic_not_found(topic: &str) -> Error {
    Error::TopicNotFound {
        topic: topic.to_string(),
    }
}

impl Publisher for InMemoryLog {
    #[tracing::instrument(skip(self, record), fields(topic = %record.topic, message_id = %record.message_id))]
    async fn publish(&self, record: ProducerRecord) -> Result<LogPosition, Error> {
        self.ensure_available()?;

        let mut published = self.published.lock().await;
        if let Some(position) = published.get(&record.message_id) {
            tracing::debug!(?position, "duplicate publish acknowledged");
            return Ok(position);
        }

        let mut topics = self.topics.write().await;
        let partitions = topics
            .get_mut(&record.topic)
            .ok_or_else(|| topic_not_found(&record.topic))?;
        let partition = record.root_context.partition(partitions.len() as u32);
        let log = &mut partitions[partition as usize];
        let position = LogPosition {
            partition,
            offset: log.len() as u64,
        };
        log.push(StoredRecord {
            key: record.key,
            value: record.value,
        });
        published.insert(record.message_id, position);
        drop(topics);
        drop(published);

        self.notify.notify_waiters();
        tracing::trace!(?position, "record appended");
        Ok(position)
    }
}

impl EventLog for InMemoryLog {
    async fn partitions(&self, topic: &str) -> Result<u32, Error> {
        self.ensure_available()?;
        self.topics
            .read()
            .await
            .get(topic)
            .map(|partitions| partitions.len() as u32)
            .ok_or_else(|| topic_not_found(topic))
    }

    async fn poll(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<Vec<ConsumerRecord>, Error> {
        self.ensure_available()?;
        let topics = self.topics.read().await;
        let records = topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .ok_or_else(|| topic_not_found(topic))?;

        Ok(records
            .iter()
            .enumerate()
            .skip(from_offset as usize)
            .take(max_records)
            .map(|(offset, record)| ConsumerRecord {
                topic: topic.to_string(),
                partition,
                offset: offset as u64,
                key: record.key.clone(),
                value: record.value.clone(),
            })
            .collect())
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, Error> {
        self.ensure_available()?;
        self.topics
            .read()
            .await
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|records| records.len() as u64)
            .ok_or_else(|| topic_not_found(topic))
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Option<u64>, Error> {
        self.ensure_available()?;
        Ok(self
            .offsets
            .lock()
            .await
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: u64,
    ) -> Result<(), Error> {
        self.ensure_available()?;
        let mut offsets = self.offsets.lock().await;
        let committed = offsets
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(0);
        // Committed progress never moves backwards.
        *committed = (*committed).max(next_offset);
        Ok(())
    }

    async fn wait_for_records(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
