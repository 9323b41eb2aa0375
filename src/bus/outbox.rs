use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;

use crate::Error;
use crate::broker::{ProducerRecord, Publisher};

/// A record waiting to be published, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub sequence: u64,
    pub record: ProducerRecord,
}

#[derive(Debug, Default)]
struct OutboxState {
    next_sequence: u64,
    pending: VecDeque<OutboxEntry>,
}

/// Pending-publish table written in the same unit of work as the snapshot.
///
/// Entries leave the outbox only after the broker acknowledged them, so a
/// crash between commit and publish loses nothing: the next relay sweep
/// publishes whatever is still pending.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    state: Mutex<OutboxState>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns its sequence number.
    pub async fn append(&self, record: ProducerRecord) -> u64 {
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.push_back(OutboxEntry { sequence, record });
        sequence
    }

    pub async fn pending(&self) -> Vec<OutboxEntry> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    async fn front(&self) -> Option<OutboxEntry> {
        self.state.lock().await.pending.front().cloned()
    }

    async fn remove(&self, sequence: u64) {
        let mut state = self.state.lock().await;
        if state.pending.front().map(|entry| entry.sequence) == Some(sequence) {
            state.pending.pop_front();
        }
    }
}

/// Moves outbox entries to the broker, oldest first.
///
/// Only one flush runs at a time and a flush stops at the first failed
/// publish, so records of one root context reach the log in commit order.
pub struct OutboxRelay<B> {
    outbox: Arc<InMemoryOutbox>,
    publisher: B,
    flushing: Mutex<()>,
}

impl<B: Publisher> OutboxRelay<B> {
    pub fn new(outbox: Arc<InMemoryOutbox>, publisher: B) -> Self {
        Self {
            outbox,
            publisher,
            flushing: Mutex::new(()),
        }
    }

    pub fn outbox(&self) -> &Arc<InMemoryOutbox> {
        &self.outbox
    }

    pub fn publisher(&self) -> &B {
        &self.publisher
    }

    /// Publishes every pending entry; returns how many were published.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&self) -> Result<usize, Error> {
        let _flushing = self.flushing.lock().await;
        let mut published = 0;

        while let Some(entry) = self.outbox.front().await {
            let position = self.publisher.publish(entry.record.clone()).await?;
            self.outbox.remove(entry.sequence).await;
            tracing::debug!(
                sequence = entry.sequence,
                topic = %entry.record.topic,
                partition = position.partition,
                offset = position.offset,
                "outbox entry published"
            );
            published += 1;
        }

        Ok(published)
    }

    /// Periodic recovery sweep; returns once `shutdown` flips or its sender is dropped.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = IntervalStream::new(tokio::time::interval(interval));

        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                Some(_) = ticks.next() => {
                    match self.flush().await {
                        Ok(0) => {}
                        Ok(published) => {
                            tracing::info!(published, "outbox sweep published pending entries");
                        }
                        Err(error) => {
                            let pending = self.outbox.len().await;
                            tracing::warn!(
                                %error,
                                pending,
                                "outbox sweep failed, entries stay pending"
                            );
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl<B: Publisher + 'static> OutboxRelay<B> {
    /// Starts the recovery sweep on the runtime.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(interval, shutdown_rx).await });
        RelayHandle { shutdown_tx, task }
    }
}

/// Controls a spawned recovery sweep.
pub struct RelayHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayHandle {
    /// Stops the sweep and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.task.await {
            tracing::error!(%error, "outbox relay task failed");
        }
    }
}
