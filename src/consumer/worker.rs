use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use super::ConsumerRuntime;
use crate::Error;
use crate::broker::EventLog;
use crate::event::Decoder;
use crate::snapshot::EventSource;

/// Partitions handled by `worker` out of `partitions`, assigned round robin.
pub(super) fn assigned_partitions(partitions: u32, concurrency: usize, worker: usize) -> Vec<u32> {
    (0..partitions)
        .filter(|partition| *partition as usize % concurrency == worker)
        .collect()
}

/// Resolves the topic, runs one task per worker and waits for them.
///
/// The first worker error halts every other worker and is returned.
pub(super) async fn supervise<L, D>(
    runtime: Arc<ConsumerRuntime<L, D>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error>
where
    L: EventLog + 'static,
    D: Decoder + 'static,
{
    let Some(partitions) = wait_for_topic(&runtime, &mut shutdown).await? else {
        return Ok(());
    };

    let concurrency = runtime.config.concurrency();
    let (halt_tx, halt_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    for worker in 0..concurrency {
        let assigned = assigned_partitions(partitions, concurrency, worker);
        if assigned.is_empty() {
            continue;
        }
        tracing::info!(worker, partitions = ?assigned, "starting consumer worker");
        workers.spawn(run_worker(runtime.clone(), worker, assigned, halt_rx.clone()));
    }

    let mut result = Ok(());
    let mut stopping = false;
    loop {
        tokio::select! {
            joined = workers.join_next() => {
                let Some(joined) = joined else { break };
                let outcome = joined
                    .map_err(|e| Error::fatal(format!("consumer worker failed: {e}")))
                    .and_then(|outcome| outcome);
                if let Err(error) = outcome {
                    if result.is_ok() {
                        tracing::error!(%error, "consumer worker halted, stopping runtime");
                        result = Err(error);
                    }
                    let _ = halt_tx.send(true);
                }
            }
            _ = shutdown.changed(), if !stopping => {
                stopping = true;
                let _ = halt_tx.send(true);
            }
        }
    }

    result
}

/// Waits until the topic exists; `None` if shut down meanwhile.
async fn wait_for_topic<L: EventLog, D: Decoder>(
    runtime: &ConsumerRuntime<L, D>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<u32>, Error> {
    loop {
        if *shutdown.borrow() {
            return Ok(None);
        }
        match runtime
            .with_retry("partitions", || runtime.log.partitions(runtime.topic()))
            .await
        {
            Ok(partitions) => return Ok(Some(partitions)),
            Err(Error::TopicNotFound { topic }) if !runtime.config.missing_topics_fatal() => {
                tracing::warn!(%topic, "topic does not exist yet, waiting");
                tokio::select! {
                    _ = tokio::time::sleep(runtime.config.poll_interval()) => {}
                    _ = shutdown.changed() => return Ok(None),
                }
            }
            Err(error) => return Err(error),
        }
    }
}

#[tracing::instrument(skip(runtime, halt), fields(topic = %runtime.config.topic()))]
async fn run_worker<L, D>(
    runtime: Arc<ConsumerRuntime<L, D>>,
    worker: usize,
    partitions: Vec<u32>,
    mut halt: watch::Receiver<bool>,
) -> Result<(), Error>
where
    L: EventLog + 'static,
    D: Decoder + 'static,
{
    loop {
        if *halt.borrow() {
            return Ok(());
        }

        let mut processed = 0usize;
        for &partition in &partitions {
            let poll = poll_partition(&runtime, partition);
            let polled = tokio::select! {
                polled = poll => polled?,
                _ = halt.changed() => return Ok(()),
            };
            processed += polled;
        }

        if processed == 0 {
            tokio::select! {
                _ = runtime.log.wait_for_records(runtime.config.poll_interval()) => {}
                _ = halt.changed() => return Ok(()),
            }
        }
    }
}

/// Processes one batch of `partition`; returns how many records it handled.
async fn poll_partition<L: EventLog, D: Decoder>(
    runtime: &ConsumerRuntime<L, D>,
    partition: u32,
) -> Result<usize, Error> {
    let from = runtime
        .with_retry("committed", || {
            runtime
                .log
                .committed(runtime.group(), runtime.topic(), partition)
        })
        .await?
        .unwrap_or(0);
    let records = runtime
        .with_retry("poll", || {
            runtime.log.poll(
                runtime.topic(),
                partition,
                from,
                runtime.config.max_poll_records(),
            )
        })
        .await?;

    for record in &records {
        runtime.process_record(record, EventSource::Online).await?;
        runtime.commit(record).await?;
    }
    Ok(records.len())
}
