//! Batching consumer loop over the mutation log.
//!
//! Messages are handed one at a time to a [`BatchWorker`], which turns each
//! into zero or one output. Outputs accumulate until either the batch holds
//! `max_batch_size` messages or `max_batch_time` has elapsed since the first
//! one, then the worker flushes them and the consumed offsets are committed.
//!
//! Offsets are committed only after a successful flush and cover skipped
//! messages too. Any processing, flush or commit error stops the loop with
//! nothing further committed, so the failed batch is redelivered on restart.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quarry_observability::metrics::REPLACER_FLUSH_ERRORS_TOTAL;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::config::ReplacerConfig;
use crate::error::{ReplacerError, Result};

/// Upper bound on how long an empty in-memory poll waits.
const MEMORY_POLL_IDLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// One message read from the mutation log.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub payload: Bytes,
}

impl LogMessage {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Partitioned, offset-committing log consumer.
#[async_trait]
pub trait LogConsumer: Send {
    /// Wait up to `timeout` for the next message.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>>;

    /// Commit the next offset to read for each partition.
    async fn commit(&mut self, offsets: &BTreeMap<TopicPartition, u64>) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Per-message processing plus batch flushing, driven by [`BatchingConsumer`].
#[async_trait]
pub trait BatchWorker: Send {
    type Output: Send;

    /// Turn one message into an output, or `None` if it needs no work.
    async fn process_message(&mut self, message: &LogMessage) -> Result<Option<Self::Output>>;

    /// Apply a batch of outputs, in order.
    async fn flush_batch(&mut self, batch: Vec<Self::Output>) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives a [`BatchWorker`] from a [`LogConsumer`].
pub struct BatchingConsumer<C, W: BatchWorker> {
    consumer: C,
    worker: W,
    max_batch_size: usize,
    max_batch_time: Duration,
    poll_timeout: Duration,
    batch: Vec<W::Output>,
    offsets: BTreeMap<TopicPartition, u64>,
    pending_messages: usize,
    batch_started: Option<Instant>,
}

impl<C, W> BatchingConsumer<C, W>
where
    C: LogConsumer,
    W: BatchWorker,
{
    pub fn new(consumer: C, worker: W, config: &ReplacerConfig) -> Self {
        Self {
            consumer,
            worker,
            max_batch_size: config.max_batch_size.max(1),
            max_batch_time: config.max_batch_time(),
            poll_timeout: config.poll_timeout(),
            batch: Vec::new(),
            offsets: BTreeMap::new(),
            pending_messages: 0,
            batch_started: None,
        }
    }

    /// Consume until `shutdown` turns true (or its sender goes away), then
    /// flush what is pending and close. The consumer is closed on error too.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            max_batch_size = self.max_batch_size,
            max_batch_time_ms = self.max_batch_time.as_millis() as u64,
            "starting batching consumer"
        );

        let result = self.consume(shutdown).await;

        if let Err(e) = self.consumer.close().await {
            tracing::warn!(error = %e, "error closing consumer");
        }

        match &result {
            Ok(()) => tracing::info!("batching consumer stopped"),
            Err(e) => tracing::error!(error = %e, "batching consumer halted"),
        }
        result
    }

    async fn consume(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            if let Some(message) = self.consumer.poll(self.poll_timeout).await? {
                self.handle(message).await?;
            }

            if self.batch_due() {
                self.flush().await?;
            }
        }

        if self.pending_messages > 0 {
            self.flush().await?;
        }
        self.worker.shutdown().await
    }

    async fn handle(&mut self, message: LogMessage) -> Result<()> {
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }

        match self.worker.process_message(&message).await {
            Ok(Some(output)) => self.batch.push(output),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "failed to process message"
                );
                return Err(e);
            }
        }

        self.offsets
            .insert(message.topic_partition(), message.offset + 1);
        self.pending_messages += 1;
        Ok(())
    }

    fn batch_due(&self) -> bool {
        if self.pending_messages == 0 {
            return false;
        }
        self.pending_messages >= self.max_batch_size
            || self
                .batch_started
                .map(|started| started.elapsed() >= self.max_batch_time)
                .unwrap_or(false)
    }

    async fn flush(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.batch);
        let outputs = batch.len();

        if !batch.is_empty() {
            if let Err(e) = self.worker.flush_batch(batch).await {
                REPLACER_FLUSH_ERRORS_TOTAL.inc();
                tracing::error!(outputs, error = %e, "batch flush failed, offsets not committed");
                return Err(e);
            }
        }

        if let Err(e) = self.consumer.commit(&self.offsets).await {
            REPLACER_FLUSH_ERRORS_TOTAL.inc();
            tracing::error!(error = %e, "offset commit failed");
            return Err(e);
        }

        tracing::debug!(
            messages = self.pending_messages,
            outputs,
            "batch committed"
        );
        self.offsets.clear();
        self.pending_messages = 0;
        self.batch_started = None;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLogState {
    queue: VecDeque<LogMessage>,
    next_offsets: BTreeMap<TopicPartition, u64>,
    committed: BTreeMap<TopicPartition, u64>,
    commits: usize,
    fail_commits: bool,
    closed: bool,
}

/// In-memory log consumer. Clones share the same log, so a test can keep
/// one handle to produce messages and inspect commits.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogConsumer {
    state: Arc<Mutex<MemoryLogState>>,
}

impl MemoryLogConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its offset.
    pub async fn push(&self, topic: &str, partition: u32, payload: impl Into<Bytes>) -> u64 {
        let mut state = self.state.lock().await;
        let next = state
            .next_offsets
            .entry(TopicPartition::new(topic, partition))
            .or_insert(0);
        let offset = *next;
        *next += 1;
        state.queue.push_back(LogMessage {
            topic: topic.to_string(),
            partition,
            offset,
            payload: payload.into(),
        });
        offset
    }

    pub async fn committed(&self) -> BTreeMap<TopicPartition, u64> {
        self.state.lock().await.committed.clone()
    }

    pub async fn commit_count(&self) -> usize {
        self.state.lock().await.commits
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Make subsequent commits fail until reset.
    pub async fn set_fail_commits(&self, fail: bool) {
        self.state.lock().await.fail_commits = fail;
    }
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ReplacerError::ConsumerError("consumer is closed".to_string()));
            }
            if let Some(message) = state.queue.pop_front() {
                return Ok(Some(message));
            }
        }
        tokio::time::sleep(timeout.min(MEMORY_POLL_IDLE)).await;
        Ok(None)
    }

    async fn commit(&mut self, offsets: &BTreeMap<TopicPartition, u64>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_commits {
            return Err(ReplacerError::ConsumerError("commit rejected".to_string()));
        }
        for (tp, offset) in offsets {
            state.committed.insert(tp.clone(), *offset);
        }
        state.commits += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}
