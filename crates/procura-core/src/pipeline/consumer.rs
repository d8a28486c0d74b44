//! Consumer workers: at-least-once processing with bounded retry and DLQ.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::bus::{BusError, BusRecord, EventBus};
use super::dlq::DeadLetterEvent;
use crate::clock::now_ms;

/// Default retry backoff schedule in milliseconds (exponential).
pub const DEFAULT_BACKOFF_MS: [u64; 3] = [500, 1_000, 2_000];

/// Default attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A handler failure, classified for the DLQ record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{error_type}: {message}")]
pub struct HandlerError {
    /// Error classification (e.g. `SchemaError`, `StoreError`).
    pub error_type: String,

    /// Human-readable description.
    pub message: String,
}

impl HandlerError {
    /// Creates a classified handler error.
    #[must_use]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// Per-message processing logic. Handlers must be idempotent: delivery is
/// at-least-once and a crash between handling and offset commit replays
/// the message.
pub trait MessageHandler: Send + Sync {
    /// Processes one record.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] triggers the retry/DLQ ladder.
    fn handle(&self, record: &BusRecord) -> Result<(), HandlerError>;
}

/// Consumer configuration for one `(group, topic, partition)`.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group name.
    pub group: String,

    /// Topic to consume.
    pub topic: String,

    /// Partition assigned to this worker.
    pub partition: i32,

    /// Attempts per message before dead-lettering.
    pub max_attempts: u32,

    /// Sleep between attempts; indexed by attempt number, the last entry
    /// repeats. Empty disables sleeping (tests).
    pub backoff_ms: Vec<u64>,

    /// Records fetched per poll.
    pub batch_size: usize,
}

impl ConsumerConfig {
    /// Creates a config with production defaults (3 attempts, 500 ms/1 s
    /// backoff between them, 2 s before a final would-be attempt is
    /// replaced by the DLQ publish).
    #[must_use]
    pub fn new(group: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
            partition,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            batch_size: 64,
        }
    }

    /// Disables retry sleeps (tests).
    #[must_use]
    pub fn without_backoff(mut self) -> Self {
        self.backoff_ms.clear();
        self
    }
}

/// One consumer worker. Message processing within the partition is
/// strictly sequential to preserve ordering; workers for different
/// partitions run in parallel.
pub struct Consumer {
    bus: Arc<dyn EventBus>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
}

impl Consumer {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            bus,
            handler,
            config,
        }
    }

    /// The next offset this worker will read: the committed offset, or
    /// `earliest` (0) when the group has none.
    ///
    /// # Errors
    ///
    /// Bus failures.
    pub fn position(&self) -> Result<i64, BusError> {
        Ok(self
            .bus
            .committed(&self.config.group, &self.config.topic, self.config.partition)?
            .unwrap_or(0))
    }

    /// Polls once and processes every fetched record in order. Returns the
    /// number of records processed (dead-lettered ones count: the offset
    /// moved past them).
    ///
    /// # Errors
    ///
    /// Bus failures. Handler failures never surface here; they end in
    /// retries and the DLQ.
    pub fn run_once(&self) -> Result<usize, BusError> {
        let position = self.position()?;
        let records = self.bus.poll(
            &self.config.topic,
            self.config.partition,
            position,
            self.config.batch_size,
        )?;
        let mut processed = 0;
        for record in &records {
            self.process(record)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Runs until the partition is drained. Returns total processed.
    ///
    /// # Errors
    ///
    /// Bus failures.
    pub fn run_until_caught_up(&self) -> Result<usize, BusError> {
        let mut total = 0;
        loop {
            let processed = self.run_once()?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    fn process(&self, record: &BusRecord) -> Result<(), BusError> {
        let mut last_error = None;
        for attempt in 1..=self.config.max_attempts {
            match self.handler.handle(record) {
                Ok(()) => {
                    self.commit_past(record)?;
                    return Ok(());
                },
                Err(error) => {
                    warn!(
                        group = %self.config.group,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        %error,
                        "handler failed"
                    );
                    last_error = Some(error);
                    if attempt < self.config.max_attempts {
                        self.backoff(attempt);
                    }
                },
            }
        }

        // Retry budget exhausted: park on the DLQ, then move past the
        // offset so the partition keeps flowing.
        let error = last_error
            .unwrap_or_else(|| HandlerError::new("Unknown", "no error recorded"));
        let dlq = DeadLetterEvent::from_failure(
            record,
            error.error_type.clone(),
            error.message.clone(),
            self.config.max_attempts,
            now_ms(),
            self.config.group.clone(),
        );
        dlq.publish(self.bus.as_ref())?;
        warn!(
            group = %self.config.group,
            topic = %record.topic,
            offset = record.offset,
            dlq_id = %dlq.dlq_id,
            "message dead-lettered"
        );
        self.commit_past(record)
    }

    fn commit_past(&self, record: &BusRecord) -> Result<(), BusError> {
        // Synchronous commit: the offset is durable before the next
        // message is touched.
        self.bus.commit(
            &self.config.group,
            &self.config.topic,
            self.config.partition,
            record.offset + 1,
        )?;
        debug!(
            group = %self.config.group,
            topic = %record.topic,
            partition = record.partition,
            committed = record.offset + 1,
            "offset committed"
        );
        Ok(())
    }

    fn backoff(&self, attempt: u32) {
        if self.config.backoff_ms.is_empty() {
            return;
        }
        let idx = (attempt as usize - 1).min(self.config.backoff_ms.len() - 1);
        std::thread::sleep(Duration::from_millis(self.config.backoff_ms[idx]));
    }
}
