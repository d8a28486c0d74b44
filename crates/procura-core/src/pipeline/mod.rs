//! Event pipeline: bus abstraction, consumer workers, handlers and DLQ.
//!
//! Metering and decision events reach the ledger only through this
//! pipeline — producers publish to the bus, the ledger-writer consumer
//! group is the sole append path. Delivery is at-least-once; handlers are
//! idempotent; a message that exhausts its retry budget parks on the
//! dead-letter topic with full failure context and its offset is committed
//! so the partition keeps flowing.

mod bus;
mod consumer;
mod dlq;
mod handlers;

pub use bus::{
    BusError, BusRecord, EventBus, InMemoryBus, TOPIC_DECISIONS, TOPIC_DLQ, TOPIC_LIFECYCLE,
    TOPIC_METERING, TOPIC_POLICY_CHANGES, WIRE_SCHEMA_VERSION, WireEvent, partition_for_key,
};
pub use consumer::{
    Consumer, ConsumerConfig, DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, HandlerError,
    MessageHandler,
};
pub use dlq::{DeadLetterEvent, drain_dlq};
pub use handlers::{
    ANOMALY_THRESHOLD_MULTIPLIER, AuditLogHandler, GROUP_AUDIT, GROUP_LEDGER_WRITER,
    GROUP_METRICS, LedgerWriterHandler, MetricsAggregatorHandler, SpendingAnomaly,
};
