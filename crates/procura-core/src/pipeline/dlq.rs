//! Dead-letter records for messages that exhausted their retry budget.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bus::{BusError, BusRecord, EventBus, TOPIC_DLQ};

/// A message parked on the dead-letter topic, carrying everything an
/// operator needs to diagnose and replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    /// Unique id of this DLQ record.
    pub dlq_id: Uuid,

    /// Topic the failing message came from.
    pub original_topic: String,

    /// Partition of the failing message.
    pub original_partition: i32,

    /// Offset of the failing message.
    pub original_offset: i64,

    /// Key of the failing message, if any.
    pub original_key: Option<String>,

    /// Payload of the failing message, UTF-8 lossy.
    pub original_payload: String,

    /// Error classification from the handler.
    pub error_type: String,

    /// Human-readable error message.
    pub error_message: String,

    /// Number of attempts made before parking.
    pub retry_count: u32,

    /// When the final failure happened, milliseconds since epoch.
    pub failure_ts_ms: i64,

    /// Consumer group that failed to process the message.
    pub consumer_group: String,
}

impl DeadLetterEvent {
    /// Builds a record from the failing bus record and the final error.
    #[must_use]
    pub fn from_failure(
        record: &BusRecord,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        retry_count: u32,
        failure_ts_ms: i64,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            dlq_id: Uuid::new_v4(),
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            original_key: record.key.clone(),
            original_payload: String::from_utf8_lossy(&record.payload).into_owned(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            retry_count,
            failure_ts_ms,
            consumer_group: consumer_group.into(),
        }
    }

    /// Publishes this record to the DLQ topic, keyed by the original key
    /// so related failures stay together.
    ///
    /// # Errors
    ///
    /// Codec or transport failures from the bus.
    pub fn publish(&self, bus: &dyn EventBus) -> Result<(i32, i64), BusError> {
        let payload = serde_json::to_vec(self).map_err(|e| BusError::Codec {
            message: e.to_string(),
        })?;
        bus.publish(TOPIC_DLQ, self.original_key.as_deref(), &payload)
    }

    /// Parses a DLQ record from a bus record.
    ///
    /// # Errors
    ///
    /// `Codec` on malformed payloads.
    pub fn parse(record: &BusRecord) -> Result<Self, BusError> {
        serde_json::from_slice(&record.payload).map_err(|e| BusError::Codec {
            message: e.to_string(),
        })
    }
}

/// Drains all DLQ records currently visible on the dead-letter topic.
///
/// # Errors
///
/// Bus or codec failures.
pub fn drain_dlq(bus: &dyn EventBus) -> Result<Vec<DeadLetterEvent>, BusError> {
    let mut out = Vec::new();
    for partition in 0..bus.partition_count(TOPIC_DLQ) {
        let mut offset = 0;
        loop {
            let records = bus.poll(TOPIC_DLQ, partition, offset, 256)?;
            if records.is_empty() {
                break;
            }
            for record in &records {
                out.push(DeadLetterEvent::parse(record)?);
                offset = record.offset + 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::InMemoryBus;

    fn record() -> BusRecord {
        BusRecord {
            topic: "metering.events".to_string(),
            partition: 2,
            offset: 41,
            key: Some("principal-a".to_string()),
            payload: b"{\"bad\":true}".to_vec(),
            ts_ms: 1_000,
        }
    }

    #[test]
    fn captures_failure_context() {
        let dlq = DeadLetterEvent::from_failure(
            &record(),
            "HandlerError",
            "schema mismatch",
            3,
            9_000,
            "ledger-writer",
        );
        assert_eq!(dlq.original_topic, "metering.events");
        assert_eq!(dlq.original_offset, 41);
        assert_eq!(dlq.retry_count, 3);
        assert_eq!(dlq.consumer_group, "ledger-writer");
        assert_eq!(dlq.original_payload, "{\"bad\":true}");
    }

    #[test]
    fn publish_and_drain_roundtrip() {
        let bus = InMemoryBus::new(2);
        let dlq = DeadLetterEvent::from_failure(
            &record(),
            "HandlerError",
            "boom",
            3,
            9_000,
            "ledger-writer",
        );
        dlq.publish(&bus).unwrap();

        let drained = drain_dlq(&bus).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0], dlq);
    }
}
