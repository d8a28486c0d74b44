//! Message bus abstraction and the in-process implementation.
//!
//! The external deployment runs an ordered, partitioned broker; this module
//! defines the narrow surface the core needs (publish, poll, offset
//! commit) plus an in-memory bus with the same ordering and consumer-group
//! semantics for tests and single-process deployments.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::now_ms;
use crate::crypto::sha256;
use crate::ledger::EventBody;

/// Topic for metering events emitted after allowed actions execute.
pub const TOPIC_METERING: &str = "metering.events";

/// Topic for evaluator decisions.
pub const TOPIC_DECISIONS: &str = "policy.decisions";

/// Topic for principal lifecycle announcements.
pub const TOPIC_LIFECYCLE: &str = "agent.lifecycle";

/// Topic for policy-change announcements.
pub const TOPIC_POLICY_CHANGES: &str = "policy.changes";

/// Dead-letter topic.
pub const TOPIC_DLQ: &str = "dlq";

/// Current wire schema version for [`WireEvent`].
pub const WIRE_SCHEMA_VERSION: u32 = 1;

/// Bus errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// The topic does not exist (polling before any publish).
    #[error("unknown topic: {topic}")]
    UnknownTopic {
        /// The missing topic.
        topic: String,
    },

    /// The partition index is out of range for the topic.
    #[error("unknown partition {partition} for topic {topic}")]
    UnknownPartition {
        /// The topic.
        topic: String,
        /// The bad partition index.
        partition: i32,
    },

    /// Payload failed to serialize or deserialize.
    #[error("payload codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Transport failure (external brokers only).
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },
}

/// Versioned wire envelope for event bodies.
///
/// Readers must tolerate unknown optional fields, which the default serde
/// behavior (ignore unknown keys) provides; the explicit version integer
/// lets a reader reject a future incompatible major revision outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    /// Schema version; readers reject versions above their own.
    pub schema_version: u32,

    /// The event body.
    #[serde(flatten)]
    pub body: EventBody,
}

impl WireEvent {
    /// Wraps a body at the current schema version.
    #[must_use]
    pub fn new(body: EventBody) -> Self {
        Self {
            schema_version: WIRE_SCHEMA_VERSION,
            body,
        }
    }

    /// Serializes to wire bytes.
    ///
    /// # Errors
    ///
    /// `Codec` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(|e| BusError::Codec {
            message: e.to_string(),
        })
    }

    /// Deserializes from wire bytes, rejecting newer major versions.
    ///
    /// # Errors
    ///
    /// `Codec` on malformed payloads or an unsupported version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        let event: Self = serde_json::from_slice(bytes).map_err(|e| BusError::Codec {
            message: e.to_string(),
        })?;
        if event.schema_version > WIRE_SCHEMA_VERSION {
            return Err(BusError::Codec {
                message: format!("unsupported schema version {}", event.schema_version),
            });
        }
        Ok(event)
    }
}

/// A record as read from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    /// Topic the record came from.
    pub topic: String,

    /// Partition within the topic.
    pub partition: i32,

    /// Offset within the partition.
    pub offset: i64,

    /// Partitioning key (principal id for metering/decision events).
    pub key: Option<String>,

    /// Raw payload bytes.
    pub payload: Vec<u8>,

    /// Broker-assigned timestamp, milliseconds since epoch.
    pub ts_ms: i64,
}

/// The bus surface the core depends on.
pub trait EventBus: Send + Sync {
    /// Publishes a payload, returning the `(partition, offset)` it landed
    /// on. Records with the same key land on the same partition.
    ///
    /// # Errors
    ///
    /// Transport or codec failures.
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(i32, i64), BusError>;

    /// Number of partitions for a topic.
    fn partition_count(&self, topic: &str) -> i32;

    /// Reads up to `max` records from `offset` onward. Returns an empty
    /// vector when caught up (brokers block up to a poll timeout; the
    /// in-memory bus returns immediately).
    ///
    /// # Errors
    ///
    /// `UnknownPartition` for a bad partition index.
    fn poll(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max: usize,
    ) -> Result<Vec<BusRecord>, BusError>;

    /// Synchronously commits the next-to-read offset for a group.
    ///
    /// # Errors
    ///
    /// Transport failures.
    fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64)
    -> Result<(), BusError>;

    /// Reads the committed next-to-read offset for a group, if any.
    ///
    /// # Errors
    ///
    /// Transport failures.
    fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, BusError>;
}

/// Stable key-to-partition assignment shared by every bus implementation,
/// so a principal's events stay ordered.
#[must_use]
pub fn partition_for_key(key: &str, partition_count: i32) -> i32 {
    let digest = sha256(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);
    i32::try_from(hash % partition_count.max(1) as u64).unwrap_or(0)
}

/// In-process bus with ordered partitions and per-group committed offsets.
pub struct InMemoryBus {
    partitions_per_topic: i32,
    topics: RwLock<HashMap<String, Vec<Vec<BusRecord>>>>,
    offsets: RwLock<HashMap<(String, String, i32), i64>>,
}

impl InMemoryBus {
    /// Creates a bus with `partitions_per_topic` partitions per topic.
    #[must_use]
    pub fn new(partitions_per_topic: i32) -> Self {
        Self {
            partitions_per_topic: partitions_per_topic.max(1),
            topics: RwLock::new(HashMap::new()),
            offsets: RwLock::new(HashMap::new()),
        }
    }

    /// Total records ever published to a topic partition.
    #[must_use]
    pub fn high_water_mark(&self, topic: &str, partition: i32) -> i64 {
        let topics = self.topics.read().unwrap();
        topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map_or(0, |records| records.len() as i64)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(4)
    }
}

impl EventBus for InMemoryBus {
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(i32, i64), BusError> {
        let mut topics = self.topics.write().unwrap();
        let partitions = topics.entry(topic.to_string()).or_insert_with(|| {
            (0..self.partitions_per_topic).map(|_| Vec::new()).collect()
        });
        let partition = key.map_or(0, |k| partition_for_key(k, self.partitions_per_topic));
        let records = &mut partitions[partition as usize];
        let offset = records.len() as i64;
        records.push(BusRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.map(str::to_string),
            payload: payload.to_vec(),
            ts_ms: now_ms(),
        });
        Ok((partition, offset))
    }

    fn partition_count(&self, _topic: &str) -> i32 {
        self.partitions_per_topic
    }

    fn poll(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max: usize,
    ) -> Result<Vec<BusRecord>, BusError> {
        if partition < 0 || partition >= self.partitions_per_topic {
            return Err(BusError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        let topics = self.topics.read().unwrap();
        let Some(partitions) = topics.get(topic) else {
            // A topic nobody has published to yet is just empty.
            return Ok(Vec::new());
        };
        let records = &partitions[partition as usize];
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        if start >= records.len() {
            return Ok(Vec::new());
        }
        let end = records.len().min(start + max);
        Ok(records[start..end].to_vec())
    }

    fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), BusError> {
        let mut offsets = self.offsets.write().unwrap();
        offsets.insert(
            (group.to_string(), topic.to_string(), partition),
            offset,
        );
        Ok(())
    }

    fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, BusError> {
        let offsets = self.offsets.read().unwrap();
        Ok(offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::ledger::EventKind;

    #[test]
    fn same_key_lands_on_same_partition() {
        let bus = InMemoryBus::new(4);
        let (p1, o1) = bus.publish(TOPIC_METERING, Some("principal-a"), b"one").unwrap();
        let (p2, o2) = bus.publish(TOPIC_METERING, Some("principal-a"), b"two").unwrap();
        assert_eq!(p1, p2);
        assert_eq!(o1, 0);
        assert_eq!(o2, 1);
    }

    #[test]
    fn poll_respects_offset_and_max() {
        let bus = InMemoryBus::new(1);
        for i in 0..5 {
            bus.publish("t", Some("k"), format!("{i}").as_bytes()).unwrap();
        }
        let records = bus.poll("t", 0, 2, 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 2);
        assert_eq!(records[1].offset, 3);

        assert!(bus.poll("t", 0, 5, 10).unwrap().is_empty());
    }

    #[test]
    fn unknown_partition_is_an_error() {
        let bus = InMemoryBus::new(2);
        bus.publish("t", None, b"x").unwrap();
        assert!(matches!(
            bus.poll("t", 7, 0, 1),
            Err(BusError::UnknownPartition { .. })
        ));
    }

    #[test]
    fn offsets_commit_per_group() {
        let bus = InMemoryBus::new(1);
        assert_eq!(bus.committed("g1", "t", 0).unwrap(), None);
        bus.commit("g1", "t", 0, 3).unwrap();
        bus.commit("g2", "t", 0, 1).unwrap();
        assert_eq!(bus.committed("g1", "t", 0).unwrap(), Some(3));
        assert_eq!(bus.committed("g2", "t", 0).unwrap(), Some(1));
    }

    #[test]
    fn wire_event_roundtrip_tolerates_unknown_fields() {
        let body = EventBody::new(Uuid::new_v4(), EventKind::Metering);
        let bytes = WireEvent::new(body.clone()).to_bytes().unwrap();

        // Inject an unknown optional field a newer producer might add.
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["future_field"] = serde_json::json!("ignored");
        let decoded = WireEvent::from_bytes(&serde_json::to_vec(&value).unwrap()).unwrap();

        assert_eq!(decoded.body.principal_id, body.principal_id);
        assert_eq!(decoded.schema_version, WIRE_SCHEMA_VERSION);
    }

    #[test]
    fn wire_event_rejects_newer_version() {
        let body = EventBody::new(Uuid::new_v4(), EventKind::Metering);
        let mut event = WireEvent::new(body);
        event.schema_version = WIRE_SCHEMA_VERSION + 1;
        let bytes = event.to_bytes().unwrap();
        assert!(matches!(
            WireEvent::from_bytes(&bytes),
            Err(BusError::Codec { .. })
        ));
    }
}
