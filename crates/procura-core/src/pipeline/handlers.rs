//! Per-group message handlers: ledger writer, metrics aggregator, audit
//! logger.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::{BusRecord, WireEvent};
use super::consumer::{HandlerError, MessageHandler};
use crate::clock::now_ms;
use crate::crypto::sha256;
use crate::ledger::{EventKind, LedgerWriteError, LedgerWriter};
use crate::spending::SpendingCache;
use crate::store::StoreError;

/// Consumer group writing bus events into the ledger.
pub const GROUP_LEDGER_WRITER: &str = "ledger-writer";

/// Consumer group maintaining spending metrics and trends.
pub const GROUP_METRICS: &str = "aggregator-metrics";

/// Consumer group mirroring events to the audit log sink.
pub const GROUP_AUDIT: &str = "audit-logger";

/// Spending exceeding this multiple of the trailing hourly average flags an
/// anomaly.
pub const ANOMALY_THRESHOLD_MULTIPLIER: i64 = 2;

/// Turns bus events into ledger rows.
///
/// Idempotence: the event's `producer_seq` (or a deterministic fallback
/// derived from its bus coordinates) combines with the principal id under
/// a uniqueness constraint, so redelivered messages become no-ops.
/// Producers assign non-negative sequences; the fallback lives in the
/// negative range, so the two allocation schemes can never mint the same
/// key and the constraint can only ever drop a true redelivery.
pub struct LedgerWriterHandler {
    writer: Arc<LedgerWriter>,
}

impl LedgerWriterHandler {
    /// Creates the handler around the partition's single writer.
    #[must_use]
    pub fn new(writer: Arc<LedgerWriter>) -> Self {
        Self { writer }
    }
}

impl MessageHandler for LedgerWriterHandler {
    fn handle(&self, record: &BusRecord) -> Result<(), HandlerError> {
        let event = WireEvent::from_bytes(&record.payload)
            .map_err(|e| HandlerError::new("SchemaError", e.to_string()))?;

        let mut body = event.body;
        if body.producer_seq.is_none() {
            body.producer_seq = Some(fallback_producer_seq(record));
        }

        match self.writer.append_at(&body, record.ts_ms) {
            Ok(event) => {
                debug!(
                    event_id = event.event_id,
                    principal = %event.body.principal_id,
                    kind = %event.body.kind,
                    "bus event appended to ledger"
                );
                Ok(())
            },
            // The uniqueness constraint turned a redelivery into a no-op.
            Err(LedgerWriteError::Store(StoreError::Conflict { detail })) => {
                debug!(offset = record.offset, %detail, "duplicate delivery ignored");
                Ok(())
            },
            Err(error) => Err(HandlerError::new("LedgerWriteError", error.to_string())),
        }
    }
}

/// Deterministic dedupe sequence for records that arrive without one,
/// derived from the record's immutable bus coordinates so every
/// redelivery computes the same value. Mapped into the negative range,
/// which is reserved for this fallback: producer-assigned sequences are
/// non-negative, so a derived key cannot collide with one another
/// producer minted independently.
fn fallback_producer_seq(record: &BusRecord) -> i64 {
    let key = format!(
        "{}:{}:{}",
        record.topic, record.partition, record.offset
    );
    let digest = sha256(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let masked = u64::from_be_bytes(prefix) & (i64::MAX as u64);
    // [0, i64::MAX] maps onto [i64::MIN, -1].
    -i64::try_from(masked).unwrap_or(i64::MAX) - 1
}

/// A detected spending anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendingAnomaly {
    /// The principal spending unusually.
    pub principal_id: Uuid,

    /// When the anomaly was detected, milliseconds since epoch.
    pub detected_at_ms: i64,

    /// Spend in the current hourly bucket, minor units.
    pub current_hour_minor: i64,

    /// Trailing 7-day hourly average, minor units.
    pub baseline_hourly_minor: i64,
}

/// Maintains the metrics consumer group's spending cache and trend
/// buckets, flagging principals whose current-hour spend exceeds twice
/// their trailing 7-day hourly average.
pub struct MetricsAggregatorHandler {
    cache: Arc<SpendingCache>,
    anomalies: Mutex<Vec<SpendingAnomaly>>,
}

impl MetricsAggregatorHandler {
    /// Creates the handler over the metrics-side cache.
    #[must_use]
    pub fn new(cache: Arc<SpendingCache>) -> Self {
        Self {
            cache,
            anomalies: Mutex::new(Vec::new()),
        }
    }

    /// Drains anomalies detected since the last call.
    #[must_use]
    pub fn drain_anomalies(&self) -> Vec<SpendingAnomaly> {
        std::mem::take(&mut self.anomalies.lock().unwrap())
    }
}

impl MessageHandler for MetricsAggregatorHandler {
    fn handle(&self, record: &BusRecord) -> Result<(), HandlerError> {
        let event = WireEvent::from_bytes(&record.payload)
            .map_err(|e| HandlerError::new("SchemaError", e.to_string()))?;
        let body = event.body;
        if body.kind != EventKind::Metering {
            return Ok(());
        }
        let Some(cost) = body.cost_minor_units else {
            return Ok(());
        };

        // Event time drives all cache bookkeeping so pruning and trend
        // buckets stay consistent during replays of old streams.
        let observed = record.ts_ms;
        let seq = body.producer_seq.unwrap_or(record.offset);
        self.cache
            .record_cost(body.principal_id, observed, seq, cost, observed);

        let current = self.cache.current_hour_spend(body.principal_id, observed);
        if let Some(baseline) = self.cache.hourly_average_7d(body.principal_id, observed) {
            if baseline > 0 && current > baseline.saturating_mul(ANOMALY_THRESHOLD_MULTIPLIER) {
                warn!(
                    principal = %body.principal_id,
                    current_hour_minor = current,
                    baseline_hourly_minor = baseline,
                    "spending anomaly detected"
                );
                self.anomalies.lock().unwrap().push(SpendingAnomaly {
                    principal_id: body.principal_id,
                    detected_at_ms: observed,
                    current_hour_minor: current,
                    baseline_hourly_minor: baseline,
                });
            }
        }
        Ok(())
    }
}

/// Mirrors every consumed event to a JSON-lines audit sink.
pub struct AuditLogHandler<W: Write + Send> {
    sink: Mutex<W>,
}

impl<W: Write + Send> AuditLogHandler<W> {
    /// Creates the handler over any writable sink (file, pipe, buffer).
    #[must_use]
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Consumes the handler and returns the sink.
    #[must_use]
    pub fn into_sink(self) -> W {
        self.sink.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> MessageHandler for AuditLogHandler<W> {
    fn handle(&self, record: &BusRecord) -> Result<(), HandlerError> {
        // Payload is logged verbatim if it parses, raw otherwise; the
        // audit mirror never rejects a message the ledger accepted.
        let payload: serde_json::Value = serde_json::from_slice(&record.payload)
            .unwrap_or_else(|_| json!(String::from_utf8_lossy(&record.payload)));
        let line = json!({
            "logged_at_ms": now_ms(),
            "topic": record.topic,
            "partition": record.partition,
            "offset": record.offset,
            "key": record.key,
            "event": payload,
        });

        let mut sink = self
            .sink
            .lock()
            .map_err(|_| HandlerError::new("SinkError", "audit sink poisoned"))?;
        writeln!(sink, "{line}")
            .and_then(|()| sink.flush())
            .map_err(|e| HandlerError::new("SinkError", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::clock::{DAY_MS, HOUR_MS};
    use crate::ledger::EventBody;
    use crate::spending::SpendingCacheConfig;

    fn metering_record(principal: Uuid, seq: Option<i64>, ts_ms: i64, cost: i64) -> BusRecord {
        let mut body = EventBody::new(principal, EventKind::Metering);
        body.cost_minor_units = Some(cost);
        body.currency = Some("USD".to_string());
        body.producer_seq = seq;
        BusRecord {
            topic: "metering.events".to_string(),
            partition: 0,
            offset: seq.unwrap_or(0),
            key: Some(principal.to_string()),
            payload: WireEvent::new(body).to_bytes().unwrap(),
            ts_ms,
        }
    }

    #[test]
    fn fallback_seq_is_deterministic_and_reserved_negative() {
        let a = BusRecord {
            topic: "t".to_string(),
            partition: 0,
            offset: 1,
            key: None,
            payload: Vec::new(),
            ts_ms: 0,
        };
        let mut b = a.clone();
        b.offset = 2;
        assert_eq!(fallback_producer_seq(&a), fallback_producer_seq(&a));
        assert_ne!(fallback_producer_seq(&a), fallback_producer_seq(&b));
        // The fallback range is negative, disjoint from producer-assigned
        // sequences.
        assert!(fallback_producer_seq(&a) < 0);
        assert!(fallback_producer_seq(&b) < 0);
    }

    #[test]
    fn metrics_handler_accumulates_and_flags_anomaly() {
        let cache = Arc::new(SpendingCache::new(SpendingCacheConfig {
            // Wide TTL so the 7-day baseline survives in this test.
            ttl_ms: 8 * DAY_MS,
            max_entries: 100,
        }));
        let handler = MetricsAggregatorHandler::new(cache);
        let principal = Uuid::new_v4();
        let base = 50 * DAY_MS;

        // Build a quiet baseline: 10 units/hour for 6 hours.
        for hour in 0..6 {
            let record =
                metering_record(principal, Some(hour), base + hour * HOUR_MS, 10);
            handler.handle(&record).unwrap();
        }
        assert!(handler.drain_anomalies().is_empty());

        // A burst at 10x the baseline in the next hour trips the detector.
        let burst = metering_record(principal, Some(100), base + 6 * HOUR_MS, 100);
        handler.handle(&burst).unwrap();

        let anomalies = handler.drain_anomalies();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].principal_id, principal);
        assert_eq!(anomalies[0].baseline_hourly_minor, 10);
        assert_eq!(anomalies[0].current_hour_minor, 100);
        // Draining empties the buffer.
        assert!(handler.drain_anomalies().is_empty());
    }

    #[test]
    fn metrics_handler_ignores_non_metering() {
        let cache = Arc::new(SpendingCache::new(SpendingCacheConfig::default()));
        let handler = MetricsAggregatorHandler::new(Arc::clone(&cache));
        let principal = Uuid::new_v4();

        let body = EventBody::new(principal, EventKind::DecisionAllow);
        let record = BusRecord {
            topic: "policy.decisions".to_string(),
            partition: 0,
            offset: 0,
            key: Some(principal.to_string()),
            payload: WireEvent::new(body).to_bytes().unwrap(),
            ts_ms: 1_000,
        };
        handler.handle(&record).unwrap();
        assert!(cache.snapshot(principal, 1_000).is_none());
    }

    #[test]
    fn audit_handler_writes_jsonl() {
        let handler = AuditLogHandler::new(Vec::new());
        let principal = Uuid::new_v4();
        let record = metering_record(principal, Some(7), 1_000, 42);
        handler.handle(&record).unwrap();

        let sink = handler.into_sink();
        let text = String::from_utf8(sink).unwrap();
        let line: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(line["topic"], "metering.events");
        assert_eq!(line["offset"], 7);
        assert_eq!(line["event"]["principal_id"], principal.to_string());
    }
}
