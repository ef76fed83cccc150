//! Persistence collaborator boundary.
//!
//! The ingestion core hands every decoded record and every dispatched
//! command to a [`TelemetrySink`] and moves on. Sink failures are the
//! implementation's problem; nothing here is allowed to surface on the wire
//! or block a session's read loop.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::info;

use crate::wire::TelemetryRecord;

/// One dispatched operator command, for the audit trail.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub operator: String,
    /// `None` for a broadcast.
    pub target_device: Option<String>,
    pub command: String,
    pub value: Option<String>,
    pub at: OffsetDateTime,
}

impl AuditEntry {
    pub fn new(
        operator: &str,
        target_device: Option<&str>,
        command: &str,
        value: Option<&str>,
    ) -> Self {
        Self {
            operator: operator.to_string(),
            target_device: target_device.map(str::to_string),
            command: command.to_string(),
            value: value.map(str::to_string),
            at: OffsetDateTime::now_utc(),
        }
    }
}

/// Where decoded telemetry and command audits go.
///
/// Both methods must return promptly: implementations buffer or queue
/// internally, and swallow their own failures.
pub trait TelemetrySink: Send + Sync {
    fn submit_telemetry(&self, record: TelemetryRecord);
    fn submit_audit(&self, entry: AuditEntry);
}

/// Sink that writes everything to the structured log. What the standalone
/// binary uses when no database collaborator is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn submit_telemetry(&self, record: TelemetryRecord) {
        info!(
            device = %record.device_id,
            cpu = record.cpu_usage,
            ram = record.ram_usage_percent,
            disk = record.disk_usage_percent,
            sent = record.network_sent,
            received = record.network_received,
            temp = record.virtual_temp,
            "telemetry"
        );
    }

    fn submit_audit(&self, entry: AuditEntry) {
        info!(
            operator = %entry.operator,
            target = entry.target_device.as_deref().unwrap_or("*"),
            command = %entry.command,
            "command dispatched"
        );
    }
}

/// A record plus its arrival timestamp, as stored.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub received_at: OffsetDateTime,
    pub record: TelemetryRecord,
}

/// Bounded in-memory store keyed by device identity.
///
/// Serves the dashboard-style queries (most recent record per device, a
/// bounded history window per device) and doubles as the assertion point in
/// tests. Per-device history is capped; the oldest records fall off first.
pub struct MemorySink {
    history_limit: usize,
    telemetry: Mutex<HashMap<String, VecDeque<StoredRecord>>>,
    audits: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    const DEFAULT_HISTORY_LIMIT: usize = 256;

    pub fn new() -> Self {
        Self::with_history_limit(Self::DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
            telemetry: Mutex::new(HashMap::new()),
            audits: Mutex::new(Vec::new()),
        }
    }

    /// Total number of stored records across all devices.
    pub fn record_count(&self) -> usize {
        self.telemetry.lock().values().map(VecDeque::len).sum()
    }

    /// Most recent record for one device.
    pub fn latest(&self, device_id: &str) -> Option<StoredRecord> {
        self.telemetry
            .lock()
            .get(device_id)
            .and_then(|history| history.back().cloned())
    }

    /// Most recent record per known device.
    pub fn latest_per_device(&self) -> HashMap<String, StoredRecord> {
        self.telemetry
            .lock()
            .iter()
            .filter_map(|(device, history)| {
                history.back().map(|stored| (device.clone(), stored.clone()))
            })
            .collect()
    }

    /// Up to `limit` most recent records for one device, oldest first.
    pub fn history(&self, device_id: &str, limit: usize) -> Vec<StoredRecord> {
        self.telemetry
            .lock()
            .get(device_id)
            .map(|history| {
                history
                    .iter()
                    .skip(history.len().saturating_sub(limit))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn audits(&self) -> Vec<AuditEntry> {
        self.audits.lock().clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for MemorySink {
    fn submit_telemetry(&self, record: TelemetryRecord) {
        let mut telemetry = self.telemetry.lock();
        let history = telemetry.entry(record.device_id.clone()).or_default();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(StoredRecord { received_at: OffsetDateTime::now_utc(), record });
    }

    fn submit_audit(&self, entry: AuditEntry) {
        self.audits.lock().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device_id: &str, cpu: f64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            cpu_usage: cpu,
            ram_usage_percent: 0.0,
            disk_usage_percent: 0.0,
            network_sent: 0.0,
            network_received: 0.0,
            virtual_temp: 0.0,
        }
    }

    #[test]
    fn history_is_capped_per_device() {
        let sink = MemorySink::with_history_limit(3);
        for cpu in 0..5 {
            sink.submit_telemetry(record("Agent-01", cpu as f64));
        }

        let history = sink.history("Agent-01", 10);
        assert_eq!(history.len(), 3);
        // Oldest first, oldest entries dropped.
        assert_eq!(history[0].record.cpu_usage, 2.0);
        assert_eq!(history[2].record.cpu_usage, 4.0);
    }

    #[test]
    fn latest_per_device_tracks_the_newest_record() {
        let sink = MemorySink::new();
        sink.submit_telemetry(record("Agent-01", 10.0));
        sink.submit_telemetry(record("Agent-01", 20.0));
        sink.submit_telemetry(record("Agent-02", 30.0));

        let latest = sink.latest_per_device();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["Agent-01"].record.cpu_usage, 20.0);
        assert_eq!(latest["Agent-02"].record.cpu_usage, 30.0);
        assert_eq!(sink.latest("Agent-01").unwrap().record.cpu_usage, 20.0);
    }

    #[test]
    fn history_window_is_bounded_and_ordered() {
        let sink = MemorySink::new();
        for cpu in 0..10 {
            sink.submit_telemetry(record("Agent-01", cpu as f64));
        }

        let window = sink.history("Agent-01", 4);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].record.cpu_usage, 6.0);
        assert_eq!(window[3].record.cpu_usage, 9.0);
        assert!(sink.history("Agent-99", 4).is_empty());
    }

    #[test]
    fn audits_accumulate_in_order() {
        let sink = MemorySink::new();
        sink.submit_audit(AuditEntry::new("host", Some("Agent-01"), "SHUTDOWN", None));
        sink.submit_audit(AuditEntry::new("host", None, "SHUTDOWN", None));

        let audits = sink.audits();
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[0].target_device.as_deref(), Some("Agent-01"));
        assert_eq!(audits[1].target_device, None);
    }
}
