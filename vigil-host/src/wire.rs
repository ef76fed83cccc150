//! Wire codec for the agent protocol: newline-delimited JSON frames.
//!
//! Inbound frames are telemetry reports or control messages; outbound frames
//! are host commands (`AUTH_CODE`, `SHUTDOWN`). Decoding is deliberately
//! tolerant: field names match case-insensitively, unknown fields are
//! ignored, and a single bad frame is reported as an error the caller can
//! log without tearing the connection down.

use serde::Serialize;
use serde_json::{json, Map, Value};

/// One decoded sensor report from an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub cpu_usage: f64,
    pub ram_usage_percent: f64,
    pub disk_usage_percent: f64,
    /// Bytes per second sent by the agent's host.
    pub network_sent: f64,
    /// Bytes per second received by the agent's host.
    pub network_received: f64,
    pub virtual_temp: f64,
}

/// An inbound frame carrying a `type` field instead of telemetry. Agents are
/// not expected to send these; sessions log and ignore them.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFrame {
    pub kind: String,
}

/// Any successfully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Telemetry(TelemetryRecord),
    Control(ControlFrame),
}

/// Outbound host command. Immutable once constructed; serialized and
/// discarded after send.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandFrame {
    AuthChallenge { code: String, expire_sec: u32 },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The bytes were not valid UTF-8 JSON at all.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Valid JSON that does not form a usable record (wrong shape, missing
    /// or empty device identity, non-numeric gauge).
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Case-insensitive field lookup; first match wins.
fn field<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    fields
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// A numeric gauge: absent fields default to zero, as the original agent
/// payloads omitted gauges it could not sample.
fn gauge(fields: &Map<String, Value>, name: &str) -> Result<f64, DecodeError> {
    match field(fields, name) {
        None => Ok(0.0),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| DecodeError::InvalidRecord(format!("{name} is not numeric"))),
    }
}

/// Decode one frame (one line, without its newline).
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let text =
        std::str::from_utf8(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(DecodeError::InvalidRecord("frame is not a JSON object".into()));
    };

    if let Some(kind) = field(&fields, "type") {
        let kind = kind
            .as_str()
            .ok_or_else(|| DecodeError::InvalidRecord("type is not a string".into()))?;
        return Ok(Frame::Control(ControlFrame { kind: kind.to_string() }));
    }

    let device_id = match field(&fields, "deviceID") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => return Err(DecodeError::InvalidRecord("missing or empty deviceID".into())),
    };

    Ok(Frame::Telemetry(TelemetryRecord {
        device_id,
        cpu_usage: gauge(&fields, "cpuUsage")?,
        ram_usage_percent: gauge(&fields, "ramUsagePercent")?,
        disk_usage_percent: gauge(&fields, "diskUsagePercent")?,
        network_sent: gauge(&fields, "networkSent")?,
        network_received: gauge(&fields, "networkReceived")?,
        virtual_temp: gauge(&fields, "virtualTemp")?,
    }))
}

/// Encode one outbound command frame, newline-terminated. Encoding never
/// fails for the frame kinds defined here.
pub fn encode(frame: &CommandFrame) -> Vec<u8> {
    let value = match frame {
        CommandFrame::AuthChallenge { code, expire_sec } => json!({
            "type": "AUTH_CODE",
            "code": code,
            "expireSec": expire_sec,
        }),
        CommandFrame::Shutdown => json!({ "type": "SHUTDOWN" }),
    };
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}
