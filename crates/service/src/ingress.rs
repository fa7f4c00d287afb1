//! Topic/payload decoding: turns raw MQTT publishes into `Telemetry` values.

use std::collections::HashMap;

use alarm_engine_core::Telemetry;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct SensorPayload {
    device_id: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(flatten)]
    fields: HashMap<String, serde_json::Value>,
}

/// Extract the device id from `sensors/<device_id>/data`.
pub fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "sensors" && parts[2] == "data" {
        Some(parts[1])
    } else {
        None
    }
}

/// Decode a sensor payload into `Telemetry`. `topic_device_id` wins over a
/// disagreeing `device_id` field in the payload (observed in the source);
/// a mismatch is logged as a warning rather than rejected.
pub fn decode_telemetry(topic_device_id: &str, payload: &[u8], arrival_timestamp: f64, seq: u64) -> Option<Telemetry> {
    let parsed: SensorPayload = match serde_json::from_slice(payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "ingress.baddecode: payload did not parse as JSON");
            return None;
        }
    };

    if parsed.device_id != topic_device_id {
        warn!(
            topic_device_id,
            payload_device_id = %parsed.device_id,
            "device_id mismatch between topic and payload; topic wins"
        );
    }

    let mut fields = HashMap::new();
    for (key, value) in parsed.fields {
        if key == "timestamp" {
            continue;
        }
        if let Some(n) = value.as_f64() {
            fields.insert(key, n);
        }
    }

    if fields.is_empty() {
        warn!(device_id = topic_device_id, "ingress.baddecode: payload had no numeric fields");
        return None;
    }

    Some(Telemetry {
        device_id: topic_device_id.to_string(),
        fields,
        source_timestamp: parsed.timestamp,
        arrival_timestamp,
        seq,
    })
}
