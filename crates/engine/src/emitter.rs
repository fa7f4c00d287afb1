//! Builds the stable alarm wire payload described in the component design.
//!
//! The emitter itself is transport-agnostic: it hands a JSON value to an
//! injected publish function so this crate never depends on an MQTT client.
//! A publish failure here is logged by the caller but never rolls back the
//! state transition that already happened in the evaluator.

use serde_json::{json, Value};

use crate::model::{AlarmRule, AlarmState};

/// Build the alarm payload for a just-triggered state. `violation_duration_minutes`
/// uses the wire-contract name, distinct from the internal per-second duration math.
pub fn build_alarm_payload(
    rule: &AlarmRule,
    state: &AlarmState,
    current_value: f64,
    shunt_value: Option<f64>,
    now: f64,
    timestamp_iso: &str,
) -> Value {
    let mut payload = json!({
        "rule_id": rule.rule_id,
        "device_id": rule.device_id,
        "alarm_type": rule.kind,
        "description": rule.description,
        "sensor_field": rule.sensor_field,
        "current_value": current_value,
        "threshold_value": rule.threshold_value,
        "comparison_operator": rule.operator.as_str(),
        "duration_minutes": rule.duration_seconds as f64 / 60.0,
        "violation_duration_minutes": state.violation_duration_minutes(now),
        "trigger_time": state.trigger_time,
        "timestamp": timestamp_iso,
        "severity": "HIGH",
    });

    if rule.is_conditional() {
        if let Some(shunt_value) = shunt_value {
            payload["shunt_device_id"] = json!(rule.shunt_device_id);
            payload["shunt_field"] = json!(rule.shunt_field);
            payload["shunt_value"] = json!(shunt_value);
            payload["shunt_threshold"] = json!(rule.shunt_value);
            payload["shunt_operator"] = json!(rule.shunt_operator.map(|op| op.as_str()));
        }
    }

    payload
}
