//! Core data model: alarm rules, alarm state, history records, and the
//! ephemeral telemetry values the pipeline passes around.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    SimpleThreshold,
    ConditionalThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

/// Absolute epsilon used for `==`/`!=` comparisons on floating point readings.
pub const FLOAT_EPSILON: f64 = 1e-6;

impl ComparisonOperator {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            ">" => Self::GreaterThan,
            "<" => Self::LessThan,
            ">=" => Self::GreaterEqual,
            "<=" => Self::LessEqual,
            "==" => Self::Equal,
            "!=" => Self::NotEqual,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }

    /// Evaluate `value <op> threshold`. NaN is false for every ordering
    /// comparison and for `==`, true for `!=`.
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        if value.is_nan() {
            return matches!(self, Self::NotEqual);
        }
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < FLOAT_EPSILON,
            Self::NotEqual => (value - threshold).abs() >= FLOAT_EPSILON,
        }
    }
}

/// An immutable description of a condition to monitor. Conditional rules
/// carry a second ("shunt") predicate, possibly on a different device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRule {
    pub rule_id: String,
    pub device_id: String,
    pub kind: AlarmKind,
    pub sensor_field: String,
    pub threshold_value: f64,
    pub operator: ComparisonOperator,
    /// Minimum sustained violation before firing, normalized to seconds.
    pub duration_seconds: i64,
    pub description: String,
    pub enabled: bool,

    pub shunt_device_id: Option<String>,
    pub shunt_field: Option<String>,
    pub shunt_value: Option<f64>,
    pub shunt_operator: Option<ComparisonOperator>,

    pub created_at: f64,
    pub updated_at: f64,
}

impl AlarmRule {
    pub fn is_conditional(&self) -> bool {
        matches!(self.kind, AlarmKind::ConditionalThreshold)
    }

    /// Validate the rule against the invariants in the data model: ids and
    /// sensor field non-empty, duration positive, and shunt fields present
    /// iff the rule is conditional.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.rule_id.trim().is_empty() {
            return Err(EngineError::Validation("rule_id must not be empty".into()));
        }
        if self.device_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "device_id must not be empty".into(),
            ));
        }
        if self.sensor_field.trim().is_empty() {
            return Err(EngineError::Validation(
                "sensor_field must not be empty".into(),
            ));
        }
        if self.duration_seconds <= 0 {
            return Err(EngineError::Validation(
                "duration_seconds must be > 0".into(),
            ));
        }
        match self.kind {
            AlarmKind::ConditionalThreshold => {
                let complete = self.shunt_device_id.is_some()
                    && self.shunt_field.is_some()
                    && self.shunt_value.is_some()
                    && self.shunt_operator.is_some();
                if !complete {
                    return Err(EngineError::Validation(
                        "conditional_threshold rules require all four shunt fields".into(),
                    ));
                }
            }
            AlarmKind::SimpleThreshold => {
                let any_set = self.shunt_device_id.is_some()
                    || self.shunt_field.is_some()
                    || self.shunt_value.is_some()
                    || self.shunt_operator.is_some();
                if any_set {
                    return Err(EngineError::Validation(
                        "simple_threshold rules must not set shunt fields".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmStatus {
    Inactive,
    Active,
    Triggered,
    Acknowledged,
}

impl AlarmStatus {
    pub fn is_violation_active(&self) -> bool {
        matches!(self, Self::Active | Self::Triggered)
    }
}

/// Per-rule mutable state tracking the current (or most recent) violation
/// episode. At most one row exists per `rule_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmState {
    pub rule_id: String,
    pub device_id: String,
    pub status: AlarmStatus,
    pub violation_start: Option<f64>,
    pub last_violation: Option<f64>,
    pub trigger_time: Option<f64>,
    pub acknowledge_time: Option<f64>,
    pub violation_count: i64,
    pub last_value: Option<f64>,
    pub last_shunt_value: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
}

impl AlarmState {
    pub fn new_inactive(rule_id: impl Into<String>, device_id: impl Into<String>, now: f64) -> Self {
        Self {
            rule_id: rule_id.into(),
            device_id: device_id.into(),
            status: AlarmStatus::Inactive,
            violation_start: None,
            last_violation: None,
            trigger_time: None,
            acknowledge_time: None,
            violation_count: 0,
            last_value: None,
            last_shunt_value: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Duration of the current episode in minutes, 0.0 if none is open.
    pub fn violation_duration_minutes(&self, now: f64) -> f64 {
        match self.violation_start {
            Some(start) => (now - start) / 60.0,
            None => 0.0,
        }
    }
}

/// Append-only record of a fire event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmHistoryRecord {
    pub seq: i64,
    pub rule_id: String,
    pub device_id: String,
    pub alarm_payload: serde_json::Value,
    pub timestamp: f64,
}

/// A decoded sensor reading, ready for dispatch.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub device_id: String,
    pub fields: HashMap<String, f64>,
    pub source_timestamp: Option<i64>,
    pub arrival_timestamp: f64,
    /// Monotonic sequence number assigned at intake, used for ordering
    /// diagnostics and per-rule in-order delivery.
    pub seq: u64,
}

impl Telemetry {
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}
