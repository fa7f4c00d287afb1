//! The rule evaluator and violation state machine: the part of the system
//! that turns one (rule, telemetry) pair into a state transition and,
//! sometimes, a fired alarm.

use time::OffsetDateTime;

use crate::cache::TelemetryCache;
use crate::emitter::build_alarm_payload;
use crate::error::EngineError;
use crate::model::{AlarmRule, AlarmState, AlarmStatus, Telemetry};
use crate::store::Store;

/// Outcome of evaluating one rule against one telemetry item.
#[derive(Debug)]
pub enum EvalOutcome {
    /// The field was absent or non-numeric; nothing happened.
    MissingField,
    /// State was updated (and possibly persisted); carries the alarm
    /// payload if this evaluation fired.
    Evaluated { fired: Option<serde_json::Value> },
}

/// Evaluate `rule` against `telemetry`, updating and persisting state as
/// described by the transition table. `now` is the evaluator wall clock in
/// unix seconds; `now_iso` is its ISO-8601 rendering for the alarm payload.
///
/// Errors here are the caller's to isolate: one rule's evaluation failing
/// must never affect any other rule's evaluation of the same telemetry item.
pub async fn evaluate_rule(
    store: &Store,
    cache: &TelemetryCache,
    rule: &AlarmRule,
    telemetry: &Telemetry,
    shunt_freshness_seconds: f64,
    now: f64,
) -> Result<EvalOutcome, EngineError> {
    let Some(value) = telemetry.field(&rule.sensor_field) else {
        tracing::debug!(rule_id = %rule.rule_id, field = %rule.sensor_field, "eval.missing_field");
        return Ok(EvalOutcome::MissingField);
    };

    let primary = rule.operator.compare(value, rule.threshold_value);

    let (shunt_satisfied, shunt_value) = if rule.is_conditional() {
        let shunt_device_id = rule.shunt_device_id.as_deref().unwrap_or_default();
        let shunt_field = rule.shunt_field.as_deref().unwrap_or_default();
        match cache
            .fresh_field(shunt_device_id, shunt_field, now, shunt_freshness_seconds)
            .await
        {
            Some(sv) => {
                let op = rule.shunt_operator.expect("validated conditional rule");
                let threshold = rule.shunt_value.expect("validated conditional rule");
                (op.compare(sv, threshold), Some(sv))
            }
            None => (false, None), // shunt-unknown: stale, missing device, or missing field
        }
    } else {
        (true, None)
    };

    let condition = primary && shunt_satisfied;

    let mut state = match store.get_state(&rule.rule_id).await? {
        Some(s) => s,
        None => AlarmState::new_inactive(&rule.rule_id, &rule.device_id, now),
    };

    let prior_status = state.status;
    let mut fired_payload = None;
    let mut changed = true;

    match (prior_status, condition) {
        (AlarmStatus::Inactive, false) => {
            changed = false; // literal no-op per the transition table
        }
        (AlarmStatus::Inactive, true) => {
            state.violation_start = Some(now);
            state.last_violation = Some(now);
            state.violation_count = 1;
            state.last_value = Some(value);
            state.last_shunt_value = shunt_value;
            state.status = AlarmStatus::Active;
        }
        (AlarmStatus::Active, false) | (AlarmStatus::Triggered, false) | (AlarmStatus::Acknowledged, false) => {
            clear_violation(&mut state);
        }
        (AlarmStatus::Active, true) => {
            state.last_violation = Some(now);
            state.violation_count += 1;
            state.last_value = Some(value);
            if let Some(sv) = shunt_value {
                state.last_shunt_value = Some(sv);
            }
            let duration = now - state.violation_start.unwrap_or(now);
            if duration >= rule.duration_seconds as f64 {
                state.status = AlarmStatus::Triggered;
                state.trigger_time = Some(now);
                let timestamp_iso = OffsetDateTime::from_unix_timestamp(now as i64)
                    .ok()
                    .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
                    .unwrap_or_default();
                fired_payload = Some(build_alarm_payload(
                    rule,
                    &state,
                    value,
                    shunt_value,
                    now,
                    &timestamp_iso,
                ));
            }
        }
        (AlarmStatus::Triggered, true) => {
            // true -> true on an already-triggered rule is a pure count/update;
            // the fire-once guarantee means we never re-emit here.
            state.last_violation = Some(now);
            state.violation_count += 1;
            state.last_value = Some(value);
            if let Some(sv) = shunt_value {
                state.last_shunt_value = Some(sv);
            }
        }
        (AlarmStatus::Acknowledged, true) => {
            state.last_violation = Some(now);
        }
    }

    if !changed {
        return Ok(EvalOutcome::Evaluated { fired: None });
    }

    state.updated_at = now;

    if let Some(ref payload) = fired_payload {
        store
            .save_state_and_history(&state, payload, now)
            .await?;
    } else {
        store.save_state(&state).await?;
    }

    Ok(EvalOutcome::Evaluated { fired: fired_payload })
}

fn clear_violation(state: &mut AlarmState) {
    state.status = AlarmStatus::Inactive;
    state.violation_start = None;
    state.last_violation = None;
    state.violation_count = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlarmKind, ComparisonOperator};
    use std::collections::HashMap;

    fn simple_rule() -> AlarmRule {
        AlarmRule {
            rule_id: "r1".into(),
            device_id: "device-1".into(),
            kind: AlarmKind::SimpleThreshold,
            sensor_field: "temperature".into(),
            threshold_value: 30.0,
            operator: ComparisonOperator::GreaterThan,
            duration_seconds: 120,
            description: "too hot".into(),
            enabled: true,
            shunt_device_id: None,
            shunt_field: None,
            shunt_value: None,
            shunt_operator: None,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    fn conditional_rule() -> AlarmRule {
        let mut rule = simple_rule();
        rule.rule_id = "r2".into();
        rule.kind = AlarmKind::ConditionalThreshold;
        rule.threshold_value = 28.0;
        rule.duration_seconds = 180;
        rule.shunt_device_id = Some("device-1".into());
        rule.shunt_field = Some("current".into());
        rule.shunt_value = Some(0.0);
        rule.shunt_operator = Some(ComparisonOperator::GreaterThan);
        rule
    }

    fn telemetry(device_id: &str, fields: &[(&str, f64)], arrival: f64, seq: u64) -> Telemetry {
        let mut map = HashMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), *v);
        }
        Telemetry {
            device_id: device_id.to_string(),
            fields: map,
            source_timestamp: None,
            arrival_timestamp: arrival,
            seq,
        }
    }

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn missing_field_is_a_no_op() {
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let rule = simple_rule();
        let t = telemetry("device-1", &[("humidity", 50.0)], 0.0, 0);

        let outcome = evaluate_rule(&store, &cache, &rule, &t, 120.0, 0.0)
            .await
            .unwrap();
        assert!(matches!(outcome, EvalOutcome::MissingField));
        assert!(store.get_state("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inactive_false_does_not_write_a_state_row() {
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let rule = simple_rule();
        let t = telemetry("device-1", &[("temperature", 20.0)], 0.0, 0);

        evaluate_rule(&store, &cache, &rule, &t, 120.0, 0.0)
            .await
            .unwrap();
        assert!(store.get_state("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scenario_1_fires_exactly_once_after_duration() {
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let rule = simple_rule();

        let mut fired_at = Vec::new();
        for t in [0.0, 30.0, 60.0, 90.0, 120.0] {
            let telemetry = telemetry("device-1", &[("temperature", 32.0)], t, t as u64);
            let outcome = evaluate_rule(&store, &cache, &rule, &telemetry, 120.0, t)
                .await
                .unwrap();
            if let EvalOutcome::Evaluated { fired: Some(payload) } = outcome {
                fired_at.push((t, payload));
            }
        }

        assert_eq!(fired_at.len(), 1);
        let (t, payload) = &fired_at[0];
        assert_eq!(*t, 120.0);
        assert_eq!(payload["current_value"], 32.0);
        assert!(payload["violation_duration_minutes"].as_f64().unwrap() >= 2.0);

        let state = store.get_state("r1").await.unwrap().unwrap();
        assert_eq!(state.status, AlarmStatus::Triggered);
    }

    #[tokio::test]
    async fn scenario_2_cleared_before_duration_fires_nothing() {
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let rule = simple_rule();

        for t in [0.0, 30.0, 60.0] {
            let telemetry = telemetry("device-1", &[("temperature", 32.0)], t, t as u64);
            evaluate_rule(&store, &cache, &rule, &telemetry, 120.0, t)
                .await
                .unwrap();
        }
        let telemetry = telemetry("device-1", &[("temperature", 25.0)], 90.0, 90);
        let outcome = evaluate_rule(&store, &cache, &rule, &telemetry, 120.0, 90.0)
            .await
            .unwrap();
        assert!(matches!(outcome, EvalOutcome::Evaluated { fired: None }));

        let state = store.get_state("r1").await.unwrap().unwrap();
        assert_eq!(state.status, AlarmStatus::Inactive);
        assert!(state.violation_start.is_none());
    }

    #[tokio::test]
    async fn scenario_3_conditional_requires_fresh_shunt() {
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let rule = conditional_rule();

        // Five minutes of temperature above threshold but current=0 (shunt false):
        // no alarm, and no violation ever starts because condition is false throughout.
        for t in (0..300).step_by(30) {
            let t = t as f64;
            let telem = telemetry("device-1", &[("temperature", 29.0), ("current", 0.0)], t, t as u64);
            cache.put(&telem).await;
            let outcome = evaluate_rule(&store, &cache, &rule, &telem, 120.0, t)
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                EvalOutcome::Evaluated { fired: None } | EvalOutcome::MissingField
            ));
        }
        assert!(store.get_state("r2").await.unwrap().is_none());

        // Now current=1 holds for long enough to cross duration (180s) from when
        // shunt first became true.
        let mut fired = false;
        for t in (300..600).step_by(30) {
            let t = t as f64;
            let telem = telemetry("device-1", &[("temperature", 29.0), ("current", 1.0)], t, t as u64);
            cache.put(&telem).await;
            let outcome = evaluate_rule(&store, &cache, &rule, &telem, 120.0, t)
                .await
                .unwrap();
            if let EvalOutcome::Evaluated { fired: Some(_) } = outcome {
                fired = true;
            }
        }
        assert!(fired);
    }

    #[tokio::test]
    async fn scenario_4_restart_preserves_episode_start() {
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let rule = simple_rule();

        for t in [0.0, 30.0] {
            let telemetry = telemetry("device-1", &[("temperature", 32.0)], t, t as u64);
            evaluate_rule(&store, &cache, &rule, &telemetry, 120.0, t)
                .await
                .unwrap();
        }

        // Simulate a restart: drop and reconstruct the in-memory cache, keep the store.
        let cache_after_restart = TelemetryCache::new();

        for t in [90.0, 120.0] {
            let telemetry = telemetry("device-1", &[("temperature", 32.0)], t, t as u64);
            let outcome = evaluate_rule(&store, &cache_after_restart, &rule, &telemetry, 120.0, t)
                .await
                .unwrap();
            if t == 120.0 {
                assert!(matches!(outcome, EvalOutcome::Evaluated { fired: Some(_) }));
            }
        }

        let state = store.get_state("r1").await.unwrap().unwrap();
        assert_eq!(state.violation_start, Some(0.0));
    }

    #[tokio::test]
    async fn triggered_true_never_refires() {
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let rule = simple_rule();

        for t in [0.0, 30.0, 60.0, 90.0, 120.0] {
            let telemetry = telemetry("device-1", &[("temperature", 32.0)], t, t as u64);
            evaluate_rule(&store, &cache, &rule, &telemetry, 120.0, t)
                .await
                .unwrap();
        }

        // Continue past trigger; must never fire again without passing through inactive.
        for t in [150.0, 180.0, 210.0] {
            let telemetry = telemetry("device-1", &[("temperature", 32.0)], t, t as u64);
            let outcome = evaluate_rule(&store, &cache, &rule, &telemetry, 120.0, t)
                .await
                .unwrap();
            assert!(matches!(outcome, EvalOutcome::Evaluated { fired: None }));
        }
    }

    #[tokio::test]
    async fn disabled_rule_still_evaluates_if_caller_passes_it_in() {
        // Disabling is the dispatcher's responsibility (it filters rules
        // before scheduling evaluation); the evaluator itself has no
        // opinion about `enabled` and would happily evaluate a disabled
        // rule if handed one. This test documents that boundary.
        let store = memory_store().await;
        let cache = TelemetryCache::new();
        let mut rule = simple_rule();
        rule.enabled = false;

        for t in [0.0, 30.0, 60.0, 90.0, 120.0] {
            let telemetry = telemetry("device-1", &[("temperature", 32.0)], t, t as u64);
            evaluate_rule(&store, &cache, &rule, &telemetry, 120.0, t)
                .await
                .unwrap();
        }
        let state = store.get_state("r1").await.unwrap().unwrap();
        assert_eq!(state.status, AlarmStatus::Triggered);
    }
}
