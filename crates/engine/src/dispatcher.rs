//! Dispatcher: turns decoded telemetry into rule evaluations without letting
//! a burst on one device, or a slow rule, stall evaluation of anything else.
//!
//! Telemetry arrives on a single bounded intake queue (default capacity 500)
//! and is dropped — never blocked on — past that point. Matching rules for
//! the telemetry's device are looked up once, then each (rule, telemetry)
//! pair is routed to one of a fixed ring of worker lanes, chosen by hashing
//! the rule id. Every evaluation of a given rule lands on the same lane and
//! lanes drain their channel in arrival order, so a rule's evaluations are
//! always processed one at a time in the order they arrived — the guarantee
//! the original single-threaded drain loop gave up when it handed work to an
//! unsynchronized thread pool.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::cache::TelemetryCache;
use crate::evaluator::{evaluate_rule, EvalOutcome};
use crate::model::{AlarmRule, Telemetry};
use crate::store::Store;

pub const DEFAULT_INTAKE_CAPACITY: usize = 500;
pub const DEFAULT_WORKER_LANES: usize = 20;

/// Cheap atomic counters a running service can log or expose periodically.
#[derive(Default)]
pub struct DispatcherMetrics {
    pub intake_dropped: AtomicU64,
    pub evaluated: AtomicU64,
    pub fired: AtomicU64,
}

/// Owns the intake queue and worker lanes for as long as it's alive. Dropping
/// it without calling `shutdown` detaches the intake/lane tasks, which then
/// keep running until their channels drain on their own; callers that need a
/// bounded, deterministic shutdown should call `shutdown` instead of `drop`.
pub struct Dispatcher {
    intake_tx: mpsc::Sender<Telemetry>,
    metrics: Arc<DispatcherMetrics>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    /// Spawn the intake task and `worker_lanes` lane tasks. `alarm_tx` is the
    /// channel fired alarm payloads are forwarded to for publication; the
    /// dispatcher itself has no opinion about how they're transported.
    pub fn spawn(
        store: Store,
        cache: Arc<TelemetryCache>,
        alarm_tx: mpsc::Sender<serde_json::Value>,
        shunt_freshness_seconds: f64,
        intake_capacity: usize,
        worker_lanes: usize,
    ) -> Self {
        let lane_count = worker_lanes.max(1);
        let metrics = Arc::new(DispatcherMetrics::default());
        let (intake_tx, mut intake_rx) = mpsc::channel::<Telemetry>(intake_capacity.max(1));

        let mut lane_txs = Vec::with_capacity(lane_count);
        let mut tasks = JoinSet::new();

        for lane_index in 0..lane_count {
            let (lane_tx, mut lane_rx) =
                mpsc::channel::<(AlarmRule, Arc<Telemetry>)>(intake_capacity.max(1));
            let lane_store = store.clone();
            let lane_cache = Arc::clone(&cache);
            let lane_alarm_tx = alarm_tx.clone();
            let lane_metrics = Arc::clone(&metrics);

            tasks.spawn(async move {
                while let Some((rule, telemetry)) = lane_rx.recv().await {
                    let now = telemetry.arrival_timestamp;
                    let outcome = evaluate_rule(
                        &lane_store,
                        &lane_cache,
                        &rule,
                        telemetry.as_ref(),
                        shunt_freshness_seconds,
                        now,
                    )
                    .await;

                    match outcome {
                        Ok(EvalOutcome::Evaluated { fired: Some(payload) }) => {
                            lane_metrics.fired.fetch_add(1, Ordering::Relaxed);
                            if lane_alarm_tx.send(payload).await.is_err() {
                                warn!(lane = lane_index, "alarm publish channel closed, dropping fired alarm");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(
                                lane = lane_index,
                                rule_id = %rule.rule_id,
                                error = %e,
                                "rule evaluation failed, state left unchanged"
                            );
                        }
                    }
                    lane_metrics.evaluated.fetch_add(1, Ordering::Relaxed);
                }
            });

            lane_txs.push(lane_tx);
        }

        let intake_store = store;
        let intake_cache = cache;
        tasks.spawn(async move {
            while let Some(telemetry) = intake_rx.recv().await {
                intake_cache.put(&telemetry).await;
                let telemetry = Arc::new(telemetry);

                let rules = match intake_store
                    .list_rules(Some(&telemetry.device_id), true)
                    .await
                {
                    Ok(rules) => rules,
                    Err(e) => {
                        error!(
                            device_id = %telemetry.device_id,
                            error = %e,
                            "rule lookup failed, dropping telemetry item"
                        );
                        continue;
                    }
                };

                for rule in rules {
                    let lane = lane_for_rule(&rule.rule_id, lane_count);
                    if lane_txs[lane].send((rule, Arc::clone(&telemetry))).await.is_err() {
                        error!(lane, "worker lane closed unexpectedly");
                    }
                }
            }
        });

        Self {
            intake_tx,
            metrics,
            tasks,
        }
    }

    /// Submit telemetry for evaluation. Never blocks: if the intake queue is
    /// full the item is dropped and `intake_dropped` is incremented.
    pub fn submit(&self, telemetry: Telemetry) {
        if self.intake_tx.try_send(telemetry).is_err() {
            self.metrics.intake_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("intake queue full, dropping telemetry item");
        }
    }

    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop accepting new telemetry and wait up to `deadline` for in-flight
    /// evaluations to drain. Lanes still running past the deadline are
    /// aborted rather than left to finish unbounded; telemetry items still
    /// sitting in the intake/lane channels at that point are discarded
    /// without being evaluated, matching the no-mutation-for-dropped-items
    /// guarantee.
    pub async fn shutdown(self, deadline: Duration) {
        drop(self.intake_tx);
        if tokio::time::timeout(deadline, self.tasks.join_all())
            .await
            .is_err()
        {
            warn!("dispatcher shutdown deadline reached; aborting in-flight evaluations");
        }
    }
}

/// Deterministic rule_id -> lane assignment. The same rule always lands on
/// the same lane for the lifetime of a process, which is what gives a rule's
/// evaluations their strict in-order, one-at-a-time processing.
fn lane_for_rule(rule_id: &str, lane_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    rule_id.hash(&mut hasher);
    (hasher.finish() as usize) % lane_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlarmKind, AlarmStatus, ComparisonOperator};
    use std::collections::HashMap;
    use std::time::Duration;

    fn rule(rule_id: &str, device_id: &str, threshold: f64) -> AlarmRule {
        AlarmRule {
            rule_id: rule_id.into(),
            device_id: device_id.into(),
            kind: AlarmKind::SimpleThreshold,
            sensor_field: "temperature".into(),
            threshold_value: threshold,
            operator: ComparisonOperator::GreaterThan,
            duration_seconds: 60,
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

    fn telemetry(device_id: &str, temperature: f64, arrival: f64) -> Telemetry {
        let mut fields = HashMap::new();
        fields.insert("temperature".to_string(), temperature);
        Telemetry {
            device_id: device_id.to_string(),
            fields,
            source_timestamp: None,
            arrival_timestamp: arrival,
            seq: arrival as u64,
        }
    }

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[test]
    fn lane_assignment_is_stable_and_in_range() {
        for id in ["r1", "r2", "device-7-hot", ""] {
            let a = lane_for_rule(id, 20);
            let b = lane_for_rule(id, 20);
            assert_eq!(a, b);
            assert!(a < 20);
        }
    }

    #[test]
    fn lane_assignment_spreads_across_many_rules() {
        let lanes: std::collections::HashSet<usize> = (0..200)
            .map(|i| lane_for_rule(&format!("rule-{i}"), 20))
            .collect();
        // not a uniformity guarantee, just confirms we aren't collapsing
        // everything onto a single lane
        assert!(lanes.len() > 1);
    }

    #[tokio::test]
    async fn submitted_telemetry_drives_rule_evaluation_to_completion() {
        let store = memory_store().await;
        let r = rule("r1", "device-1", 30.0);
        store.upsert_rule(&r).await.unwrap();

        let cache = Arc::new(TelemetryCache::new());
        let (alarm_tx, mut alarm_rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::spawn(store.clone(), cache, alarm_tx, 120.0, 10, 4);

        for t in [0.0, 20.0, 40.0, 60.0] {
            dispatcher.submit(telemetry("device-1", 35.0, t));
        }

        let fired = tokio::time::timeout(Duration::from_secs(1), alarm_rx.recv())
            .await
            .expect("alarm should fire within timeout")
            .unwrap();
        assert_eq!(fired["rule_id"], "r1");

        let state = store.get_state("r1").await.unwrap().unwrap();
        assert_eq!(state.status, AlarmStatus::Triggered);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn intake_queue_drops_rather_than_blocks_when_full() {
        let store = memory_store().await;
        let cache = Arc::new(TelemetryCache::new());
        let (alarm_tx, _alarm_rx) = mpsc::channel(8);
        // capacity 1: on a current-thread runtime the intake task cannot run
        // until this test yields, so back-to-back submits below fill the
        // channel and overflow synchronously.
        let dispatcher = Dispatcher::spawn(store, cache, alarm_tx, 120.0, 1, 2);

        for t in 0..10 {
            dispatcher.submit(telemetry("device-1", 10.0, t as f64));
        }

        assert!(dispatcher.metrics().intake_dropped.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_work_within_deadline() {
        let store = memory_store().await;
        let r = rule("r1", "device-1", 30.0);
        store.upsert_rule(&r).await.unwrap();

        let cache = Arc::new(TelemetryCache::new());
        let (alarm_tx, mut alarm_rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::spawn(store.clone(), cache, alarm_tx, 120.0, 10, 4);
        dispatcher.submit(telemetry("device-1", 35.0, 0.0));

        dispatcher.shutdown(Duration::from_secs(1)).await;

        // the lane task had time to finish and close its alarm_tx clone
        assert!(alarm_rx.recv().await.is_some());
    }
}
