//! SQLite-backed durable store for rules, states, and alarm history.
//!
//! Three tables, one JSON blob column each for `rule_data`/`state_data`/
//! `alarm_data` — the row shape the persisted state layout specifies.
//! Writes that must be atomic (save state + append history) run inside a
//! single `sqlx` transaction.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};

use crate::error::{classify_sqlx_error, EngineError};
use crate::model::{AlarmHistoryRecord, AlarmRule, AlarmState};

/// Number of attempts (including the first) made against a store-transient
/// failure before it is surfaced to the caller.
const MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// `db_url` examples: `"sqlite:/var/lib/alarm-engine/alarms.db"`,
    /// `"sqlite::memory:"` (tests).
    pub async fn connect(db_url: &str) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("invalid sqlite url")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(classify_sqlx_error)?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e).context("migration failed")))
    }

    /// Run `op` against the store, retrying store-transient failures with
    /// linear backoff up to `MAX_RETRIES` attempts total.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let classified = classify_sqlx_error(e);
                    match classified {
                        EngineError::StoreTransient(_) if attempt < MAX_RETRIES => {
                            tokio::time::sleep(Duration::from_millis(25 * attempt as u64)).await;
                            continue;
                        }
                        other => return Err(other),
                    }
                }
            }
        }
    }

    // -- Rules ---------------------------------------------------------

    pub async fn upsert_rule(&self, rule: &AlarmRule) -> Result<(), EngineError> {
        let rule_data = serde_json::to_string(rule)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        self.with_retry(|| {
            let rule_data = rule_data.clone();
            async {
                sqlx::query(
                    "INSERT INTO alarm_rules (rule_id, device_id, rule_data, enabled, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(rule_id) DO UPDATE SET
                        device_id = excluded.device_id,
                        rule_data = excluded.rule_data,
                        enabled = excluded.enabled,
                        updated_at = excluded.updated_at",
                )
                .bind(&rule.rule_id)
                .bind(&rule.device_id)
                .bind(rule_data)
                .bind(rule.enabled as i64)
                .bind(rule.created_at)
                .bind(rule.updated_at)
                .execute(&self.pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<Option<AlarmRule>, EngineError> {
        let row = self
            .with_retry(|| async {
                sqlx::query("SELECT rule_data FROM alarm_rules WHERE rule_id = ?")
                    .bind(rule_id)
                    .fetch_optional(&self.pool)
                    .await
            })
            .await?;
        row.map(|r| {
            let data: String = r.get(0);
            serde_json::from_str(&data).map_err(|e| EngineError::Other(anyhow::anyhow!(e)))
        })
        .transpose()
    }

    /// List rules, optionally filtered by device and/or enabled=true.
    pub async fn list_rules(
        &self,
        device_id: Option<&str>,
        enabled_only: bool,
    ) -> Result<Vec<AlarmRule>, EngineError> {
        let rows = self
            .with_retry(|| async {
                let mut qb = QueryBuilder::new("SELECT rule_data FROM alarm_rules WHERE 1 = 1");
                if let Some(device_id) = device_id {
                    qb.push(" AND device_id = ").push_bind(device_id);
                }
                if enabled_only {
                    qb.push(" AND enabled = 1");
                }
                qb.build().fetch_all(&self.pool).await
            })
            .await?;

        rows.into_iter()
            .map(|r| {
                let data: String = r.get(0);
                serde_json::from_str(&data).map_err(|e| EngineError::Other(anyhow::anyhow!(e)))
            })
            .collect()
    }

    /// Delete a rule and its state row atomically. No-op (not an error) if
    /// the rule does not exist.
    pub async fn delete_rule(&self, rule_id: &str) -> Result<(), EngineError> {
        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM alarm_states WHERE rule_id = ?")
                .bind(rule_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM alarm_rules WHERE rule_id = ?")
                .bind(rule_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        })
        .await
    }

    // -- States ----------------------------------------------------------

    pub async fn get_state(&self, rule_id: &str) -> Result<Option<AlarmState>, EngineError> {
        let row = self
            .with_retry(|| async {
                sqlx::query("SELECT state_data FROM alarm_states WHERE rule_id = ?")
                    .bind(rule_id)
                    .fetch_optional(&self.pool)
                    .await
            })
            .await?;
        row.map(|r| {
            let data: String = r.get(0);
            serde_json::from_str(&data).map_err(|e| EngineError::Other(anyhow::anyhow!(e)))
        })
        .transpose()
    }

    pub async fn list_states(&self) -> Result<Vec<AlarmState>, EngineError> {
        let rows = self
            .with_retry(|| async {
                sqlx::query("SELECT state_data FROM alarm_states")
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;
        rows.into_iter()
            .map(|r| {
                let data: String = r.get(0);
                serde_json::from_str(&data).map_err(|e| EngineError::Other(anyhow::anyhow!(e)))
            })
            .collect()
    }

    pub async fn save_state(&self, state: &AlarmState) -> Result<(), EngineError> {
        let state_data =
            serde_json::to_string(state).map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        self.with_retry(|| {
            let state_data = state_data.clone();
            async {
                sqlx::query(
                    "INSERT INTO alarm_states (rule_id, device_id, state_data, updated_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(rule_id) DO UPDATE SET
                        device_id = excluded.device_id,
                        state_data = excluded.state_data,
                        updated_at = excluded.updated_at",
                )
                .bind(&state.rule_id)
                .bind(&state.device_id)
                .bind(state_data)
                .bind(state.updated_at)
                .execute(&self.pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Save the state and append a history record in one transaction — the
    /// atomic commit used when a rule fires.
    pub async fn save_state_and_history(
        &self,
        state: &AlarmState,
        alarm_payload: &serde_json::Value,
        timestamp: f64,
    ) -> Result<(), EngineError> {
        let state_data =
            serde_json::to_string(state).map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
        let payload_data = serde_json::to_string(alarm_payload)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;

        self.with_retry(|| {
            let state_data = state_data.clone();
            let payload_data = payload_data.clone();
            async {
                let mut tx = self.pool.begin().await?;

                sqlx::query(
                    "INSERT INTO alarm_states (rule_id, device_id, state_data, updated_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(rule_id) DO UPDATE SET
                        device_id = excluded.device_id,
                        state_data = excluded.state_data,
                        updated_at = excluded.updated_at",
                )
                .bind(&state.rule_id)
                .bind(&state.device_id)
                .bind(state_data)
                .bind(state.updated_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO alarm_history (rule_id, device_id, alarm_data, timestamp)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&state.rule_id)
                .bind(&state.device_id)
                .bind(payload_data)
                .bind(timestamp)
                .execute(&mut *tx)
                .await?;

                tx.commit().await
            }
        })
        .await
    }

    // -- History -----------------------------------------------------------

    pub async fn prune_history(&self, retention_days: i64, now: f64) -> Result<u64, EngineError> {
        let cutoff = now - (retention_days as f64) * 86_400.0;
        let result = self
            .with_retry(|| async {
                sqlx::query("DELETE FROM alarm_history WHERE timestamp < ?")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_history(&self, rule_id: &str) -> Result<Vec<AlarmHistoryRecord>, EngineError> {
        let rows = self
            .with_retry(|| async {
                sqlx::query(
                    "SELECT seq, rule_id, device_id, alarm_data, timestamp
                     FROM alarm_history WHERE rule_id = ? ORDER BY seq ASC",
                )
                .bind(rule_id)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        rows.into_iter()
            .map(|r| {
                let alarm_data: String = r.get(3);
                let alarm_payload = serde_json::from_str(&alarm_data)
                    .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;
                Ok(AlarmHistoryRecord {
                    seq: r.get(0),
                    rule_id: r.get(1),
                    device_id: r.get(2),
                    alarm_payload,
                    timestamp: r.get(4),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlarmKind, AlarmStatus, ComparisonOperator};

    fn rule(rule_id: &str, device_id: &str) -> AlarmRule {
        AlarmRule {
            rule_id: rule_id.into(),
            device_id: device_id.into(),
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
            created_at: 1.0,
            updated_at: 1.0,
        }
    }

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = memory_store().await;
        let r = rule("r1", "device-1");
        store.upsert_rule(&r).await.unwrap();
        let loaded = store.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(loaded.rule_id, "r1");
        assert_eq!(loaded.threshold_value, 30.0);
    }

    #[tokio::test]
    async fn get_missing_rule_is_none() {
        let store = memory_store().await;
        assert!(store.get_rule("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_rules_filters_by_device_and_enabled() {
        let store = memory_store().await;
        let mut r1 = rule("r1", "device-1");
        let r2 = rule("r2", "device-2");
        let mut r3 = rule("r3", "device-1");
        r3.enabled = false;
        store.upsert_rule(&r1).await.unwrap();
        store.upsert_rule(&r2).await.unwrap();
        store.upsert_rule(&r3).await.unwrap();

        let all = store.list_rules(None, false).await.unwrap();
        assert_eq!(all.len(), 3);

        let device_1 = store.list_rules(Some("device-1"), false).await.unwrap();
        assert_eq!(device_1.len(), 2);

        let device_1_enabled = store.list_rules(Some("device-1"), true).await.unwrap();
        assert_eq!(device_1_enabled.len(), 1);
        assert_eq!(device_1_enabled[0].rule_id, "r1");

        r1.enabled = false;
        store.upsert_rule(&r1).await.unwrap();
        let none_enabled = store.list_rules(Some("device-1"), true).await.unwrap();
        assert!(none_enabled.is_empty());
    }

    #[tokio::test]
    async fn delete_rule_removes_rule_and_state() {
        let store = memory_store().await;
        let r = rule("r1", "device-1");
        store.upsert_rule(&r).await.unwrap();
        let state = AlarmState::new_inactive("r1", "device-1", 1.0);
        store.save_state(&state).await.unwrap();

        store.delete_rule("r1").await.unwrap();

        assert!(store.get_rule("r1").await.unwrap().is_none());
        assert!(store.get_state("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_nonexistent_rule_is_not_an_error() {
        let store = memory_store().await;
        store.delete_rule("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn save_state_and_history_is_atomic_and_queryable() {
        let store = memory_store().await;
        let r = rule("r1", "device-1");
        store.upsert_rule(&r).await.unwrap();

        let mut state = AlarmState::new_inactive("r1", "device-1", 1.0);
        state.status = AlarmStatus::Triggered;
        state.violation_start = Some(0.0);
        state.trigger_time = Some(120.0);

        let payload = serde_json::json!({ "rule_id": "r1", "severity": "HIGH" });
        store
            .save_state_and_history(&state, &payload, 120.0)
            .await
            .unwrap();

        let loaded_state = store.get_state("r1").await.unwrap().unwrap();
        assert_eq!(loaded_state.status, AlarmStatus::Triggered);

        let history = store.list_history("r1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, 120.0);
    }

    #[tokio::test]
    async fn prune_history_removes_only_old_records() {
        let store = memory_store().await;
        let r = rule("r1", "device-1");
        store.upsert_rule(&r).await.unwrap();
        let state = AlarmState::new_inactive("r1", "device-1", 1.0);
        let payload = serde_json::json!({});

        store
            .save_state_and_history(&state, &payload, 0.0)
            .await
            .unwrap();
        store
            .save_state_and_history(&state, &payload, 1_000_000.0)
            .await
            .unwrap();

        let retention_days = 1;
        let now = 1_000_000.0;
        let deleted = store.prune_history(retention_days, now).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.list_history("r1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, 1_000_000.0);
    }
}
