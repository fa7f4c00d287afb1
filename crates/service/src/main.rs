//! Service entry point: reads config, connects to MQTT and SQLite, wires up
//! the telemetry cache, dispatcher, and evaluator pipeline, and runs the
//! main event loop until a shutdown signal arrives.

mod config;
mod ingress;

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alarm_engine_core::{Dispatcher, Store, TelemetryCache};
use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// How long shutdown waits for in-flight evaluations to drain before giving up.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// How often the status line reporting device/alarm counts is logged.
const STATUS_LOG_INTERVAL_SEC: u64 = 60;

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    config::apply_env_overrides(&mut cfg);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.logging.level.clone().into()),
        )
        .init();

    if let Some(ref file) = cfg.logging.file {
        info!(path = %file, "logging.file configured but file sink wiring is left to the deployment's process supervisor (stdout is redirected there)");
    }

    info!(broker = %cfg.transport.broker, port = cfg.transport.port, "starting alarm engine service");

    // ── Database ────────────────────────────────────────────────────
    let store = Store::connect(&cfg.store.path).await?;
    store.migrate().await?;

    let existing_states = store.list_states().await?;
    info!(count = existing_states.len(), "loaded N existing alarm states");

    // ── Telemetry cache + dispatcher ────────────────────────────────
    let cache = Arc::new(TelemetryCache::new());
    let (alarm_tx, mut alarm_rx) = mpsc::channel::<serde_json::Value>(cfg.processing.intake_capacity);

    let dispatcher = Dispatcher::spawn(
        store.clone(),
        Arc::clone(&cache),
        alarm_tx,
        cfg.defaults.shunt_freshness_seconds,
        cfg.processing.intake_capacity,
        cfg.processing.max_workers,
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(
        cfg.transport.client_id.clone(),
        &cfg.transport.broker,
        cfg.transport.port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_clean_session(false);
    mqttoptions.set_last_will(LastWill::new(
        "status/alarm-engine",
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));

    if let (Some(user), Some(pass)) = (&cfg.transport.username, &cfg.transport.password) {
        mqttoptions.set_credentials(user.clone(), pass.clone());
        info!("mqtt: using password authentication");
    } else {
        warn!("transport.username / transport.password not set — connecting without authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client
        .subscribe(&cfg.transport.subscribe_topic, QoS::AtLeastOnce)
        .await
        .with_context(|| format!("initial subscribe to {} failed", cfg.transport.subscribe_topic))?;
    info!(topic = %cfg.transport.subscribe_topic, "subscribed");

    // ── Retention pruning ───────────────────────────────────────────
    let mut prune_handle = {
        let prune_store = store.clone();
        let retention_days = cfg.defaults.retention_days;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
            loop {
                ticker.tick().await;
                match prune_store.prune_history(retention_days, now_unix_seconds()).await {
                    Ok(n) if n > 0 => info!(deleted = n, "pruned old alarm history"),
                    Ok(_) => {}
                    Err(e) => error!("history prune failed: {e:#}"),
                }
            }
        })
    };

    // ── Periodic status line ───────────────────────────────────────
    let mut status_handle = {
        let status_store = store.clone();
        let metrics = dispatcher.metrics();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(STATUS_LOG_INTERVAL_SEC));
            loop {
                ticker.tick().await;
                let active_count = status_store
                    .list_states()
                    .await
                    .map(|states| {
                        states
                            .iter()
                            .filter(|s| s.status.is_violation_active())
                            .count()
                    })
                    .unwrap_or(0);
                info!(
                    active_alarms = active_count,
                    evaluated = metrics.evaluated.load(Ordering::Relaxed),
                    fired = metrics.fired.load(Ordering::Relaxed),
                    intake_dropped = metrics.intake_dropped.load(Ordering::Relaxed),
                    "status"
                );
            }
        })
    };

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let seq = AtomicU64::new(0);
    let exit_reason: &str;

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic.clone();
                        if let Some(device_id) = ingress::extract_device_id(&topic) {
                            let arrival = now_unix_seconds();
                            let item_seq = seq.fetch_add(1, Ordering::Relaxed);
                            if let Some(telemetry) =
                                ingress::decode_telemetry(device_id, &p.payload, arrival, item_seq)
                            {
                                dispatcher.submit(telemetry);
                            }
                        } else {
                            warn!(topic = %topic, "ingress.badtopic: unrecognized topic");
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        if let Err(e) = client
                            .subscribe(&cfg.transport.subscribe_topic, QoS::AtLeastOnce)
                            .await
                        {
                            error!("re-subscribe failed: {e}");
                        }
                        let _ = client
                            .publish("status/alarm-engine", QoS::AtLeastOnce, true, b"online".to_vec())
                            .await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }

            Some(payload) = alarm_rx.recv() => {
                if let Err(e) = client
                    .publish(
                        &cfg.transport.alarm_topic,
                        QoS::AtLeastOnce,
                        false,
                        serde_json::to_vec(&payload).unwrap_or_default(),
                    )
                    .await
                {
                    error!(error = %e, "alarm publish failed; alarm remains in history for re-publish");
                }
            }

            result = &mut prune_handle => {
                error!("history pruner task exited unexpectedly: {result:?}");
            }

            result = &mut status_handle => {
                error!("status logger task exited unexpectedly: {result:?}");
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");
    dispatcher.shutdown(SHUTDOWN_DRAIN_DEADLINE).await;

    // Drain any alarms already queued for publish, bounded by the deadline.
    let drain_deadline = tokio::time::sleep(SHUTDOWN_DRAIN_DEADLINE);
    tokio::pin!(drain_deadline);
    loop {
        tokio::select! {
            maybe_payload = alarm_rx.recv() => {
                match maybe_payload {
                    Some(payload) => {
                        let _ = client
                            .publish(
                                &cfg.transport.alarm_topic,
                                QoS::AtLeastOnce,
                                false,
                                serde_json::to_vec(&payload).unwrap_or_default(),
                            )
                            .await;
                    }
                    None => break,
                }
            }
            _ = &mut drain_deadline => {
                warn!("shutdown drain deadline reached; remaining alarms left in history only");
                break;
            }
        }
    }

    let _ = client
        .publish("status/alarm-engine", QoS::AtLeastOnce, true, b"offline".to_vec())
        .await;

    info!("shutdown complete");
    Ok(())
}
