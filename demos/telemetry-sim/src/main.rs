//! Telemetry simulator: publishes fake temperature/current readings for a
//! configurable number of devices on `sensors/<device_id>/data`, for local
//! development and manual exercise of the alarm engine. Not part of the
//! core pipeline — nothing here is imported by the service.

use std::env;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let num_devices: usize = env::var("SIM_NUM_DEVICES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);
    let interval_secs: u64 = env::var("SIM_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let mut mqttoptions = MqttOptions::new("telemetry-simulator", &broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USER"), env::var("MQTT_PASS")) {
        mqttoptions.set_credentials(user, pass);
        info!("mqtt: using password authentication");
    } else {
        warn!("MQTT_USER / MQTT_PASS not set — connecting without authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("simulator connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(num_devices, interval_secs, "starting telemetry simulation");

    loop {
        for i in 1..=num_devices {
            let device_id = format!("device-{i}");
            let temperature = 20.0 + fastrand::f64() * 15.0;
            let temperature = (temperature * 100.0).round() / 100.0;
            let current = if fastrand::bool() { 1 } else { 0 };
            let timestamp = now_unix();

            let payload = serde_json::json!({
                "device_id": device_id,
                "temperature": temperature,
                "current": current,
                "timestamp": timestamp,
            });

            let topic = format!("sensors/{device_id}/data");
            if let Err(e) = client
                .publish(&topic, QoS::AtLeastOnce, false, serde_json::to_vec(&payload)?)
                .await
            {
                error!(topic = %topic, error = %e, "publish failed");
            }
        }

        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
