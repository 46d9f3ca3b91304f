mod config;
mod outbox;
mod reader;
mod sender;

use crate::config::{load_sensor_defs, Config};
use crate::outbox::Entry;
use crate::reader::Sensor;
use crate::sender::{BufferedSender, SenderConfig};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::time::Instant;

#[derive(Parser, Debug)]
#[command(about = "Station-side telemetry agent")]
struct Cli {
    /// Station identifier; selects this station's sensors from the descriptor.
    station: u32,
}

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,station_agent=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env(cli.station)?;
    init_tracing()?;

    let defs = load_sensor_defs(&config.sensor_file)?;
    let mut sensors = Vec::new();
    for def in defs
        .iter()
        .filter(|def| def.input.station == config.station)
    {
        sensors.push(Sensor::from_def(def, &config.ocr_command)?);
    }
    if sensors.is_empty() {
        bail!("no sensors configured for station {}", config.station);
    }
    tracing::info!(
        station = config.station,
        sensors = sensors.len(),
        endpoint = %config.endpoint,
        "station agent starting"
    );

    let sender = sender::spawn(SenderConfig::from_config(&config))
        .context("start buffered sender")?;

    let mut tick = tokio::time::interval(config.sample_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = tick.tick() => {
                sample_all(&mut sensors, &sender).await;
            }
        }
    }

    tracing::info!("waiting for final drain");
    sender.shutdown().await;
    Ok(())
}

async fn sample_all(sensors: &mut [Sensor], sender: &BufferedSender) {
    let tick_start = Instant::now();
    for sensor in sensors.iter_mut() {
        let Some(result) = sensor.sample(tick_start).await else {
            continue;
        };
        // Second resolution on the wire.
        let timestamp = Utc::now().timestamp();
        match result {
            Ok(readings) => {
                for reading in readings {
                    tracing::debug!(
                        group = %reading.group,
                        name = %reading.name,
                        value = ?reading.value,
                        timestamp,
                        "sampled"
                    );
                    sender.send(Entry {
                        group: reading.group,
                        name: reading.name,
                        timestamp,
                        value: reading.value,
                    });
                }
            }
            Err(err) => {
                tracing::error!(sensor = %sensor.label(), error = %err, "sensor read failed");
            }
        }
    }
}
