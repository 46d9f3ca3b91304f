mod alert;
mod config;
mod mailer;
mod present;
mod record;
mod series;
mod server;
mod store;
mod supervisor;

use crate::config::{build_series, load_mail_config, load_sensor_defs, load_tokens, Config};
use crate::mailer::Mailer;
use crate::present::Presenter;
use crate::series::SeriesKind;
use crate::server::{KindTag, ServerState};
use crate::store::SeriesStore;
use crate::supervisor::Supervisor;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,aggregator=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let exit_code = match start().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("fatal: {err:?}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn start() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let mail = load_mail_config(&config.mail_file)?;
    let mailer = Mailer::new(mail);

    match run(&config, mailer.clone()).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Crash policy: the admin hears about it, then we die non-zero.
            tracing::error!(error = ?err, "supervisor crashed");
            mailer.send_admin("Programmabsturz", &format!("{err:?}")).await;
            Err(err)
        }
    }
}

async fn run(config: &Config, mailer: Mailer) -> Result<()> {
    let defs = load_sensor_defs(&config.sensor_file)?;
    let series_list = build_series(&defs, config.series_policy())?;

    let registry: HashMap<String, KindTag> = series_list
        .iter()
        .map(|series| {
            let tag = match series.kind() {
                SeriesKind::Temperature { .. } => KindTag::Temperature,
                SeriesKind::Switch => KindTag::Switch,
            };
            (series.name().to_string(), tag)
        })
        .collect();

    let now = Utc::now();
    let store = SeriesStore::open(&config.data_dir, series_list, now)?;
    tracing::info!(series = store.len(), "series store ready");

    let tokens = match &config.token_file {
        Some(path) => Some(Arc::new(load_tokens(path)?)),
        None => None,
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(10_000);
    let state = ServerState {
        registry: Arc::new(registry),
        inbound: inbound_tx,
        tokens,
    };
    let app = server::router(state);
    let tls = server::load_tls_config(&config.server_cert, &config.server_key, &config.client_ca)?;

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server::serve(
        config.bind.clone(),
        tls,
        app,
        cancel.clone(),
        config.max_connections,
    ));

    let presenter = Presenter::new(&config.web_dir)?;
    let supervisor = Supervisor::new(config, store, mailer, presenter, inbound_rx, cancel.clone());
    let mut supervisor_task = tokio::spawn(supervisor.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
        result = &mut supervisor_task => {
            // The supervisor only returns early on failure; stop the server
            // and surface the error.
            cancel.cancel();
            let _ = server_task.await;
            return result.context("supervisor task")?;
        }
    }

    supervisor_task.await.context("supervisor task")??;
    server_task.await.context("server task")??;
    Ok(())
}
