use crate::config::Config;
use crate::outbox::{Entry, Outbox, Value};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, Error)]
enum SendError {
    /// Connection, timeout or protocol failure; the entry stays queued.
    #[error("transport: {0}")]
    Transport(String),
    /// The server consumed the request and said no; retrying cannot help.
    #[error("rejected: {status}")]
    Rejected { status: reqwest::StatusCode },
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        SendError::Transport(err.to_string())
    }
}

#[derive(Debug)]
enum Command {
    Send(Entry),
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Handle over the background flusher. `send` never blocks; delivery is
/// at-least-once and survives process restarts through the on-disk outbox.
#[derive(Clone)]
pub struct BufferedSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl BufferedSender {
    pub fn send(&self, entry: Entry) {
        if self.tx.send(Command::Send(entry)).is_err() {
            tracing::error!("sender task stopped; reading lost");
        }
    }

    /// Requests one final drain, waits for the outbox to be persisted and
    /// the flusher to exit.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { respond_to: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub endpoint: String,
    pub server_cert: Option<std::path::PathBuf>,
    pub client_cert: Option<std::path::PathBuf>,
    pub client_key: Option<std::path::PathBuf>,
    pub token: Option<String>,
    pub buffer_path: std::path::PathBuf,
    pub send_interval: Duration,
    pub request_timeout: Duration,
    pub drop_rejected: bool,
}

impl SenderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            server_cert: config.server_cert.clone(),
            client_cert: config.client_cert.clone(),
            client_key: config.client_key.clone(),
            token: config.token.clone(),
            buffer_path: config.buffer_path.clone(),
            send_interval: config.send_interval,
            request_timeout: config.request_timeout,
            drop_rejected: config.drop_rejected,
        }
    }
}

/// Loads the outbox from disk and spawns the flusher task.
pub fn spawn(config: SenderConfig) -> Result<BufferedSender> {
    let outbox = Outbox::open(&config.buffer_path)?;
    if !outbox.is_empty() {
        tracing::info!(pending = outbox.len(), "resuming outbox from disk");
    }
    let client = build_client(&config)?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_flusher(config, client, outbox, rx));
    Ok(BufferedSender { tx })
}

fn build_client(config: &SenderConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2);
    if let Some(path) = &config.server_cert {
        let pem = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("parse {}", path.display()))?;
        // Pin the aggregator certificate; the system store stays out of it.
        builder = builder
            .add_root_certificate(cert)
            .tls_built_in_root_certs(false);
    }
    if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
        let mut pem = fs::read(cert).with_context(|| format!("read {}", cert.display()))?;
        pem.extend(fs::read(key).with_context(|| format!("read {}", key.display()))?);
        let identity = reqwest::Identity::from_pem(&pem).context("parse client identity")?;
        builder = builder.identity(identity);
    }
    builder.build().context("build http client")
}

async fn run_flusher(
    config: SenderConfig,
    client: reqwest::Client,
    mut outbox: Outbox,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        // Wait for work.
        if outbox.is_empty() {
            match rx.recv().await {
                Some(Command::Send(entry)) => {
                    if let Err(err) = outbox.push(entry) {
                        tracing::error!(error = %err, "outbox append failed");
                    }
                    continue;
                }
                Some(Command::Shutdown { respond_to }) => {
                    let _ = respond_to.send(());
                    return;
                }
                None => return,
            }
        }

        // Coarse rate limit; keeps batching transient bursts. Sends arriving
        // during the window join the current drain.
        let deadline = Instant::now() + config.send_interval;
        let mut shutdown: Option<Option<oneshot::Sender<()>>> = None;
        while shutdown.is_none() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                cmd = rx.recv() => match cmd {
                    Some(Command::Send(entry)) => {
                        if let Err(err) = outbox.push(entry) {
                            tracing::error!(error = %err, "outbox append failed");
                        }
                    }
                    Some(Command::Shutdown { respond_to }) => {
                        shutdown = Some(Some(respond_to));
                    }
                    None => shutdown = Some(None),
                },
            }
        }

        drain(&client, &config, &mut outbox).await;
        if let Err(err) = outbox.persist() {
            tracing::error!(error = %err, "outbox persist failed");
        }

        if let Some(respond_to) = shutdown {
            if !outbox.is_empty() {
                tracing::warn!(pending = outbox.len(), "shutdown with undelivered entries");
            }
            if let Some(respond_to) = respond_to {
                let _ = respond_to.send(());
            }
            return;
        }
    }
}

/// FIFO drain: each delivered or permanently rejected entry leaves the
/// outbox; the first transport failure postpones the remainder.
async fn drain(client: &reqwest::Client, config: &SenderConfig, outbox: &mut Outbox) {
    let start = Instant::now();
    let mut sent = 0usize;
    while let Some(entry) = outbox.front() {
        match post(client, config, entry).await {
            Ok(()) => {
                outbox.pop_front();
                sent += 1;
            }
            Err(SendError::Rejected { status }) => {
                if config.drop_rejected {
                    tracing::error!(%status, "unable to send entry, dropping");
                    outbox.pop_front();
                } else {
                    tracing::warn!(%status, "postpone send");
                    break;
                }
            }
            Err(SendError::Transport(err)) => {
                tracing::warn!(error = %err, "postpone send");
                break;
            }
        }
    }
    if sent > 0 {
        tracing::info!(
            count = sent,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sent entries"
        );
    }
}

#[derive(Serialize)]
struct WireEntry<'a> {
    group: &'a str,
    name: &'a str,
    timestamp: i64,
    value: &'a Value,
    #[serde(rename = "_token", skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

async fn post(
    client: &reqwest::Client,
    config: &SenderConfig,
    entry: &Entry,
) -> Result<(), SendError> {
    let body = WireEntry {
        group: &entry.group,
        name: &entry.name,
        timestamp: entry.timestamp,
        value: &entry.value,
        token: config.token.as_deref(),
    };
    let resp = client
        .post(&config.endpoint)
        .header(reqwest::header::ACCEPT, "text/plain")
        .json(&body)
        .send()
        .await?;
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        Err(SendError::Rejected { status })
    } else {
        // Server-side hiccup; retry on the next interval.
        Err(SendError::Transport(format!("status {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post as axum_post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn entry(name: &str, timestamp: i64, value: f64) -> Entry {
        Entry {
            group: "heizung".to_string(),
            name: name.to_string(),
            timestamp,
            value: Value::Number(value),
        }
    }

    fn test_config(dir: &TempDir, endpoint: String) -> SenderConfig {
        SenderConfig {
            endpoint,
            server_cert: None,
            client_cert: None,
            client_key: None,
            token: Some("geheim".to_string()),
            buffer_path: dir.path().join("buffer"),
            send_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
            drop_rejected: true,
        }
    }

    #[derive(Clone)]
    struct Received(Arc<Mutex<Vec<serde_json::Value>>>);

    async fn accept(
        State(received): State<Received>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        if body.get("name").and_then(|n| n.as_str()) == Some("kaputt") {
            return StatusCode::BAD_REQUEST;
        }
        received.0.lock().unwrap().push(body);
        StatusCode::CREATED
    }

    async fn spawn_server() -> (String, Received) {
        let received = Received(Arc::new(Mutex::new(Vec::new())));
        let app = Router::new()
            .route("/", axum_post(accept))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}/"), received)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn delivers_in_order_and_empties_outbox() {
        let dir = TempDir::new().unwrap();
        let (endpoint, received) = spawn_server().await;
        let config = test_config(&dir, endpoint);

        let sender = spawn(config.clone()).unwrap();
        sender.send(entry("kessel", 1000, 21.0));
        sender.send(entry("kessel", 1010, 21.5));
        sender.send(entry("kessel", 1020, 22.0));

        wait_for(|| received.0.lock().unwrap().len() == 3).await;
        let timestamps: Vec<i64> = received
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|b| b["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![1000, 1010, 1020]);

        sender.shutdown().await;
        let outbox = Outbox::open(&config.buffer_path).unwrap();
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_keeps_entries_across_restart() {
        let dir = TempDir::new().unwrap();
        // Reserve a port nothing listens on.
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);
        let config = test_config(&dir, format!("http://{addr}/"));

        let sender = spawn(config.clone()).unwrap();
        sender.send(entry("kessel", 1000, 21.0));
        // Give the flusher one failed drain attempt.
        tokio::time::sleep(config.send_interval * 3).await;
        sender.shutdown().await;

        // Restart resumes with the same entry.
        let (endpoint, received) = spawn_server().await;
        let restarted = SenderConfig {
            endpoint,
            ..config
        };
        let sender = spawn(restarted).unwrap();
        wait_for(|| received.0.lock().unwrap().len() == 1).await;
        assert_eq!(received.0.lock().unwrap()[0]["timestamp"], 1000);
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_entry_is_dropped_and_rest_delivered() {
        let dir = TempDir::new().unwrap();
        let (endpoint, received) = spawn_server().await;
        let config = test_config(&dir, endpoint);

        let sender = spawn(config.clone()).unwrap();
        sender.send(entry("kaputt", 1000, 1.0));
        sender.send(entry("kessel", 1010, 21.0));

        wait_for(|| received.0.lock().unwrap().len() == 1).await;
        assert_eq!(received.0.lock().unwrap()[0]["name"], "kessel");

        sender.shutdown().await;
        let outbox = Outbox::open(&config.buffer_path).unwrap();
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn rejected_entry_postpones_when_drop_disabled() {
        let dir = TempDir::new().unwrap();
        let (endpoint, _received) = spawn_server().await;
        let mut config = test_config(&dir, endpoint);
        config.drop_rejected = false;

        let sender = spawn(config.clone()).unwrap();
        sender.send(entry("kaputt", 1000, 1.0));
        tokio::time::sleep(config.send_interval * 3).await;
        sender.shutdown().await;

        let outbox = Outbox::open(&config.buffer_path).unwrap();
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn token_rides_along_on_the_wire() {
        let dir = TempDir::new().unwrap();
        let (endpoint, received) = spawn_server().await;
        let config = test_config(&dir, endpoint);

        let sender = spawn(config).unwrap();
        sender.send(entry("kessel", 1000, 21.0));
        wait_for(|| received.0.lock().unwrap().len() == 1).await;
        assert_eq!(received.0.lock().unwrap()[0]["_token"], "geheim");
        sender.shutdown().await;
    }
}
