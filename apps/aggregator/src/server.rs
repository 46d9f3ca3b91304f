use crate::record::{Record, Value};
use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// A record accepted by the ingest endpoint, on its way to the supervisor.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub group: String,
    pub name: String,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTag {
    Temperature,
    Switch,
}

#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<HashMap<String, KindTag>>,
    pub inbound: mpsc::Sender<InboundRecord>,
    /// Legacy single-sided auth: accepted `_token` values, one per line in
    /// the token file. `None` disables the check (mutual TLS only).
    pub tokens: Option<Arc<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngestPayload {
    group: String,
    name: String,
    timestamp: i64,
    value: Value,
    #[serde(rename = "_token")]
    token: Option<String>,
}

pub fn router(state: ServerState) -> Router {
    Router::new().route("/", post(ingest)).with_state(state)
}

async fn ingest(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return (StatusCode::BAD_REQUEST, "bad content type").into_response();
    }

    let payload: IngestPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "bad json");
            return (StatusCode::BAD_REQUEST, "bad json").into_response();
        }
    };

    if let Some(tokens) = &state.tokens {
        match &payload.token {
            Some(token) if tokens.contains(token) => {}
            Some(_) => {
                tracing::warn!(name = %payload.name, "invalid api token");
                return (StatusCode::UNAUTHORIZED, "invalid api token").into_response();
            }
            None => {
                tracing::warn!(name = %payload.name, "missing api token");
                return (StatusCode::UNAUTHORIZED, "missing api token").into_response();
            }
        }
    }

    let Some(kind) = state.registry.get(&payload.name) else {
        tracing::warn!(name = %payload.name, "unknown series");
        return (StatusCode::BAD_REQUEST, "unknown series").into_response();
    };
    let matches = matches!(
        (*kind, payload.value),
        (KindTag::Temperature, Value::Number(_)) | (KindTag::Switch, Value::Bool(_))
    );
    if !matches {
        tracing::warn!(name = %payload.name, "wrong value type");
        return (StatusCode::BAD_REQUEST, "wrong value type").into_response();
    }

    let record = match Record::from_unix(payload.timestamp, payload.value) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "bad timestamp");
            return (StatusCode::BAD_REQUEST, "bad timestamp").into_response();
        }
    };

    // The `_token` field is stripped here; dispatch sees only the record.
    let inbound = InboundRecord {
        group: payload.group,
        name: payload.name,
        record,
    };
    match state.inbound.try_send(inbound) {
        Ok(()) => (StatusCode::CREATED, "value received").into_response(),
        Err(err) => {
            tracing::error!(error = %err, "inbound queue full");
            (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response()
        }
    }
}

fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("parse {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

fn load_pem_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

/// Server certificate plus mandatory client-certificate verification
/// against the CA bundle. The crypto provider is pinned so the config does
/// not depend on a process-wide default.
pub fn load_tls_config(cert: &Path, key: &Path, client_ca: &Path) -> Result<ServerConfig> {
    let certs = load_pem_certs(cert)?;
    let key = load_pem_key(key)?;
    let mut roots = RootCertStore::empty();
    for ca_cert in load_pem_certs(client_ca)? {
        roots
            .add(ca_cert)
            .with_context(|| format!("add CA from {}", client_ca.display()))?;
    }
    let provider = Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|err| anyhow!("client verifier: {err}"))?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("server certificate chain")?;
    Ok(config)
}

const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Accept loop: TLS handshake per connection, served by a bounded pool of
/// worker tasks. Cancellation stops accepting and waits for the in-flight
/// handlers.
pub async fn serve(
    bind: String,
    tls: ServerConfig,
    app: Router,
    cancel: CancellationToken,
    max_connections: usize,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(Arc::new(tls));
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "ingest server listening");

    let semaphore = Arc::new(Semaphore::new(max_connections.max(1)));
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let acceptor = acceptor.clone();
                let service = TowerToHyperService::new(app.clone());
                connections.spawn(async move {
                    let _permit = permit;
                    let handshake =
                        tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream));
                    let tls_stream = match handshake.await {
                        Ok(Ok(tls_stream)) => tls_stream,
                        Ok(Err(err)) => {
                            tracing::warn!(%peer, error = %err, "tls handshake failed");
                            return;
                        }
                        Err(_) => {
                            tracing::warn!(%peer, "tls handshake timed out");
                            return;
                        }
                    };
                    let result = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await;
                    if let Err(err) = result {
                        tracing::debug!(%peer, error = %err, "connection closed with error");
                    }
                });
                // Reap finished connection tasks as we go.
                while connections.try_join_next().is_some() {}
            }
        }
    }

    tracing::info!("ingest server draining connections");
    while connections.join_next().await.is_some() {}
    Ok(())
}
