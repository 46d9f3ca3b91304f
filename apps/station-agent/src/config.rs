use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub station: u32,

    pub endpoint: String,
    pub server_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub token: Option<String>,

    pub sensor_file: PathBuf,
    pub buffer_path: PathBuf,
    pub ocr_command: String,

    pub sample_interval: Duration,
    pub send_interval: Duration,
    pub request_timeout: Duration,
    pub drop_rejected: bool,
}

impl Config {
    pub fn from_env(station: u32) -> Result<Self> {
        let endpoint = env_string("STATION_ENDPOINT", Some("https://127.0.0.1:64918/".to_string()))?;

        let server_cert = env_path("STATION_SERVER_CERT", Some("server.crt"));
        let client_cert = env_path("STATION_CLIENT_CERT", Some("client.crt"));
        let client_key = env_path("STATION_CLIENT_KEY", Some("client.key"));

        // Plain-http endpoints skip TLS material entirely (legacy token mode).
        let tls = endpoint.starts_with("https://");
        let (server_cert, client_cert, client_key) = if tls {
            (server_cert, client_cert, client_key)
        } else {
            (None, None, None)
        };

        let token = match env_optional("STATION_TOKEN_FILE") {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("read token file {path}"))?;
                let token = raw
                    .lines()
                    .next()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .ok_or_else(|| anyhow!("empty token file {path}"))?;
                Some(token.to_string())
            }
            None => env_optional("STATION_TOKEN"),
        };

        let sensor_file = PathBuf::from(env_string(
            "STATION_SENSOR_FILE",
            Some("sensors.json".to_string()),
        )?);
        let buffer_path = PathBuf::from(env_string("STATION_BUFFER", Some("buffer".to_string()))?);
        let ocr_command = env_string("STATION_OCR_COMMAND", Some("thermosolar-ocr".to_string()))?;

        let sample_interval =
            Duration::from_secs(env_u64("STATION_SAMPLE_INTERVAL_SECONDS", Some(10))?);
        let send_interval = Duration::from_secs(env_u64("STATION_SEND_INTERVAL_SECONDS", Some(10))?);
        let request_timeout =
            Duration::from_secs(env_u64("STATION_REQUEST_TIMEOUT_SECONDS", Some(60))?);
        let drop_rejected = env_bool("STATION_DROP_REJECTED", true)?;

        Ok(Self {
            station,
            endpoint,
            server_cert,
            client_cert,
            client_key,
            token,
            sensor_file,
            buffer_path,
            ocr_command,
            sample_interval,
            send_interval,
            request_timeout,
            drop_rejected,
        })
    }
}

/// One entry of the static sensor descriptor file. The aggregator reads the
/// same file; the agent keeps only the entries matching its station id.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorDef {
    pub input: InputDef,
    pub output: OutputDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputDef {
    pub station: u32,
    #[serde(rename = "type")]
    pub kind: InputKind,
    pub file: PathBuf,
    pub interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Ds18b20,
    MdegCelsius,
    Thermosolar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputDef {
    #[serde(default)]
    pub temperature: Option<EmitDef>,
    #[serde(default)]
    pub switch: Option<EmitDef>,
}

/// The agent only needs the addressing half of an output block; thresholds
/// and notify flags are the aggregator's business.
#[derive(Debug, Clone, Deserialize)]
pub struct EmitDef {
    pub name: String,
    pub group: String,
}

pub fn load_sensor_defs(path: &PathBuf) -> Result<Vec<SensorDef>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read sensor descriptor {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(anyhow!("invalid {key}: {other}")),
        },
        Err(_) => Ok(default),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(key: &str, default: Option<&str>) -> Option<PathBuf> {
    env_optional(key)
        .map(PathBuf::from)
        .or_else(|| default.map(PathBuf::from))
}
