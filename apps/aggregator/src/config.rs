use crate::series::{DowntimePolicy, Series, SeriesKind, SeriesPolicy};
use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_ca: PathBuf,
    pub token_file: Option<PathBuf>,

    pub sensor_file: PathBuf,
    pub mail_file: PathBuf,
    pub data_dir: PathBuf,
    pub web_dir: PathBuf,

    pub tick_interval: std::time::Duration,
    pub history_interval: std::time::Duration,
    pub max_connections: usize,

    pub allowed_downtime: Duration,
    pub record_days: i64,
    pub summary_days: i64,
    pub pause_warn_value: Duration,
    pub pause_warn_failure: Duration,
    pub timezone: Tz,
    pub downtime_policy: DowntimePolicy,
    pub memory_limit_mb: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind = env_string("AGG_BIND", Some("0.0.0.0:64918".to_string()))?;
        let server_cert = PathBuf::from(env_string("AGG_SERVER_CERT", Some("server.crt".into()))?);
        let server_key = PathBuf::from(env_string("AGG_SERVER_KEY", Some("server.key".into()))?);
        let client_ca = PathBuf::from(env_string("AGG_CLIENT_CA", Some("clients.crt".into()))?);
        let token_file = env_optional("AGG_TOKEN_FILE").map(PathBuf::from);

        let sensor_file = PathBuf::from(env_string("AGG_SENSOR_FILE", Some("sensors.json".into()))?);
        let mail_file = PathBuf::from(env_string("AGG_MAIL_CONFIG", Some("config.toml".into()))?);
        let data_dir = PathBuf::from(env_string("AGG_DATA_DIR", Some("data".into()))?);
        let web_dir = PathBuf::from(env_string("AGG_WEB_DIR", Some("web".into()))?);

        let tick_interval =
            std::time::Duration::from_secs(env_u64("AGG_TICK_SECONDS", Some(60))?);
        let history_interval =
            std::time::Duration::from_secs(env_u64("AGG_HISTORY_SECONDS", Some(600))?);
        let max_connections = env_u64("AGG_MAX_CONNECTIONS", Some(16))? as usize;

        let allowed_downtime =
            Duration::minutes(env_u64("AGG_ALLOWED_DOWNTIME_MINUTES", Some(30))? as i64);
        let record_days = env_u64("AGG_RECORD_DAYS", Some(7))? as i64;
        let summary_days = env_u64("AGG_SUMMARY_DAYS", Some(183))? as i64;
        let pause_warn_value =
            Duration::hours(env_u64("AGG_PAUSE_WARN_VALUE_HOURS", Some(24))? as i64);
        let pause_warn_failure =
            Duration::days(env_u64("AGG_PAUSE_WARN_FAILURE_DAYS", Some(30))? as i64);

        let timezone = env_string("AGG_TIMEZONE", Some("Europe/Berlin".into()))?
            .parse::<Tz>()
            .map_err(|err| anyhow!("invalid AGG_TIMEZONE: {err}"))?;

        let downtime_policy = match env_string("AGG_DOWNTIME_POLICY", Some("assume-off".into()))?
            .as_str()
        {
            "assume-off" => DowntimePolicy::AssumeOff,
            "assume-last-known" => DowntimePolicy::AssumeLastKnown,
            other => return Err(anyhow!("invalid AGG_DOWNTIME_POLICY: {other}")),
        };

        let memory_limit_mb = env_u64("AGG_MEMORY_LIMIT_MB", Some(200))?;

        Ok(Self {
            bind,
            server_cert,
            server_key,
            client_ca,
            token_file,
            sensor_file,
            mail_file,
            data_dir,
            web_dir,
            tick_interval,
            history_interval,
            max_connections,
            allowed_downtime,
            record_days,
            summary_days,
            pause_warn_value,
            pause_warn_failure,
            timezone,
            downtime_policy,
            memory_limit_mb,
        })
    }

    pub fn series_policy(&self) -> SeriesPolicy {
        SeriesPolicy {
            allowed_downtime: self.allowed_downtime,
            record_days: self.record_days,
            summary_days: self.summary_days,
            timezone: self.timezone,
            downtime: self.downtime_policy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub source: String,
    pub admin: String,
    pub user: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            source: "sensor@localhost".to_string(),
            admin: "root@localhost".to_string(),
            user: "root@localhost".to_string(),
            enable: false,
            smtp_host: None,
            smtp_port: default_smtp_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    mail: MailConfig,
}

/// Reads the `[mail]` section; a missing file means email stays disabled.
pub fn load_mail_config(path: &Path) -> Result<MailConfig> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(file = %path.display(), "no mail config, email disabled");
            return Ok(MailConfig::default());
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let parsed: ConfigFile =
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(parsed.mail)
}

/// The same sensor descriptor the station agents read; the aggregator
/// turns every output block into one series.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorDef {
    pub input: InputDef,
    pub output: OutputDef,
}

/// The aggregator reads only the nominal sampling interval from the input
/// block; reader wiring is the station side's business.
#[derive(Debug, Clone, Deserialize)]
pub struct InputDef {
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputDef {
    #[serde(default)]
    pub temperature: Option<EmitDef>,
    #[serde(default)]
    pub switch: Option<EmitDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitDef {
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(rename = "fail-notify", default)]
    pub fail_notify: bool,
}

pub fn load_sensor_defs(path: &Path) -> Result<Vec<SensorDef>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read sensor descriptor {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Builds the series list in descriptor order. Duplicate names are a
/// configuration error; the name is the dispatch key.
pub fn build_series(defs: &[SensorDef], policy: SeriesPolicy) -> Result<Vec<Series>> {
    let mut series: Vec<Series> = Vec::new();
    for def in defs {
        let interval = Duration::seconds(def.input.interval as i64);
        if let Some(out) = &def.output.temperature {
            push_unique(
                &mut series,
                Series::new(
                    &out.name,
                    &out.group,
                    SeriesKind::Temperature {
                        low: out.low.unwrap_or(f64::NEG_INFINITY),
                        high: out.high.unwrap_or(f64::INFINITY),
                    },
                    interval,
                    out.fail_notify,
                    policy,
                ),
            )?;
        }
        if let Some(out) = &def.output.switch {
            push_unique(
                &mut series,
                Series::new(
                    &out.name,
                    &out.group,
                    SeriesKind::Switch,
                    interval,
                    out.fail_notify,
                    policy,
                ),
            )?;
        }
    }
    if series.is_empty() {
        return Err(anyhow!("sensor descriptor declares no outputs"));
    }
    Ok(series)
}

fn push_unique(series: &mut Vec<Series>, candidate: Series) -> Result<()> {
    if series.iter().any(|s| s.name() == candidate.name()) {
        return Err(anyhow!("duplicate series name {:?}", candidate.name()));
    }
    series.push(candidate);
    Ok(())
}

pub fn load_tokens(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let tokens: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();
    if tokens.is_empty() {
        return Err(anyhow!("token file {} is empty", path.display()));
    }
    Ok(tokens)
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

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = r#"[
        {
            "input": {"station": 1, "type": "ds18b20",
                      "file": "/sys/bus/w1/devices/28-0000/w1_slave", "interval": 60},
            "output": {"temperature": {"name": "kessel", "group": "heizung",
                                       "low": 10, "high": 30, "fail-notify": true}}
        },
        {
            "input": {"station": 2, "type": "thermosolar",
                      "file": "/dev/video0", "interval": 120},
            "output": {"temperature": {"name": "kollektor", "group": "solar",
                                       "low": -20, "high": 95},
                       "switch": {"name": "pumpe", "group": "solar"}}
        }
    ]"#;

    #[test]
    fn descriptor_expands_to_series_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sensors.json");
        fs::write(&path, DESCRIPTOR).unwrap();

        let defs = load_sensor_defs(&path).unwrap();
        let series = build_series(&defs, SeriesPolicy::default()).unwrap();
        let names: Vec<&str> = series.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["kessel", "kollektor", "pumpe"]);
        assert!(matches!(
            series[2].kind(),
            SeriesKind::Switch
        ));
        assert!(series[0].fail_notify());
        assert!(!series[2].fail_notify());
    }

    #[test]
    fn duplicate_series_names_are_rejected() {
        let defs = load_sensor_defs_from(DESCRIPTOR.replace("kollektor", "kessel"));
        assert!(build_series(&defs, SeriesPolicy::default()).is_err());
    }

    fn load_sensor_defs_from(raw: String) -> Vec<SensorDef> {
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn mail_config_defaults_to_disabled() {
        let dir = TempDir::new().unwrap();
        let mail = load_mail_config(&dir.path().join("missing.toml")).unwrap();
        assert!(!mail.enable);

        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[mail]\nsource = \"sensor@example.org\"\nadmin = \"a@example.org\"\n\
             user = \"u@example.org\"\nenable = true\nsmtp_host = \"mail.example.org\"\n",
        )
        .unwrap();
        let mail = load_mail_config(&path).unwrap();
        assert!(mail.enable);
        assert_eq!(mail.smtp_port, 587);
        assert_eq!(mail.smtp_host.as_deref(), Some("mail.example.org"));
    }
}
