use crate::record::Value;
use crate::series::{Series, SeriesKind};
use crate::store::SeriesStore;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-tick status snapshot handed to the external renderer. The aggregator
/// only publishes machine-readable JSON; HTML and plots live elsewhere.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: i64,
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub series: Vec<SeriesStatus>,
}

#[derive(Debug, Serialize)]
pub struct SeriesStatus {
    pub name: String,
    pub kind: &'static str,
    pub interval_seconds: i64,
    pub current: Option<Point>,
    pub error: bool,
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_min: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_max: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_today_hours: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct Point {
    pub timestamp: i64,
    pub value: Value,
}

#[derive(Debug, Serialize)]
struct HistorySnapshot {
    generated_at: i64,
    series: Vec<HistorySeries>,
}

#[derive(Debug, Serialize)]
struct HistorySeries {
    name: String,
    group: String,
    records: Vec<Point>,
    summaries: Vec<SummaryPoint>,
}

#[derive(Debug, Serialize)]
struct SummaryPoint {
    date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime_hours: Option<f64>,
}

impl From<&crate::series::Summary> for SummaryPoint {
    fn from(summary: &crate::series::Summary) -> Self {
        match summary {
            crate::series::Summary::Temperature { date, min, max } => Self {
                date: date.to_string(),
                min: Some(*min),
                max: Some(*max),
                uptime_hours: None,
            },
            crate::series::Summary::Uptime { date, hours } => Self {
                date: date.to_string(),
                min: None,
                max: None,
                uptime_hours: Some(*hours),
            },
        }
    }
}

pub fn build_status(store: &SeriesStore, now: DateTime<Utc>, tz: Tz) -> StatusSnapshot {
    let mut groups: Vec<GroupStatus> = Vec::new();
    for series in store.iter() {
        let status = series_status(series, now, tz);
        match groups.iter_mut().find(|g| g.group == series.group()) {
            Some(group) => group.series.push(status),
            None => groups.push(GroupStatus {
                group: series.group().to_string(),
                series: vec![status],
            }),
        }
    }
    StatusSnapshot {
        generated_at: now.timestamp(),
        groups,
    }
}

fn series_status(series: &Series, now: DateTime<Utc>, tz: Tz) -> SeriesStatus {
    let current = series.current(now).map(|record| Point {
        timestamp: record.timestamp.timestamp(),
        value: record.value,
    });
    let error = current.is_none();
    match series.kind() {
        SeriesKind::Temperature { low, high } => {
            let minmax = series.minmax(series.day(now));
            SeriesStatus {
                name: series.name().to_string(),
                kind: "temperature",
                interval_seconds: series.interval().num_seconds(),
                current,
                error,
                warning: series.warning(now),
                day_min: minmax.map(|(min, _)| Point {
                    timestamp: min.timestamp.timestamp(),
                    value: min.value,
                }),
                day_max: minmax.map(|(_, max)| Point {
                    timestamp: max.timestamp.timestamp(),
                    value: max.value,
                }),
                low: Some(low),
                high: Some(high),
                uptime_today_hours: None,
            }
        }
        SeriesKind::Switch => {
            let midnight = local_day_start(now, tz);
            let uptime = series.uptime_between(midnight, now);
            SeriesStatus {
                name: series.name().to_string(),
                kind: "switch",
                interval_seconds: series.interval().num_seconds(),
                current,
                error,
                warning: None,
                day_min: None,
                day_max: None,
                low: None,
                high: None,
                uptime_today_hours: Some(uptime.num_seconds() as f64 / 3600.0),
            }
        }
    }
}

fn local_day_start(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let date = now.with_timezone(&tz).date_naive();
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Writes the renderer inputs into the web directory, atomically.
pub struct Presenter {
    web_dir: PathBuf,
}

impl Presenter {
    pub fn new(web_dir: &Path) -> Result<Self> {
        fs::create_dir_all(web_dir).with_context(|| format!("create {}", web_dir.display()))?;
        Ok(Self {
            web_dir: web_dir.to_path_buf(),
        })
    }

    pub fn publish_status(&self, snapshot: &StatusSnapshot) -> Result<()> {
        self.write_json("status.json", snapshot)
    }

    pub fn publish_history(&self, store: &SeriesStore, now: DateTime<Utc>) -> Result<()> {
        let snapshot = HistorySnapshot {
            generated_at: now.timestamp(),
            series: store
                .iter()
                .map(|series| HistorySeries {
                    name: series.name().to_string(),
                    group: series.group().to_string(),
                    records: series
                        .day(now)
                        .map(|record| Point {
                            timestamp: record.timestamp.timestamp(),
                            value: record.value,
                        })
                        .collect(),
                    summaries: series.summary().map(SummaryPoint::from).collect(),
                })
                .collect(),
        };
        self.write_json("history.json", &snapshot)
    }

    fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<()> {
        let path = self.web_dir.join(file_name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(value).context("encode snapshot")?;
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::series::SeriesPolicy;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn store_with_data(dir: &Path, now: DateTime<Utc>) -> SeriesStore {
        let kessel = Series::new(
            "kessel",
            "heizung",
            SeriesKind::Temperature { low: 10.0, high: 30.0 },
            Duration::seconds(60),
            true,
            SeriesPolicy::default(),
        );
        let pumpe = Series::new(
            "pumpe",
            "heizung",
            SeriesKind::Switch,
            Duration::seconds(60),
            false,
            SeriesPolicy::default(),
        );
        let mut store = SeriesStore::open(dir, vec![kessel, pumpe], now).unwrap();
        store
            .ingest(
                "kessel",
                Record::new(now - Duration::minutes(5), Value::Number(21.5)),
                now,
            )
            .unwrap();
        store
            .ingest(
                "pumpe",
                Record::new(now - Duration::minutes(10), Value::Bool(true)),
                now,
            )
            .unwrap();
        store
            .ingest(
                "pumpe",
                Record::new(now - Duration::minutes(5), Value::Bool(false)),
                now,
            )
            .unwrap();
        store
    }

    #[test]
    fn status_snapshot_groups_series() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let store = store_with_data(dir.path(), now);

        let snapshot = build_status(&store, now, chrono_tz::Europe::Berlin);
        assert_eq!(snapshot.groups.len(), 1);
        let group = &snapshot.groups[0];
        assert_eq!(group.group, "heizung");
        assert_eq!(group.series.len(), 2);

        let kessel = &group.series[0];
        assert_eq!(kessel.kind, "temperature");
        assert!(!kessel.error);
        assert_eq!(kessel.low, Some(10.0));
        assert!(kessel.day_min.is_some());

        let pumpe = &group.series[1];
        assert_eq!(pumpe.kind, "switch");
        assert!(pumpe.uptime_today_hours.is_some());
    }

    #[test]
    fn stale_series_is_flagged_as_error() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let store = store_with_data(dir.path(), now);

        let later = now + Duration::hours(2);
        let snapshot = build_status(&store, later, chrono_tz::Europe::Berlin);
        assert!(snapshot.groups[0].series.iter().all(|s| s.error));
    }

    #[test]
    fn presenter_writes_status_and_history() {
        let dir = TempDir::new().unwrap();
        let web = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let store = store_with_data(dir.path(), now);
        let presenter = Presenter::new(web.path()).unwrap();

        let snapshot = build_status(&store, now, chrono_tz::Europe::Berlin);
        presenter.publish_status(&snapshot).unwrap();
        presenter.publish_history(&store, now).unwrap();

        let status: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(web.path().join("status.json")).unwrap())
                .unwrap();
        assert_eq!(status["groups"][0]["group"], "heizung");

        let history: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(web.path().join("history.json")).unwrap())
                .unwrap();
        assert_eq!(history["series"][0]["name"], "kessel");
        assert_eq!(history["series"][0]["records"][0]["value"], 21.5);
    }
}
