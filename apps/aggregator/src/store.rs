use crate::record::{parse_csv_fields, Record};
use crate::series::{AppendError, Series};
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown series {0:?}")]
    UnknownSeries(String),
    #[error(transparent)]
    Append(#[from] AppendError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Owns every series plus their year-partitioned CSV files. Single writer:
/// only the supervisor task touches it after startup.
pub struct SeriesStore {
    data_dir: PathBuf,
    order: Vec<String>,
    series: HashMap<String, Series>,
    files: HashMap<String, (i32, fs::File)>,
}

impl SeriesStore {
    /// Creates the data directory and rebuilds the in-memory deques by
    /// replaying last year's and this year's partitions.
    pub fn open(data_dir: &Path, series_list: Vec<Series>, now: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("create {}", data_dir.display()))?;
        let mut store = Self {
            data_dir: data_dir.to_path_buf(),
            order: series_list.iter().map(|s| s.name().to_string()).collect(),
            series: series_list
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
            files: HashMap::new(),
        };
        store.replay(now)?;
        Ok(store)
    }

    pub fn get(&self, name: &str) -> Option<&Series> {
        self.series.get(name)
    }

    /// Series in descriptor order.
    pub fn iter(&self) -> impl Iterator<Item = &Series> {
        self.order.iter().filter_map(|name| self.series.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Appends a record to the named series and persists one CSV line.
    pub fn ingest(
        &mut self,
        name: &str,
        record: Record,
        now: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let series = self
            .series
            .get_mut(name)
            .ok_or_else(|| IngestError::UnknownSeries(name.to_string()))?;
        series.append(record, now)?;
        self.append_line(name, record)?;
        Ok(())
    }

    fn append_line(&mut self, name: &str, record: Record) -> Result<()> {
        let year = record.timestamp.year();
        let needs_open = match self.files.get(name) {
            Some((cached_year, _)) => *cached_year != year,
            None => true,
        };
        if needs_open {
            let path = partition_path(&self.data_dir, name, year);
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            self.files.insert(name.to_string(), (year, file));
        }
        let (_, file) = self.files.get_mut(name).expect("inserted above");
        writeln!(file, "{}", record.to_csv_line()).context("append csv line")?;
        file.flush().ok();
        Ok(())
    }

    fn replay(&mut self, now: DateTime<Utc>) -> Result<()> {
        let years = [now.year() - 1, now.year()];
        for name in self.order.clone() {
            let mut restored = 0usize;
            for year in years {
                let path = partition_path(&self.data_dir, &name, year);
                if !path.exists() {
                    continue;
                }
                restored += self.replay_file(&name, &path, now)?;
            }
            if restored > 0 {
                let series = self.series.get(&name).expect("known name");
                tracing::info!(
                    series = %name,
                    restored,
                    retained = series.len(),
                    "replayed series partitions"
                );
            }
        }
        Ok(())
    }

    fn replay_file(&mut self, name: &str, path: &Path, now: DateTime<Utc>) -> Result<usize> {
        let series = self.series.get_mut(name).expect("known name");
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut restored = 0usize;
        for row in reader.records() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "skip unreadable csv row");
                    continue;
                }
            };
            let (Some(ts), Some(value)) = (row.get(0), row.get(1)) else {
                tracing::warn!(file = %path.display(), "skip short csv row");
                continue;
            };
            let record = match parse_csv_fields(ts, value) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "skip malformed csv row");
                    continue;
                }
            };
            match series.append(record, now) {
                Ok(()) => restored += 1,
                // Stale rows age out of the window; duplicates can appear
                // after an unclean shutdown. Both are expected here.
                Err(AppendError::OlderThanPrevious { .. }) => {}
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "skip csv row");
                }
            }
        }
        Ok(restored)
    }
}

fn partition_path(data_dir: &Path, name: &str, year: i32) -> PathBuf {
    data_dir.join(format!("{name}_{year}.csv"))
}
