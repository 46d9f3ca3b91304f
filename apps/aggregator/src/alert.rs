use crate::series::{Series, SeriesKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64;

/// Ordered classification of a series at one supervisor tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    Ok,
    MissingData,
    RangeLow { value: f64, low: f64 },
    RangeHigh { value: f64, high: f64 },
}

pub fn classify(series: &Series, now: DateTime<Utc>) -> Condition {
    let Some(record) = series.current(now) else {
        if series.fail_notify() {
            return Condition::MissingData;
        }
        return Condition::Ok;
    };
    match series.kind() {
        SeriesKind::Temperature { low, high } => {
            let Some(value) = record.value.as_number() else {
                return Condition::Ok;
            };
            if value < low {
                Condition::RangeLow { value, low }
            } else if value > high {
                Condition::RangeHigh { value, high }
            } else {
                Condition::Ok
            }
        }
        SeriesKind::Switch => Condition::Ok,
    }
}

/// Deduplicates alert conditions over per-key cool-down windows and batches
/// the surviving messages for one delivery per tick.
pub struct Alerter {
    pause_value: Duration,
    pause_failure: Duration,
    next_send: HashMap<u64, DateTime<Utc>>,
    failures: HashMap<String, u64>,
    outbox: Vec<String>,
}

impl Alerter {
    pub fn new(pause_value: Duration, pause_failure: Duration) -> Self {
        Self {
            pause_value,
            pause_failure,
            next_send: HashMap::new(),
            failures: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    pub fn observe(&mut self, series: &Series, now: DateTime<Utc>) {
        match classify(series, now) {
            Condition::Ok => {}
            Condition::MissingData => {
                let key = alert_key(series.name(), "failure");
                if self.suppressed(key, now) {
                    tracing::warn!(series = %series.name(), "no data (suppressed)");
                    return;
                }
                let count = self
                    .failures
                    .entry(series.name().to_string())
                    .and_modify(|n| *n += 1)
                    .or_insert(1);
                let message = format!(
                    "Messpunkt \"{}\" liefert keine Daten (Ausfall {})",
                    series.name(),
                    count
                );
                self.enqueue(key, message, self.pause_failure, now);
            }
            Condition::RangeLow { .. } => {
                self.observe_range(series, "low", now);
            }
            Condition::RangeHigh { .. } => {
                self.observe_range(series, "high", now);
            }
        }
    }

    fn observe_range(&mut self, series: &Series, tag: &str, now: DateTime<Utc>) {
        let Some(message) = series.warning(now) else {
            return;
        };
        let key = alert_key(series.name(), tag);
        if self.suppressed(key, now) {
            tracing::warn!(series = %series.name(), %message, "out of range (suppressed)");
            return;
        }
        self.enqueue(key, message, self.pause_value, now);
    }

    fn suppressed(&self, key: u64, now: DateTime<Utc>) -> bool {
        self.next_send
            .get(&key)
            .is_some_and(|next_send| now < *next_send)
    }

    fn enqueue(&mut self, key: u64, message: String, pause: Duration, now: DateTime<Utc>) {
        self.next_send.insert(key, now + pause);
        tracing::warn!(%message, "alert queued");
        self.outbox.push(message);
    }

    /// Takes the batched messages for one combined delivery.
    pub fn flush(&mut self) -> Option<String> {
        if self.outbox.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.outbox).join("\n"))
    }
}

fn alert_key(name: &str, tag: &str) -> u64 {
    let mut material = Vec::with_capacity(name.len() + tag.len() + 1);
    material.extend_from_slice(name.as_bytes());
    material.push(0);
    material.extend_from_slice(tag.as_bytes());
    xxh3_64(&material)
}
