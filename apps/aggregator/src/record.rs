use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar observation value. Booleans come from switch sensors, numbers
/// from temperature sensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            // Shortest representation that parses back exactly, always with
            // a decimal point (21.0, not 21).
            Value::Number(n) => write!(f, "{n:?}"),
        }
    }
}

/// One observation: UTC timestamp with second resolution plus a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

impl Record {
    pub fn new(timestamp: DateTime<Utc>, value: Value) -> Self {
        Self { timestamp, value }
    }

    pub fn from_unix(secs: i64, value: Value) -> Result<Self> {
        let timestamp = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| anyhow!("timestamp {secs} out of range"))?;
        Ok(Self { timestamp, value })
    }

    /// CSV partition line: `<unix_seconds>,<value>`.
    pub fn to_csv_line(&self) -> String {
        format!("{},{}", self.timestamp.timestamp(), self.value)
    }
}

/// The universal value parser: `True`/`False` are booleans, everything else
/// must be a real number.
pub fn parse_value(token: &str) -> Result<Value> {
    match token.trim() {
        "True" => Ok(Value::Bool(true)),
        "False" => Ok(Value::Bool(false)),
        other => other
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| anyhow!("invalid value token {other:?}")),
    }
}

pub fn parse_csv_fields(unix_secs: &str, value: &str) -> Result<Record> {
    let secs = unix_secs
        .trim()
        .parse::<i64>()
        .map_err(|_| anyhow!("invalid timestamp {unix_secs:?}"))?;
    Record::from_unix(secs, parse_value(value)?)
}
