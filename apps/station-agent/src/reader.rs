use crate::config::{EmitDef, InputKind, SensorDef};
use crate::outbox::Value;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// One reading produced by a sensor, addressed to a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub group: String,
    pub name: String,
    pub value: Value,
}

/// A configured device with its reader plug-in and minimum read interval.
/// A sample attempt inside the interval window is skipped without touching
/// the hardware.
pub struct Sensor {
    kind: InputKind,
    file: PathBuf,
    interval: Duration,
    next_read: Option<Instant>,
    temperature: Option<EmitDef>,
    switch: Option<EmitDef>,
    ocr_command: String,
}

impl Sensor {
    pub fn from_def(def: &SensorDef, ocr_command: &str) -> Result<Self> {
        match def.input.kind {
            InputKind::Ds18b20 | InputKind::MdegCelsius => {
                if def.output.temperature.is_none() {
                    bail!("sensor {} has no temperature output", def.input.file.display());
                }
            }
            InputKind::Thermosolar => {
                if def.output.temperature.is_none() || def.output.switch.is_none() {
                    bail!(
                        "thermosolar sensor {} needs temperature and switch outputs",
                        def.input.file.display()
                    );
                }
            }
        }
        Ok(Self {
            kind: def.input.kind,
            file: def.input.file.clone(),
            interval: Duration::from_secs(def.input.interval),
            next_read: None,
            temperature: def.output.temperature.clone(),
            switch: def.output.switch.clone(),
            ocr_command: ocr_command.to_string(),
        })
    }

    pub fn label(&self) -> String {
        self.temperature
            .as_ref()
            .or(self.switch.as_ref())
            .map(|out| out.name.clone())
            .unwrap_or_else(|| self.file.display().to_string())
    }

    /// Returns `None` while the interval gate is closed.
    pub async fn sample(&mut self, now: Instant) -> Option<Result<Vec<Reading>>> {
        if let Some(next) = self.next_read {
            if now < next {
                return None;
            }
        }
        self.next_read = Some(now + self.interval);
        Some(self.read().await)
    }

    async fn read(&self) -> Result<Vec<Reading>> {
        match self.kind {
            InputKind::Ds18b20 => {
                let raw = fs::read_to_string(&self.file)
                    .with_context(|| format!("read {}", self.file.display()))?;
                let celsius = parse_w1_slave(&raw)?;
                Ok(vec![self.temperature_reading(celsius)])
            }
            InputKind::MdegCelsius => {
                let raw = fs::read_to_string(&self.file)
                    .with_context(|| format!("read {}", self.file.display()))?;
                let celsius = parse_mdeg(&raw)?;
                Ok(vec![self.temperature_reading(celsius)])
            }
            InputKind::Thermosolar => {
                let reading = self.run_ocr().await?;
                let switch = self.switch.as_ref().expect("checked in from_def");
                Ok(vec![
                    self.temperature_reading(reading.temperature as f64),
                    Reading {
                        group: switch.group.clone(),
                        name: switch.name.clone(),
                        value: Value::Bool(reading.pump),
                    },
                ])
            }
        }
    }

    fn temperature_reading(&self, celsius: f64) -> Reading {
        let out = self.temperature.as_ref().expect("checked in from_def");
        Reading {
            group: out.group.clone(),
            name: out.name.clone(),
            value: Value::Number(celsius),
        }
    }

    /// Capture and OCR live in an external program; the agent only speaks
    /// its JSON result contract.
    async fn run_ocr(&self) -> Result<OcrResult> {
        let output = tokio::process::Command::new(&self.ocr_command)
            .arg(&self.file)
            .output()
            .await
            .with_context(|| format!("run {}", self.ocr_command))?;
        if !output.status.success() {
            bail!("{} exited with {}", self.ocr_command, output.status);
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parse {} output", self.ocr_command))
    }
}

#[derive(Debug, Deserialize)]
struct OcrResult {
    temperature: i64,
    pump: bool,
}

/// Kernel w1_slave format: the first line ends in `YES` when the CRC was
/// good, the second carries `t=<millidegrees>`.
fn parse_w1_slave(raw: &str) -> Result<f64> {
    let mut lines = raw.lines();
    let crc_line = lines.next().ok_or_else(|| anyhow!("empty w1 file"))?;
    if !crc_line.trim().ends_with("YES") {
        bail!("sensor says no");
    }
    let data_line = lines.next().ok_or_else(|| anyhow!("missing w1 data line"))?;
    let mdeg = data_line
        .rsplit("t=")
        .next()
        .ok_or_else(|| anyhow!("missing t= field"))?
        .trim()
        .parse::<i64>()
        .context("invalid t= value")?;
    Ok(mdeg as f64 / 1e3)
}

fn parse_mdeg(raw: &str) -> Result<f64> {
    let mdeg = raw.trim().parse::<i64>().context("invalid millidegree value")?;
    Ok(mdeg as f64 / 1e3)
}
