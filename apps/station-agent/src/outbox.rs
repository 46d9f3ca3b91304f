use anyhow::{Context, Result};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const MAX_FRAME_LEN: usize = 64 * 1024;

/// A reading on its way to the aggregator. `timestamp` is UTC Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub group: String,
    pub name: String,
    pub timestamp: i64,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
}

/// Durable FIFO of pending entries, backed by a single file of
/// length-prefixed JSON frames: `len(u32 LE) | crc32c(u32 LE) | payload`.
///
/// `push` appends a frame to the open file so an unclean exit loses nothing;
/// `persist` rewrites the file atomically (temp + rename) after each drain.
/// The loader keeps the valid prefix of a truncated or corrupt file.
pub struct Outbox {
    path: PathBuf,
    file: fs::File,
    entries: VecDeque<Entry>,
}

impl Outbox {
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match fs::read(path) {
            Ok(raw) => decode_frames(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let mut outbox = Self {
            path: path.to_path_buf(),
            file: open_append(path)?,
            entries,
        };
        // Rewrite once so a corrupt tail does not linger on disk.
        outbox.persist()?;
        Ok(outbox)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front(&self) -> Option<&Entry> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<Entry> {
        self.entries.pop_front()
    }

    pub fn push(&mut self, entry: Entry) -> Result<()> {
        let frame = encode_frame(&entry)?;
        self.file
            .write_all(&frame)
            .with_context(|| format!("append to {}", self.path.display()))?;
        self.file.flush().ok();
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn persist(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let mut buf = Vec::new();
        for entry in &self.entries {
            buf.extend_from_slice(&encode_frame(entry)?);
        }
        fs::write(&tmp, &buf).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        // The rename replaced the inode the append handle pointed at.
        self.file = open_append(&self.path)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

fn encode_frame(entry: &Entry) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(entry).context("encode outbox entry")?;
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_frames(raw: &[u8]) -> VecDeque<Entry> {
    let mut entries = VecDeque::new();
    let mut pos = 0usize;
    while raw.len() >= pos + 8 {
        let len = u32::from_le_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(raw[pos + 4..pos + 8].try_into().unwrap());
        if len == 0 || len > MAX_FRAME_LEN || raw.len() < pos + 8 + len {
            break;
        }
        let payload = &raw[pos + 8..pos + 8 + len];
        if crc32c(payload) != crc {
            break;
        }
        match serde_json::from_slice::<Entry>(payload) {
            Ok(entry) => entries.push_back(entry),
            Err(err) => {
                tracing::warn!(error = %err, "skip undecodable outbox frame");
                break;
            }
        }
        pos += 8 + len;
    }
    if pos < raw.len() {
        tracing::warn!(
            kept = entries.len(),
            dropped_bytes = raw.len() - pos,
            "outbox file had a corrupt tail"
        );
    }
    entries
}
