//! Raw oracle response recording.
//!
//! Every oracle exchange is handed to a [`ResponseRecorder`] together with
//! its outcome so that unusable answers can be inspected after the run.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Parsed { entries: usize, discarded: usize },
    Unparseable { message: String },
    InvocationFailed { attempts: u32, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedResponse {
    pub chunk_id: usize,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

pub trait ResponseRecorder: Send + Sync {
    fn record(&self, entry: &RecordedResponse);
}

/// Logs responses through `tracing`; failures at warn level, the rest at debug.
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl ResponseRecorder for TracingRecorder {
    fn record(&self, entry: &RecordedResponse) {
        match &entry.outcome {
            ResponseOutcome::Parsed { entries, discarded } => tracing::debug!(
                chunk_id = entry.chunk_id,
                provider = %entry.provider,
                entries,
                discarded,
                "Oracle response parsed"
            ),
            ResponseOutcome::Unparseable { message } => tracing::warn!(
                chunk_id = entry.chunk_id,
                provider = %entry.provider,
                error = %message,
                raw_response = entry.raw_response.as_deref().unwrap_or_default(),
                "Oracle response unusable"
            ),
            ResponseOutcome::InvocationFailed { attempts, message } => tracing::warn!(
                chunk_id = entry.chunk_id,
                provider = %entry.provider,
                attempts,
                error = %message,
                "Oracle invocation failed"
            ),
        }
    }
}

/// Appends one JSON line per response to a file.
pub struct FileRecorder {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileRecorder {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct FileLine<'a> {
    recorded_at: String,
    #[serde(flatten)]
    entry: &'a RecordedResponse,
}

impl ResponseRecorder for FileRecorder {
    fn record(&self, entry: &RecordedResponse) {
        let line = FileLine {
            recorded_at: chrono::Utc::now().to_rfc3339(),
            entry,
        };
        let result = serde_json::to_string(&line)
            .map_err(std::io::Error::other)
            .and_then(|json| match self.file.lock() {
                Ok(mut file) => writeln!(file, "{}", json),
                Err(_) => Err(std::io::Error::other("response log lock poisoned")),
            });

        if let Err(e) = result {
            tracing::warn!(
                path = %self.path.display(),
                chunk_id = entry.chunk_id,
                error = %e,
                "Failed to write oracle response log"
            );
        }
    }
}

/// Keeps responses in memory. Used by tests.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    entries: Mutex<Vec<RecordedResponse>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RecordedResponse> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl ResponseRecorder for MemoryRecorder {
    fn record(&self, entry: &RecordedResponse) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_entry() -> RecordedResponse {
        RecordedResponse {
            chunk_id: 2,
            provider: "mock".to_string(),
            raw_response: Some("not json".to_string()),
            outcome: ResponseOutcome::Unparseable {
                message: "no structure".to_string(),
            },
        }
    }

    #[test]
    fn file_recorder_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.jsonl");
        let recorder = FileRecorder::create(&path).unwrap();
        recorder.record(&failed_entry());
        recorder.record(&failed_entry());

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["chunk_id"], 2);
        assert_eq!(value["outcome"], "unparseable");
        assert_eq!(value["raw_response"], "not json");
        assert!(value["recorded_at"].is_string());
    }

    #[test]
    fn memory_recorder_keeps_entries() {
        let recorder = MemoryRecorder::new();
        recorder.record(&failed_entry());
        assert_eq!(recorder.entries(), vec![failed_entry()]);
    }
}
