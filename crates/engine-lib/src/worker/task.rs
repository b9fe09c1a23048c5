//! Tasks, results and the collaborator contracts the worker pool depends on

use crate::models::Progress;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// A unit of work queued for the executors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Selects the registered handler
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
            priority: 0,
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of one task, published by the executor that ran it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub kind: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
    pub worker_id: usize,
}

/// Executes one kind of task
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Value>;
}

/// Where results and batch progress go
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist a successful result payload
    async fn save(&self, payload: &Value) -> Result<()>;

    /// Last progress recorded for `phase`
    async fn last_progress(&self, phase: &str) -> Result<Option<Progress>>;

    async fn record_progress(&self, progress: &Progress) -> Result<()>;

    /// Whether the item identified by `key` already has a saved result
    async fn is_done(&self, key: &str) -> Result<bool>;
}

/// Extract the deduplication key of a result payload
pub fn result_key(payload: &Value) -> Option<&str> {
    payload.get("key").and_then(Value::as_str)
}

#[derive(Debug, Default)]
struct SinkState {
    results: Vec<Value>,
    done: HashSet<String>,
    progress: HashMap<String, Progress>,
}

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark keys as done without storing a payload
    pub async fn mark_done<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().await;
        state.done.extend(keys.into_iter().map(Into::into));
    }

    pub async fn results(&self) -> Vec<Value> {
        self.state.lock().await.results.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.results.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn save(&self, payload: &Value) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(key) = result_key(payload) {
            state.done.insert(key.to_string());
        }
        state.results.push(payload.clone());
        Ok(())
    }

    async fn last_progress(&self, phase: &str) -> Result<Option<Progress>> {
        Ok(self.state.lock().await.progress.get(phase).cloned())
    }

    async fn record_progress(&self, progress: &Progress) -> Result<()> {
        self.state
            .lock()
            .await
            .progress
            .insert(progress.phase.clone(), progress.clone());
        Ok(())
    }

    async fn is_done(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().await.done.contains(key))
    }
}

/// Sink appending each result as one JSON line
///
/// Done keys are rebuilt from the file on open so a restarted run skips
/// items it already finished. Progress is kept in memory.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    done: Mutex<HashSet<String>>,
    progress: Mutex<HashMap<String, Progress>>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut done = HashSet::new();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read results from {}", path.display()))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                if let Ok(value) = serde_json::from_str::<Value>(line) {
                    if let Some(key) = result_key(&value) {
                        done.insert(key.to_string());
                    }
                }
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open results file {}", path.display()))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            done: Mutex::new(done),
            progress: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn save(&self, payload: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(payload).context("Failed to serialize result")?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;
        drop(file);

        if let Some(key) = result_key(payload) {
            self.done.lock().await.insert(key.to_string());
        }
        Ok(())
    }

    async fn last_progress(&self, phase: &str) -> Result<Option<Progress>> {
        Ok(self.progress.lock().await.get(phase).cloned())
    }

    async fn record_progress(&self, progress: &Progress) -> Result<()> {
        self.progress
            .lock()
            .await
            .insert(progress.phase.clone(), progress.clone());
        Ok(())
    }

    async fn is_done(&self, key: &str) -> Result<bool> {
        Ok(self.done.lock().await.contains(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_tracks_done_keys() {
        let sink = MemorySink::new();
        sink.save(&json!({"key": "a.example.com", "addresses": []}))
            .await
            .unwrap();
        sink.save(&json!({"no_key": true})).await.unwrap();

        assert!(sink.is_done("a.example.com").await.unwrap());
        assert!(!sink.is_done("b.example.com").await.unwrap());
        assert_eq!(sink.len().await, 2);
    }

    #[tokio::test]
    async fn test_memory_sink_progress_per_phase() {
        let sink = MemorySink::new();
        assert!(sink.last_progress("dns").await.unwrap().is_none());

        sink.record_progress(&Progress::new("dns", 2, 300)).await.unwrap();
        sink.record_progress(&Progress::new("ports", 0, 10)).await.unwrap();
        sink.record_progress(&Progress::new("dns", 3, 400)).await.unwrap();

        assert_eq!(sink.last_progress("dns").await.unwrap().unwrap().item_index, 400);
        assert_eq!(sink.last_progress("ports").await.unwrap().unwrap().item_index, 10);
    }

    #[tokio::test]
    async fn test_json_lines_sink_reopens_with_done_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");

        {
            let sink = JsonLinesSink::open(&path).await.unwrap();
            sink.save(&json!({"key": "10.0.0.1:22", "open": true}))
                .await
                .unwrap();
            sink.save(&json!({"key": "10.0.0.1:80", "open": true}))
                .await
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let reopened = JsonLinesSink::open(&path).await.unwrap();
        assert!(reopened.is_done("10.0.0.1:22").await.unwrap());
        assert!(reopened.is_done("10.0.0.1:80").await.unwrap());
        assert!(!reopened.is_done("10.0.0.1:443").await.unwrap());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("t1", "dns", json!("example.com")).with_priority(3);
        assert_eq!(task.priority, 3);
        assert_eq!(task.retry_count, 0);
    }
}
