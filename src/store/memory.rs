//! Session and long-term memory.
//!
//! Session memory is a short rolling list of summaries per run, handed to
//! every planner call. Long-term memory is a write-once, tagged record set
//! keyed by an opaque memory key. Candidates are validated before they are
//! accepted; a rejection is reported to the caller, never raised as an error.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Tags used by the engine for long-term entries.
pub mod tags {
    pub const AGENT_RUN: &str = "agent-run";
    pub const SELF_IMPROVEMENT: &str = "self-improvement";
    pub const BRANCH: &str = "branch";
    pub const REPLAN: &str = "replan";
    pub const DEAD_END: &str = "dead-end";
    pub const CONTEXT_SHIFT: &str = "context-shift";
    pub const STAGNATION: &str = "stagnation";
    pub const NO_CONTEXT: &str = "no-context";
    pub const MISSING_EXTRACTION: &str = "missing-extraction";
    pub const LOOP_GUARD: &str = "loop-guard";
    pub const SELF_CHECK: &str = "self-check";
}

/// Shortest content worth remembering.
pub const MIN_LONG_TERM_CHARS: usize = 16;

/// Lowest importance accepted into long-term memory.
pub const MIN_IMPORTANCE: f32 = 0.1;

/// Memory store errors.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A rolling summary produced during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A validated long-term record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermEntry {
    pub key: String,
    pub content: String,
    pub tags: Vec<String>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

/// Result of a long-term write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryWriteOutcome {
    Accepted,
    Skipped { reason: String },
}

impl MemoryWriteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Memory backend used by the engine.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append a summary for a run, keeping only the most recent `limit`.
    async fn add_session_summary(
        &self,
        run_id: &str,
        summary: &str,
        limit: usize,
    ) -> Result<(), MemoryError>;

    async fn session_summaries(&self, run_id: &str) -> Result<Vec<String>, MemoryError>;

    async fn add_validated_long_term(
        &self,
        key: &str,
        content: &str,
        tags: &[&str],
        importance: f32,
    ) -> Result<MemoryWriteOutcome, MemoryError>;
}

/// Persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryDocument {
    #[serde(default)]
    sessions: HashMap<String, VecDeque<SessionSummary>>,
    #[serde(default)]
    long_term: Vec<LongTermEntry>,
    /// Version for future compatibility.
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// JSON-file memory. Without a path it keeps everything in process.
pub struct JsonMemoryStore {
    path: Option<PathBuf>,
    document: Mutex<MemoryDocument>,
}

impl JsonMemoryStore {
    /// In-process only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Mutex::new(MemoryDocument {
                version: default_version(),
                ..MemoryDocument::default()
            }),
        }
    }

    /// Load memory from a JSON file; a missing file starts empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryDocument {
                version: default_version(),
                ..MemoryDocument::default()
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            document: Mutex::new(document),
        })
    }

    /// All long-term entries, oldest first.
    pub async fn long_term_entries(&self) -> Vec<LongTermEntry> {
        self.document.lock().await.long_term.clone()
    }

    async fn persist(&self, document: &MemoryDocument) -> Result<(), MemoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

/// Decide whether a candidate is worth keeping.
fn validate_candidate(
    existing: &[LongTermEntry],
    key: &str,
    content: &str,
    importance: f32,
) -> Option<String> {
    let normalized = normalize(content);
    if normalized.chars().count() < MIN_LONG_TERM_CHARS {
        return Some("low_value: content too short".to_string());
    }
    if !importance.is_finite() || importance < MIN_IMPORTANCE {
        return Some(format!("low_value: importance {:.2} below threshold", importance));
    }
    let duplicate = existing
        .iter()
        .any(|entry| entry.key == key && normalize(&entry.content) == normalized);
    if duplicate {
        return Some("duplicate: same content already stored for key".to_string());
    }
    None
}

fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl MemoryStore for JsonMemoryStore {
    async fn add_session_summary(
        &self,
        run_id: &str,
        summary: &str,
        limit: usize,
    ) -> Result<(), MemoryError> {
        let summary = summary.trim();
        if summary.is_empty() {
            return Ok(());
        }
        let mut document = self.document.lock().await;
        let window = document.sessions.entry(run_id.to_string()).or_default();
        window.push_back(SessionSummary {
            content: summary.to_string(),
            created_at: Utc::now(),
        });
        // Enforce window limit
        while window.len() > limit.max(1) {
            window.pop_front();
        }
        self.persist(&document).await
    }

    async fn session_summaries(&self, run_id: &str) -> Result<Vec<String>, MemoryError> {
        let document = self.document.lock().await;
        Ok(document
            .sessions
            .get(run_id)
            .map(|window| window.iter().map(|s| s.content.clone()).collect())
            .unwrap_or_default())
    }

    async fn add_validated_long_term(
        &self,
        key: &str,
        content: &str,
        tags: &[&str],
        importance: f32,
    ) -> Result<MemoryWriteOutcome, MemoryError> {
        let mut document = self.document.lock().await;
        if let Some(reason) = validate_candidate(&document.long_term, key, content, importance) {
            return Ok(MemoryWriteOutcome::Skipped { reason });
        }
        document.long_term.push(LongTermEntry {
            key: key.to_string(),
            content: content.trim().to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            importance: importance.clamp(0.0, 1.0),
            created_at: Utc::now(),
        });
        self.persist(&document).await?;
        Ok(MemoryWriteOutcome::Accepted)
    }
}
