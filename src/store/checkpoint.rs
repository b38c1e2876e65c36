//! Checkpoint persistence.
//!
//! Snapshots are stored as a versioned JSON envelope. Out-of-band control
//! requests live next to the snapshot, not inside it, so a checkpoint write
//! from the step runner can never clobber a stop request queued meanwhile.
//!
//! On disk every queued request is its own file. Pushing never rewrites
//! another request, and draining claims each file with a rename, so a
//! `stop` from another process cannot be lost to a concurrent drain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::control::ControlRequest;
use crate::agent::run::RunSnapshot;

/// Current envelope version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint store errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Unsupported checkpoint version {found} (max {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Invalid run id: {0}")]
    InvalidRunId(String),
}

/// What actually lands on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointEnvelope {
    version: u32,
    saved_at: DateTime<Utc>,
    state: RunSnapshot,
}

impl CheckpointEnvelope {
    fn wrap(state: &RunSnapshot) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            state: state.clone(),
        }
    }

    fn into_snapshot(self) -> Result<RunSnapshot, CheckpointError> {
        if self.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        Ok(self.state)
    }
}

/// Durable run state.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, run_id: &str, state: &RunSnapshot) -> Result<(), CheckpointError>;

    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>, CheckpointError>;

    /// Queue a control request for a run that is currently executing.
    async fn push_control(&self, run_id: &str, request: ControlRequest)
        -> Result<(), CheckpointError>;

    /// Take every queued control request, oldest first.
    async fn drain_controls(&self, run_id: &str) -> Result<Vec<ControlRequest>, CheckpointError>;
}

/// JSON files under a directory: `<run>.json` for the snapshot and
/// `<run>.controls/` holding one file per queued request.
pub struct FileCheckpointStore {
    root: PathBuf,
    /// Orders pushes from this process that land on the same clock tick.
    sequence: AtomicU64,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(self.root.join(format!("{}.json", run_id)))
    }

    fn controls_dir(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(self.root.join(format!("{}.controls", run_id)))
    }

    /// Write to a sibling temp file then rename, so a crash never leaves a
    /// half-written checkpoint behind.
    async fn write_atomic(&self, path: &Path, bytes: Vec<u8>) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.root).await?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Sortable, unique name for a queued request.
    fn control_file_name(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{:020}-{:010}-{}.json", nanos, sequence, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, run_id: &str, state: &RunSnapshot) -> Result<(), CheckpointError> {
        let path = self.state_path(run_id)?;
        let bytes = serde_json::to_vec_pretty(&CheckpointEnvelope::wrap(state))?;
        self.write_atomic(&path, bytes).await
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>, CheckpointError> {
        let path = self.state_path(run_id)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: CheckpointEnvelope = serde_json::from_slice(&bytes)?;
        envelope.into_snapshot().map(Some)
    }

    async fn push_control(
        &self,
        run_id: &str,
        request: ControlRequest,
    ) -> Result<(), CheckpointError> {
        let dir = self.controls_dir(run_id)?;
        fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(&request)?;
        // The temp name does not end in `.json`, so drains skip it until the
        // rename lands.
        let name = self.control_file_name();
        let tmp = dir.join(format!("{}.tmp", name));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, dir.join(name)).await?;
        Ok(())
    }

    async fn drain_controls(&self, run_id: &str) -> Result<Vec<ControlRequest>, CheckpointError> {
        let dir = self.controls_dir(run_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        let mut requests = Vec::with_capacity(names.len());
        for name in names {
            let claimed = dir.join(format!("{}.claimed", name));
            match fs::rename(dir.join(&name), &claimed).await {
                Ok(()) => {}
                // Another drainer got there first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            let bytes = fs::read(&claimed).await?;
            fs::remove_file(&claimed).await?;
            requests.push(serde_json::from_slice(&bytes)?);
        }
        Ok(requests)
    }
}

/// Process-local store, used by tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    states: Mutex<HashMap<String, String>>,
    controls: Mutex<HashMap<String, Vec<ControlRequest>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, run_id: &str, state: &RunSnapshot) -> Result<(), CheckpointError> {
        // Serialized like the file store so both behave the same on reload.
        let json = serde_json::to_string(&CheckpointEnvelope::wrap(state))?;
        self.states.lock().await.insert(run_id.to_string(), json);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>, CheckpointError> {
        let states = self.states.lock().await;
        match states.get(run_id) {
            Some(json) => {
                let envelope: CheckpointEnvelope = serde_json::from_str(json)?;
                envelope.into_snapshot().map(Some)
            }
            None => Ok(None),
        }
    }

    async fn push_control(
        &self,
        run_id: &str,
        request: ControlRequest,
    ) -> Result<(), CheckpointError> {
        self.controls
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .push(request);
        Ok(())
    }

    async fn drain_controls(&self, run_id: &str) -> Result<Vec<ControlRequest>, CheckpointError> {
        Ok(self
            .controls
            .lock()
            .await
            .remove(run_id)
            .unwrap_or_default())
    }
}

fn validate_run_id(run_id: &str) -> Result<(), CheckpointError> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidRunId(run_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::{Plan, PlanStep, StepStatus, ToolSelector};
    use crate::agent::run::RunOptions;

    fn sample_snapshot() -> RunSnapshot {
        let mut snapshot = RunSnapshot::new("compare two laptops", RunOptions::default());
        let mut first = PlanStep::new("Open store", ToolSelector::Browser, 3);
        first.begin_attempt();
        first.complete(Some("store.example/home".into()), 12);
        snapshot.checkpoint.plan = Plan::new(vec![
            first,
            PlanStep::new("Read specs", ToolSelector::Observe, 3),
        ]);
        snapshot.checkpoint.last_error = Some("timeout".into());
        snapshot.touch();
        snapshot
    }

    #[tokio::test]
    async fn test_file_store_round_trip_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let snapshot = sample_snapshot();

        store.save(snapshot.id(), &snapshot).await.unwrap();
        let first = store.load(snapshot.id()).await.unwrap().unwrap();
        let second = store.load(snapshot.id()).await.unwrap().unwrap();

        assert_eq!(first, snapshot);
        assert_eq!(first, second);
        assert_eq!(
            first.checkpoint.plan.get(0).unwrap().status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_file_store_missing_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(matches!(
            store.load("../etc/passwd").await,
            Err(CheckpointError::InvalidRunId(_))
        ));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let snapshot = sample_snapshot();
        let mut envelope = serde_json::to_value(CheckpointEnvelope::wrap(&snapshot)).unwrap();
        envelope["version"] = serde_json::json!(CHECKPOINT_VERSION + 1);
        std::fs::write(
            dir.path().join(format!("{}.json", snapshot.id())),
            envelope.to_string(),
        )
        .unwrap();

        assert!(matches!(
            store.load(snapshot.id()).await,
            Err(CheckpointError::UnsupportedVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_controls_drain_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.push_control("run-1", ControlRequest::Stop).await.unwrap();
        store
            .push_control(
                "run-1",
                ControlRequest::OverrideStep {
                    step_id: "s1".into(),
                    status: StepStatus::Skipped,
                },
            )
            .await
            .unwrap();

        let drained = store.drain_controls("run-1").await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], ControlRequest::Stop);
        assert!(store.drain_controls("run-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_controls_survive_concurrent_drains_from_another_store() {
        let dir = tempfile::tempdir().unwrap();
        // Two stores over one directory stand in for two processes.
        let cli = FileCheckpointStore::new(dir.path());
        let engine = FileCheckpointStore::new(dir.path());

        let pushes = async {
            for i in 0..20 {
                cli.push_control(
                    "run-1",
                    ControlRequest::OverrideStep {
                        step_id: format!("s{}", i),
                        status: StepStatus::Skipped,
                    },
                )
                .await
                .unwrap();
                tokio::task::yield_now().await;
            }
        };
        let drains = async {
            let mut seen = Vec::new();
            for _ in 0..20 {
                seen.extend(engine.drain_controls("run-1").await.unwrap());
                tokio::task::yield_now().await;
            }
            seen
        };
        let ((), mut seen) = tokio::join!(pushes, drains);
        seen.extend(engine.drain_controls("run-1").await.unwrap());

        let ids: Vec<String> = seen
            .into_iter()
            .map(|request| match request {
                ControlRequest::OverrideStep { step_id, .. } => step_id,
                ControlRequest::Stop => panic!("unexpected stop"),
            })
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("s{}", i)).collect();
        assert_eq!(ids, expected);
        assert!(cli.drain_controls("run-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_matches_file_store() {
        let store = InMemoryCheckpointStore::new();
        let snapshot = sample_snapshot();
        store.save(snapshot.id(), &snapshot).await.unwrap();
        assert_eq!(store.load(snapshot.id()).await.unwrap(), Some(snapshot));

        store.push_control("r", ControlRequest::Stop).await.unwrap();
        assert_eq!(store.drain_controls("r").await.unwrap(), vec![ControlRequest::Stop]);
    }
}
