//! Experiment results: aggregation, persistence and summaries.
//!
//! The data file holds newline-delimited JSON, one [`ExperimentSnapshot`] per
//! line. Sessions never reach it; only each node's [`NodeRecord`] does.

use std::path::{Path, PathBuf};

use pepper_data::{EpochOutcome, ExperimentSnapshot, NodeRecord};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::coordinator::Node;
use crate::error::StoreError;

/// Writes and reads the experiment data file.
#[derive(Debug, Clone)]
pub struct ExperimentDataStore {
    path: PathBuf,
}

impl ExperimentDataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(config.data_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Collect node results into a snapshot, dropping their sessions.
    ///
    /// Channels are not closed here; that is the device factory's job.
    pub fn aggregate(nodes: Vec<Node>) -> ExperimentSnapshot {
        ExperimentSnapshot::new(nodes.into_iter().map(Node::into_record).collect())
    }

    /// Write snapshots, replacing any previous data file.
    pub fn persist(&self, snapshots: &[ExperimentSnapshot]) -> Result<(), StoreError> {
        let data = ExperimentSnapshot::to_ndjson(snapshots)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        if self.path.exists() {
            warn!(path = %self.path.display(), "Overwriting existing data file");
        }
        std::fs::write(&self.path, data).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), snapshots = snapshots.len(), "Saved experiment data");
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<ExperimentSnapshot>, StoreError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(ExperimentSnapshot::from_ndjson(&text)?)
    }

    /// Aggregate and persist in one step.
    pub fn finalize(&self, nodes: Vec<Node>) -> Result<ExperimentSnapshot, StoreError> {
        let snapshot = Self::aggregate(nodes);
        self.persist(std::slice::from_ref(&snapshot))?;
        Ok(snapshot)
    }
}

/// Per-node counts for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub uid: Option<String>,
    pub outcome: Option<EpochOutcome>,
    pub epochs: usize,
    /// Encounter tokens over all epochs
    pub encounters: usize,
    pub ble_samples: usize,
    pub uwb_samples: usize,
}

impl From<&NodeRecord> for NodeSummary {
    fn from(record: &NodeRecord) -> Self {
        Self {
            node_id: record.node_id.clone(),
            uid: record.uid.clone(),
            outcome: record.outcome.clone(),
            epochs: record.epoch_data.len(),
            encounters: record.epoch_data.iter().map(|e| e.pets.len()).sum(),
            ble_samples: record.ble().count(),
            uwb_samples: record.uwb().count(),
        }
    }
}

pub fn summarize(snapshot: &ExperimentSnapshot) -> Vec<NodeSummary> {
    snapshot.nodes.iter().map(NodeSummary::from).collect()
}

/// Format a duration in milliseconds for display.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{:.1}m", ms as f64 / 60_000.0)
    }
}
