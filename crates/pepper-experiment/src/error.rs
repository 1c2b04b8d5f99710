//! Error types for the experiment orchestrator.
//!
//! Failures are decided at two granularities: whole-run (classification,
//! provisioning, reservation) and per node (timeouts and channel errors during
//! an epoch, which are recorded as an [`pepper_data::EpochOutcome`] instead).

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::environment::Environment;

/// Control channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel is closed")]
    Closed,
    #[error("control channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors of the environment factories.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("reservation spec is not supported by the {0} environment factory")]
    UnsupportedSpec(&'static str),
    #[error("failed to read boards file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid boards file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Testbed(#[from] TestbedError),
}

/// Errors talking to, or validating requests for, the IoT-LAB testbed.
#[derive(Debug, Error)]
pub enum TestbedError {
    #[error("iotlab site must be one of {expected:?}, got {site}")]
    UnknownSite {
        site: String,
        expected: &'static [&'static str],
    },
    #[error("{0} BOARD unsupported in iotlab")]
    UnsupportedBoard(String),
    #[error("unable to parse {0} as IoT-LAB node name of format <node-name>.<site-name>.iot-lab.info")]
    InvalidNodeAddress(String),
    #[error("all nodes must be on the same site ({site}), got {node}")]
    SiteMismatch { node: String, site: String },
    #[error("IOTLAB_NODE {node} doesn't match BOARD {board}")]
    BoardMismatch { node: String, board: String },
    #[error("experiment {exp_id} entered state {state} instead of Running")]
    UnexpectedState { exp_id: u64, state: String },
    #[error("experiment {exp_id} not running after {waited:?}")]
    WaitTimeout { exp_id: u64, waited: Duration },
    #[error("testbed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("testbed returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("missing testbed credentials (set IOTLAB_USER and IOTLAB_PASSWORD)")]
    MissingCredentials,
}

/// Errors while provisioning a device or opening its session.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot construct node id: none of IOTLAB_NODE, BOARD_INDEX or DEBUG_ADAPTER_ID in {0}")]
    NodeClassification(Environment),
    #[error("`make {target}` failed for {node_id} ({status}): {stderr}")]
    Make {
        node_id: String,
        target: String,
        status: String,
        stderr: String,
    },
    #[error("failed to spawn `make {target}` for {node_id}: {source}")]
    Spawn {
        node_id: String,
        target: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Violations of a node's lifecycle rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("uid of {node_id} already assigned ({uid})")]
    UidAlreadyAssigned { node_id: String, uid: String },
    #[error("{node_id} is not idle, cannot {action}")]
    NotIdle {
        node_id: String,
        action: &'static str,
    },
}

/// Snapshot persistence failures. Fatal to the process.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Snapshot(#[from] pepper_data::SnapshotError),
}

/// Run-level failures of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
