//! Configuration for an experiment run.
//!
//! Loaded from an optional TOML file and then overridden by CLI flags. Every
//! field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::shell::PepperParams;

/// Default `CFLAGS`: blocking `pepper start` and no shell echo, so a command's
/// capture ends exactly when its prompt comes back.
pub const CFLAGS_DEFAULT: &str = "-DCONFIG_PEPPER_SHELL_BLOCKING=1 -DCONFIG_SHELL_NO_ECHO=1";

/// Top-level experiment configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// RIOT application directory to build and flash
    pub app_dir: PathBuf,

    /// Directory receiving TERMLOGs and the data file
    pub log_dir: PathBuf,

    /// Data file name, relative to `log_dir`
    pub data_file: String,

    /// Fewer environments than this aborts the run
    pub min_nodes: usize,

    /// Time given to every terminal to come up after provisioning
    pub settle_delay_ms: u64,

    /// Fixed slack added to bounded epoch deadlines (seconds)
    pub timeout_slack_s: f64,

    /// How long a stopped node gets to print its last output (seconds)
    pub stop_grace_s: u64,

    /// Deadline for short commands (uid, status, time)
    pub command_timeout_ms: u64,

    /// Extra compile flags passed as `CFLAGS`
    pub cflags: Option<String>,

    /// Extra modules passed as `USEMODULE`
    pub modules: Option<String>,

    /// Pre-built image; when set devices are flashed without compiling
    pub flashfile: Option<PathBuf>,

    /// Campaign parameters sent with `pepper start`
    pub params: PepperParams,

    /// IoT-LAB access and reservation settings
    pub testbed: TestbedConfig,
}

/// IoT-LAB REST access and reservation defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    pub api_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub site: String,
    /// Reservation name
    pub name: String,
    /// Reservation length in minutes
    pub duration_min: u32,
    pub poll_interval_ms: u64,
    /// Give up if the reservation is not running after this long
    pub wait_timeout_s: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            app_dir: PathBuf::from("."),
            log_dir: PathBuf::from("logs/exp"),
            data_file: "exp_data.log".to_string(),
            min_nodes: 2,
            settle_delay_ms: 3_000,
            timeout_slack_s: 3.0,
            stop_grace_s: 10,
            command_timeout_ms: 5_000,
            cflags: Some(CFLAGS_DEFAULT.to_string()),
            modules: None,
            flashfile: None,
            params: PepperParams::default(),
            testbed: TestbedConfig::default(),
        }
    }
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            api_url: "https://www.iot-lab.info/api".to_string(),
            user: None,
            password: None,
            site: "lille".to_string(),
            name: "dwm1001-pepper".to_string(),
            duration_min: 120,
            poll_interval_ms: 5_000,
            wait_timeout_s: 600,
        }
    }
}

impl ExperimentConfig {
    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Full path of the persisted data file.
    pub fn data_path(&self) -> PathBuf {
        self.log_dir.join(&self.data_file)
    }

    /// TERMLOG path for a node.
    pub fn termlog_path(&self, node_id: &str) -> PathBuf {
        self.log_dir.join(format!("{node_id}.log"))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn timeout_slack(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_slack_s.max(0.0))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_s)
    }
}

impl TestbedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_s)
    }
}
