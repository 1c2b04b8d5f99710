//! Device provisioning: flash, reset, open the shell.
//!
//! [`DeviceControlFactory`] turns an [`Environment`] into a live
//! [`DeviceSession`] and keeps every channel it opened in a registry so
//! [`DeviceControlFactory::close_all`] can tear them down on any exit path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{ControlChannel, ProcessChannel};
use crate::config::ExperimentConfig;
use crate::environment::Environment;
use crate::error::DeviceError;
use crate::shell::{DeviceSession, SharedChannel};

/// Build/flash/terminal tooling for one application.
#[async_trait]
pub trait FirmwareTool: Send + Sync {
    /// Run a build target (`flash`, `flash-only`, `reset`) with `env`.
    async fn run_target(
        &self,
        node_id: &str,
        env: &BTreeMap<String, String>,
        target: &str,
    ) -> Result<(), DeviceError>;

    /// Open the device terminal.
    async fn open_terminal(
        &self,
        node_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ControlChannel>, DeviceError>;
}

/// RIOT build system driven through `make -C <app_dir>`.
#[derive(Debug, Clone)]
pub struct RiotMakeTool {
    app_dir: PathBuf,
}

impl RiotMakeTool {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
        }
    }

    fn make(&self, env: &BTreeMap<String, String>, target: &str) -> Command {
        let mut command = Command::new("make");
        command
            .arg("--no-print-directory")
            .arg("-C")
            .arg(&self.app_dir)
            .arg(target)
            .envs(env);
        command
    }
}

#[async_trait]
impl FirmwareTool for RiotMakeTool {
    async fn run_target(
        &self,
        node_id: &str,
        env: &BTreeMap<String, String>,
        target: &str,
    ) -> Result<(), DeviceError> {
        debug!(node = %node_id, target, "make");
        let output = self
            .make(env, target)
            .output()
            .await
            .map_err(|source| DeviceError::Spawn {
                node_id: node_id.to_string(),
                target: target.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(DeviceError::Make {
                node_id: node_id.to_string(),
                target: target.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn open_terminal(
        &self,
        node_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ControlChannel>, DeviceError> {
        let channel =
            ProcessChannel::spawn(self.make(env, "term")).map_err(|source| DeviceError::Spawn {
                node_id: node_id.to_string(),
                target: "term".to_string(),
                source,
            })?;
        Ok(Box::new(channel))
    }
}

/// Provisions devices and owns the registry of their open channels.
pub struct DeviceControlFactory {
    tool: Arc<dyn FirmwareTool>,
    cflags: Option<String>,
    modules: Option<String>,
    flashfile: Option<PathBuf>,
    command_timeout: Duration,
    /// Flashing is exclusive across devices
    flash_lock: Mutex<()>,
    channels: DashMap<String, SharedChannel>,
}

impl DeviceControlFactory {
    pub fn new(tool: Arc<dyn FirmwareTool>, config: &ExperimentConfig) -> Self {
        Self {
            tool,
            cflags: config.cflags.clone(),
            modules: config.modules.clone(),
            flashfile: config.flashfile.clone(),
            command_timeout: config.command_timeout(),
            flash_lock: Mutex::new(()),
            channels: DashMap::new(),
        }
    }

    /// Node identifier of an environment.
    pub fn node_id(env: &Environment) -> Result<String, DeviceError> {
        env.node_id()
    }

    /// Variables passed to the firmware tool for `env`.
    pub fn build_env(&self, env: &Environment) -> BTreeMap<String, String> {
        let mut vars = env.vars().clone();
        if let Some(cflags) = &self.cflags {
            vars.insert("CFLAGS".to_string(), cflags.clone());
        }
        if let Some(modules) = &self.modules {
            vars.insert("USEMODULE".to_string(), modules.clone());
        }
        if let Some(flashfile) = &self.flashfile {
            vars.insert("FLASHFILE".to_string(), flashfile.display().to_string());
        }
        vars
    }

    fn flash_target(&self) -> &'static str {
        if self.flashfile.is_some() {
            "flash-only"
        } else {
            "flash"
        }
    }

    /// Flash, reset and open a shell session on the device of `env`.
    pub async fn provision(&self, env: &Environment) -> Result<DeviceSession, DeviceError> {
        let node_id = Self::node_id(env)?;
        let vars = self.build_env(env);

        {
            let _flashing = self.flash_lock.lock().await;
            info!(node = %node_id, target = self.flash_target(), "Flashing device");
            self.tool
                .run_target(&node_id, &vars, self.flash_target())
                .await?;
        }
        self.tool.run_target(&node_id, &vars, "reset").await?;

        let channel: SharedChannel =
            Arc::new(Mutex::new(self.tool.open_terminal(&node_id, &vars).await?));
        if let Some(previous) = self.channels.insert(node_id.clone(), channel.clone()) {
            warn!(node = %node_id, "Replacing an open channel for the same node");
            close_channel(&node_id, &previous).await;
        }
        info!(node = %node_id, "Terminal open");

        Ok(DeviceSession::shared(node_id, channel).with_command_timeout(self.command_timeout))
    }

    /// Channels opened and not yet closed.
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Close every registered channel once, returning how many were closed.
    pub async fn close_all(&self) -> usize {
        let node_ids: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for node_id in node_ids {
            if let Some((node_id, channel)) = self.channels.remove(&node_id) {
                close_channel(&node_id, &channel).await;
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "Closed device terminals");
        }
        closed
    }
}

async fn close_channel(node_id: &str, channel: &SharedChannel) {
    if let Err(e) = channel.lock().await.close().await {
        warn!(node = %node_id, error = %e, "Failed to close terminal");
    }
}
