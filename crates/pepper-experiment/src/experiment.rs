//! Experiment orchestration.
//!
//! One run: reserve environments, provision a device per environment, sync
//! identity and clocks, run the campaign on all nodes, tear everything down,
//! repair the terminal logs and save the results to the data file.
//!
//! Teardown (closing every terminal, releasing the reservation) happens on
//! every exit path, panics included.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use pepper_data::ExperimentSnapshot;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ExperimentConfig;
use crate::coordinator::{EpochCoordinator, Node};
use crate::device::{DeviceControlFactory, FirmwareTool};
use crate::environment::{EnvironmentFactory, ReservationSpec, TERMLOG};
use crate::error::OrchestratorError;
use crate::results::ExperimentDataStore;
use crate::sanitizer::sanitize_termlog;
use crate::shell::{ClockControl, PepperControl};

/// Runs PEPPER experiments over reserved devices.
pub struct Orchestrator {
    config: ExperimentConfig,
    devices: DeviceControlFactory,
    store: ExperimentDataStore,
}

impl Orchestrator {
    pub fn new(config: ExperimentConfig, firmware: Arc<dyn FirmwareTool>) -> Self {
        let devices = DeviceControlFactory::new(firmware, &config);
        let store = ExperimentDataStore::from_config(&config);
        Self {
            config,
            devices,
            store,
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceControlFactory {
        &self.devices
    }

    pub fn store(&self) -> &ExperimentDataStore {
        &self.store
    }

    /// Run with the environment factory matching `spec`.
    pub async fn run(&self, spec: &ReservationSpec) -> Result<ExperimentSnapshot, OrchestratorError> {
        let (_stop_tx, stop_rx) = watch::channel(false);
        self.run_until(spec, stop_rx).await
    }

    /// Like [`Self::run`], ending running campaigns once `stop` is set.
    pub async fn run_until(
        &self,
        spec: &ReservationSpec,
        stop: watch::Receiver<bool>,
    ) -> Result<ExperimentSnapshot, OrchestratorError> {
        let mut factory = spec.factory(&self.config.testbed)?;
        self.run_with(factory.as_mut(), spec, stop).await
    }

    /// Run with an explicit environment factory.
    ///
    /// Too few environments is not an error: it is logged and an empty
    /// snapshot is returned without touching the data file.
    pub async fn run_with(
        &self,
        factory: &mut dyn EnvironmentFactory,
        spec: &ReservationSpec,
        stop: watch::Receiver<bool>,
    ) -> Result<ExperimentSnapshot, OrchestratorError> {
        let outcome = AssertUnwindSafe(self.execute(&mut *factory, spec, stop))
            .catch_unwind()
            .await;
        self.teardown(factory).await;

        let nodes = match outcome {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        if nodes.is_empty() {
            return Ok(ExperimentSnapshot::default());
        }
        for node in &nodes {
            self.sanitize(node.node_id());
        }
        Ok(self.store.finalize(nodes)?)
    }

    async fn execute(
        &self,
        factory: &mut dyn EnvironmentFactory,
        spec: &ReservationSpec,
        stop: watch::Receiver<bool>,
    ) -> Result<Vec<Node>, OrchestratorError> {
        let envs = factory.reserve(spec).await?;
        info!(
            factory = factory.name(),
            requested = ?spec.requested(),
            count = envs.len(),
            "Reserved environments"
        );
        if envs.len() < self.config.min_nodes {
            error!(
                count = envs.len(),
                required = self.config.min_nodes,
                "Not enough devices"
            );
            return Ok(Vec::new());
        }

        let log_dir = &self.config.log_dir;
        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|source| OrchestratorError::LogDir {
                path: log_dir.clone(),
                source,
            })?;

        let mut nodes = Vec::with_capacity(envs.len());
        for env in envs {
            let node_id = DeviceControlFactory::node_id(&env)?;
            let termlog = self.config.termlog_path(&node_id);
            let env = env.with_var(TERMLOG, termlog.display().to_string());
            let session = self.devices.provision(&env).await?;
            nodes.push(Node::new(session, env.position()));
        }

        debug!(delay = ?self.config.settle_delay(), "Waiting for terminals");
        tokio::time::sleep(self.config.settle_delay()).await;

        for node in nodes.iter_mut() {
            match node.session().get_uid().await {
                Ok(Some(uid)) => {
                    info!(node = %node.node_id(), uid = %uid, "Device identified");
                    node.set_uid(uid)?;
                }
                Ok(None) => warn!(node = %node.node_id(), "No uid in reply"),
                Err(e) => warn!(node = %node.node_id(), error = %e, "Failed to query uid"),
            }
            if let Err(e) = node.session().current_time_set_now().await {
                warn!(node = %node.node_id(), error = %e, "Failed to set device time");
            }
        }

        let coordinator = EpochCoordinator::new(
            self.config.params.clone(),
            self.config.timeout_slack(),
            self.config.stop_grace(),
        );
        coordinator.run_all_until(&mut nodes, stop).await?;
        Ok(nodes)
    }

    async fn teardown(&self, factory: &mut dyn EnvironmentFactory) {
        self.devices.close_all().await;
        if let Err(e) = factory.release().await {
            warn!(factory = factory.name(), error = %e, "Failed to release environments");
        }
    }

    fn sanitize(&self, node_id: &str) {
        let path = self.config.termlog_path(node_id);
        if !path.exists() {
            warn!(node = %node_id, path = %path.display(), "TERMLOG missing, skipping cleanup");
            return;
        }
        match sanitize_termlog(&path) {
            Ok(true) => debug!(node = %node_id, "TERMLOG cleaned"),
            Ok(false) => {}
            Err(e) => warn!(node = %node_id, error = %e, "Failed to clean TERMLOG"),
        }
    }
}
