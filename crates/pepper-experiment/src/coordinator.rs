//! Epoch coordination across nodes.
//!
//! Every node is sent `pepper start` first, then all of them are awaited
//! together on the calling task. Each node has its own deadline and its own
//! outcome: a node that times out or loses its channel never holds up, or
//! cancels, the others.

use std::time::Duration;

use futures::future::join_all;
use pepper_data::{EpochOutcome, NodeRecord, Position, classify_lines};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ChannelError, NodeError};
use crate::shell::{DeviceSession, PepperControl, PepperParams, ShellInteraction, Step};

/// Where a node is in its epoch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    Idle,
    Starting,
    AwaitingCompletion,
    Completed,
    TimedOut,
    Failed,
}

impl EpochState {
    fn in_flight(self) -> bool {
        matches!(self, Self::Starting | Self::AwaitingCompletion)
    }
}

/// Maximum time to wait for a campaign, `None` when it runs until stopped.
///
/// `duration * iterations * 1.1 + slack` seconds.
pub fn epoch_timeout(params: &PepperParams, slack: Duration) -> Option<Duration> {
    if params.iterations == 0 {
        return None;
    }
    let campaign = f64::from(params.duration) * f64::from(params.iterations) * 1.1;
    Some(Duration::from_secs_f64(campaign) + slack)
}

/// A provisioned device and the results collected from it.
#[derive(Debug)]
pub struct Node {
    session: DeviceSession,
    record: NodeRecord,
    state: EpochState,
}

impl Node {
    pub fn new(session: DeviceSession, position: Option<Position>) -> Self {
        let record = NodeRecord::new(session.node_id(), position);
        Self {
            session,
            record,
            state: EpochState::Idle,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.record.node_id
    }

    pub fn uid(&self) -> Option<&str> {
        self.record.uid.as_deref()
    }

    /// Assign the device uid. Allowed once, before any epoch.
    pub fn set_uid(&mut self, uid: impl Into<String>) -> Result<(), NodeError> {
        if let Some(uid) = &self.record.uid {
            return Err(NodeError::UidAlreadyAssigned {
                node_id: self.record.node_id.clone(),
                uid: uid.clone(),
            });
        }
        if self.state != EpochState::Idle {
            return Err(NodeError::NotIdle {
                node_id: self.record.node_id.clone(),
                action: "assign a uid",
            });
        }
        self.record.uid = Some(uid.into());
        Ok(())
    }

    pub fn state(&self) -> EpochState {
        self.state
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    /// Drop the session, keeping the results.
    pub fn into_record(self) -> NodeRecord {
        self.record
    }

    fn finish(&mut self, lines: Vec<String>, outcome: EpochOutcome) {
        let output = classify_lines(lines.iter().map(String::as_str));
        info!(
            node = %self.record.node_id,
            summaries = output.summaries.len(),
            telemetry = output.telemetry.len(),
            outcome = ?outcome,
            "Epoch finished"
        );
        self.state = match outcome {
            EpochOutcome::Completed | EpochOutcome::Stopped => EpochState::Completed,
            EpochOutcome::TimedOut => EpochState::TimedOut,
            EpochOutcome::Failed(_) => EpochState::Failed,
        };
        self.record.absorb(output);
        self.record.outcome = Some(outcome);
    }

    async fn start(&mut self, params: &PepperParams) -> Result<(), ChannelError> {
        self.state = EpochState::Starting;
        self.session.start(params).await?;
        self.state = EpochState::AwaitingCompletion;
        Ok(())
    }

    /// Read campaign output until the prompt returns, the deadline passes or
    /// the channel fails. A stop request sends `pepper stop` and shortens the
    /// deadline to the grace period.
    async fn await_completion(
        &mut self,
        mut deadline: Option<Instant>,
        stop_grace: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut lines = Vec::new();
        let mut stopping = false;
        let outcome = loop {
            let step = tokio::select! {
                _ = stop_requested(&mut stop), if !stopping => {
                    stopping = true;
                    info!(node = %self.record.node_id, "Stopping campaign");
                    if let Err(e) = self.session.stop().await {
                        break EpochOutcome::Failed(e.to_string());
                    }
                    let grace = Instant::now() + stop_grace;
                    deadline = Some(deadline.map_or(grace, |d| d.min(grace)));
                    continue;
                }
                step = self.session.next_step(deadline) => step,
            };
            match step {
                Ok(Step::Line(line)) => lines.push(line),
                Ok(Step::Prompt) if stopping => break EpochOutcome::Stopped,
                Ok(Step::Prompt) => break EpochOutcome::Completed,
                Ok(Step::Closed) => {
                    break EpochOutcome::Failed("control channel closed".to_string());
                }
                Ok(Step::Deadline) => {
                    warn!(node = %self.record.node_id, "Epoch deadline elapsed");
                    break EpochOutcome::TimedOut;
                }
                Err(e) => break EpochOutcome::Failed(e.to_string()),
            }
        };
        self.finish(lines, outcome);
    }
}

/// Resolves once `true` is published; never resolves if the sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs one campaign on a set of nodes.
#[derive(Debug, Clone)]
pub struct EpochCoordinator {
    params: PepperParams,
    slack: Duration,
    stop_grace: Duration,
}

impl EpochCoordinator {
    pub fn new(params: PepperParams, slack: Duration, stop_grace: Duration) -> Self {
        Self {
            params,
            slack,
            stop_grace,
        }
    }

    pub fn params(&self) -> &PepperParams {
        &self.params
    }

    pub fn timeout(&self) -> Option<Duration> {
        epoch_timeout(&self.params, self.slack)
    }

    /// Run the campaign on every node until each one resolves.
    pub async fn run_all(&self, nodes: &mut [Node]) -> Result<(), NodeError> {
        let (_stop_tx, stop_rx) = watch::channel(false);
        self.run_all_until(nodes, stop_rx).await
    }

    /// Like [`Self::run_all`], stopping still-running nodes once `stop` is set.
    pub async fn run_all_until(
        &self,
        nodes: &mut [Node],
        stop: watch::Receiver<bool>,
    ) -> Result<(), NodeError> {
        if let Some(busy) = nodes.iter().find(|n| n.state.in_flight()) {
            return Err(NodeError::NotIdle {
                node_id: busy.node_id().to_string(),
                action: "start an epoch",
            });
        }

        let timeout = self.timeout();
        info!(
            nodes = nodes.len(),
            args = %self.params.start_args(),
            timeout = ?timeout,
            "Starting PEPPER on all nodes"
        );

        let mut deadlines = Vec::with_capacity(nodes.len());
        for node in nodes.iter_mut() {
            match node.start(&self.params).await {
                Ok(()) => deadlines.push(timeout.map(|t| Instant::now() + t)),
                Err(e) => {
                    warn!(node = %node.node_id(), error = %e, "Failed to start campaign");
                    node.finish(Vec::new(), EpochOutcome::Failed(e.to_string()));
                    deadlines.push(None);
                }
            }
        }

        let pending = nodes
            .iter_mut()
            .zip(deadlines)
            .filter(|(node, _)| node.state == EpochState::AwaitingCompletion)
            .map(|(node, deadline)| node.await_completion(deadline, self.stop_grace, stop.clone()));
        join_all(pending).await;
        Ok(())
    }
}
