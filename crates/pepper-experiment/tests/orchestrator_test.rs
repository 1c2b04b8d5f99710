//! End-to-end runs of the orchestrator against fake devices.
//!
//! Covers:
//! - too few environments returns an empty snapshot
//! - a full run collects uid, epoch summaries and telemetry per node and
//!   saves them to the data file
//! - a node that never finishes times out without blocking the others
//! - an unclassifiable environment aborts the run but still tears down
//! - a stop request ends an unbounded campaign

mod common;

use std::sync::Arc;
use std::time::Duration;

use pepper_data::EpochOutcome;
use pepper_experiment::environment::{BOARD, Environment};
use pepper_experiment::error::{DeviceError, OrchestratorError};
use pepper_experiment::{ExperimentConfig, Orchestrator, PepperParams};
use tokio::sync::watch;

use common::*;

fn config(log_dir: &std::path::Path, params: PepperParams) -> ExperimentConfig {
    ExperimentConfig {
        log_dir: log_dir.to_path_buf(),
        settle_delay_ms: 0,
        command_timeout_ms: 200,
        timeout_slack_s: 0.3,
        stop_grace_s: 1,
        params,
        ..Default::default()
    }
}

fn bounded() -> PepperParams {
    PepperParams {
        iterations: 1,
        duration: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_shortfall_returns_empty_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let tool = Arc::new(FakeTool::default());
    let orchestrator = Orchestrator::new(config(dir.path(), bounded()), tool.clone());
    let mut factory = FakeFactory::new(vec![board_env(1)]);
    let (_tx, rx) = watch::channel(false);

    let snapshot = orchestrator
        .run_with(&mut factory, &file_spec(), rx)
        .await
        .unwrap();

    assert!(snapshot.is_empty());
    assert!(!orchestrator.store().path().exists());
    assert!(tool.targets.lock().unwrap().is_empty());
    assert_eq!(factory.releases(), 1);
}

#[tokio::test]
async fn test_full_run_collects_node_data() {
    let dir = tempfile::tempdir().unwrap();
    let tool = Arc::new(
        FakeTool::default()
            .with_script("dwm1001_1", pepper_script("DW0001", &[BLE_LINE, "noise", EPOCH_LINE]))
            .with_script("dwm1001_2", pepper_script("DW0002", &[UWB_LINE])),
    );
    let orchestrator = Orchestrator::new(config(dir.path(), bounded()), tool.clone());
    let mut factory = FakeFactory::new(vec![
        board_env(1).with_position(Some([1.0, 2.0, 0.0])),
        board_env(2),
    ]);
    let (_tx, rx) = watch::channel(false);

    let snapshot = orchestrator
        .run_with(&mut factory, &file_spec(), rx)
        .await
        .unwrap();

    assert_eq!(snapshot.nodes.len(), 2);
    let first = snapshot.node("dwm1001_1").unwrap();
    assert_eq!(first.uid.as_deref(), Some("DW0001"));
    assert_eq!(first.position, Some([1.0, 2.0, 0.0]));
    assert_eq!(first.outcome, Some(EpochOutcome::Completed));
    assert_eq!(first.epoch_data.len(), 1);
    assert_eq!(first.epoch_data[0].epoch, 1367);
    assert_eq!(first.ble().count(), 1);

    let second = snapshot.node("dwm1001_2").unwrap();
    assert_eq!(second.uid.as_deref(), Some("DW0002"));
    assert!(second.epoch_data.is_empty());
    assert_eq!(second.uwb().next().and_then(|s| s.d_cm()), Some(218.0));

    let saved = orchestrator.store().load().unwrap();
    assert_eq!(saved, vec![snapshot.clone()]);
    assert_eq!(orchestrator.store().path(), dir.path().join("exp_data.log"));

    // flash, reset, term per node, in provisioning order
    let targets = tool.targets.lock().unwrap().clone();
    assert_eq!(
        targets,
        vec![
            ("dwm1001_1".to_string(), "flash".to_string()),
            ("dwm1001_1".to_string(), "reset".to_string()),
            ("dwm1001_2".to_string(), "flash".to_string()),
            ("dwm1001_2".to_string(), "reset".to_string()),
        ]
    );
    let sent = tool.sent.lock().unwrap()["dwm1001_1"].lock().unwrap().clone();
    assert_eq!(sent[0], "pepper get uid");
    assert!(sent[1].starts_with("time "));
    assert_eq!(sent[2], "pepper start -d 0 -i 1000 -r 20 -c 1 -s 1024,4096");

    assert_eq!(tool.closes(), 2);
    assert_eq!(orchestrator.devices().open_channels(), 0);
    assert_eq!(factory.releases(), 1);
}

#[tokio::test]
async fn test_timeout_does_not_block_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let mut stuck = pepper_script("DW0002", &[]);
    // campaign output without the closing prompt
    stuck[2].1 = lines(&[EPOCH_LINE]);
    let tool = Arc::new(
        FakeTool::default()
            .with_script("dwm1001_1", pepper_script("DW0001", &[EPOCH_LINE]))
            .with_script("dwm1001_2", stuck),
    );
    let orchestrator = Orchestrator::new(config(dir.path(), bounded()), tool.clone());
    let mut factory = FakeFactory::new(vec![board_env(1), board_env(2)]);
    let (_tx, rx) = watch::channel(false);

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run_with(&mut factory, &file_spec(), rx),
    )
    .await
    .expect("run must finish once the deadline passes")
    .unwrap();

    let done = snapshot.node("dwm1001_1").unwrap();
    assert_eq!(done.outcome, Some(EpochOutcome::Completed));
    let stuck = snapshot.node("dwm1001_2").unwrap();
    assert_eq!(stuck.outcome, Some(EpochOutcome::TimedOut));
    // output received before the deadline is kept
    assert_eq!(stuck.epoch_data.len(), 1);
    assert_eq!(tool.closes(), 2);
}

#[tokio::test]
async fn test_classification_failure_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let tool = Arc::new(FakeTool::default().with_script("dwm1001_1", pepper_script("DW0001", &[])));
    let orchestrator = Orchestrator::new(config(dir.path(), bounded()), tool.clone());
    let unaddressed = Environment::default().with_var(BOARD, "dwm1001");
    let mut factory = FakeFactory::new(vec![board_env(1), unaddressed]);
    let (_tx, rx) = watch::channel(false);

    let err = orchestrator
        .run_with(&mut factory, &file_spec(), rx)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Device(DeviceError::NodeClassification(_))
    ));
    // the node provisioned before the failure is closed, the lease released
    assert_eq!(tool.closes(), 1);
    assert_eq!(factory.releases(), 1);
}

#[tokio::test]
async fn test_stop_ends_unbounded_campaign() {
    let dir = tempfile::tempdir().unwrap();
    let script = |uid: &'static str| {
        let mut script = pepper_script(uid, &[]);
        // running until stopped: output but no prompt
        script[2].1 = lines(&[UWB_LINE]);
        script[3].1 = lines(&[EPOCH_LINE, ">"]);
        script
    };
    let tool = Arc::new(
        FakeTool::default()
            .with_script("dwm1001_1", script("DW0001"))
            .with_script("dwm1001_2", script("DW0002")),
    );
    let unbounded = PepperParams {
        iterations: 0,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config(dir.path(), unbounded), tool.clone());
    let mut factory = FakeFactory::new(vec![board_env(1), board_env(2)]);
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        // keep the sender alive until the run has observed it
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run_with(&mut factory, &file_spec(), rx),
    )
    .await
    .expect("stop must end the campaign")
    .unwrap();

    for node in &snapshot.nodes {
        assert_eq!(node.outcome, Some(EpochOutcome::Stopped));
        assert_eq!(node.uwb().count(), 1);
        assert_eq!(node.epoch_data.len(), 1);
    }
    let sent = tool.sent.lock().unwrap()["dwm1001_1"].lock().unwrap().clone();
    assert_eq!(sent.last().map(String::as_str), Some("pepper stop"));
}
