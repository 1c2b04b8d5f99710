//! In-memory stand-ins for devices and environment backends.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pepper_experiment::channel::ControlChannel;
use pepper_experiment::device::FirmwareTool;
use pepper_experiment::environment::{
    BOARD, BOARD_INDEX, Environment, EnvironmentFactory, ReservationSpec,
};
use pepper_experiment::error::{ChannelError, DeviceError, EnvironmentError};

/// Canned replies keyed by command prefix.
pub type Script = Vec<(&'static str, Vec<String>)>;

/// Shell that answers commands from a script and stays silent otherwise.
pub struct FakeShell {
    script: Script,
    queued: VecDeque<String>,
    closed: bool,
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<Mutex<usize>>,
}

impl FakeShell {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            queued: VecDeque::new(),
            closed: false,
            sent: Arc::default(),
            closes: Arc::default(),
        }
    }

    pub fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl ControlChannel for FakeShell {
    async fn send_line(&mut self, line: &str) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().unwrap().push(line.to_string());
        if let Some((_, reply)) = self.script.iter().find(|(prefix, _)| line.starts_with(prefix)) {
            self.queued.extend(reply.iter().cloned());
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>, ChannelError> {
        if self.closed {
            return Ok(None);
        }
        match self.queued.pop_front() {
            Some(line) => Ok(Some(line)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if !self.closed {
            self.closed = true;
            *self.closes.lock().unwrap() += 1;
        }
        Ok(())
    }
}

pub fn lines(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|l| l.to_string()).collect()
}

/// Script of a well-behaved PEPPER node.
pub fn pepper_script(uid: &str, campaign: &[&str]) -> Script {
    let mut campaign = lines(campaign);
    campaign.push(">".to_string());
    vec![
        ("pepper get uid", vec![format!("[pepper]: uid {uid} "), ">".to_string()]),
        ("time", lines(&[">"])),
        ("pepper start", campaign),
        ("pepper stop", lines(&[">"])),
    ]
}

/// Firmware tool handing out fake shells by node id.
#[derive(Default)]
pub struct FakeTool {
    scripts: Mutex<HashMap<String, Script>>,
    pub targets: Mutex<Vec<(String, String)>>,
    pub sent: Mutex<HashMap<String, Arc<Mutex<Vec<String>>>>>,
    pub closes: Arc<Mutex<usize>>,
}

impl FakeTool {
    pub fn with_script(self, node_id: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(node_id.to_string(), script);
        self
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

#[async_trait]
impl FirmwareTool for FakeTool {
    async fn run_target(
        &self,
        node_id: &str,
        _env: &BTreeMap<String, String>,
        target: &str,
    ) -> Result<(), DeviceError> {
        self.targets
            .lock()
            .unwrap()
            .push((node_id.to_string(), target.to_string()));
        Ok(())
    }

    async fn open_terminal(
        &self,
        node_id: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn ControlChannel>, DeviceError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .unwrap_or_default();
        let mut shell = FakeShell::new(script);
        shell.closes = self.closes.clone();
        self.sent
            .lock()
            .unwrap()
            .insert(node_id.to_string(), shell.sent());
        Ok(Box::new(shell))
    }
}

/// Environment factory returning a fixed list.
pub struct FakeFactory {
    envs: Vec<Environment>,
    pub releases: Arc<Mutex<usize>>,
}

impl FakeFactory {
    pub fn new(envs: Vec<Environment>) -> Self {
        Self {
            envs,
            releases: Arc::default(),
        }
    }

    pub fn releases(&self) -> usize {
        *self.releases.lock().unwrap()
    }
}

#[async_trait]
impl EnvironmentFactory for FakeFactory {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn reserve(
        &mut self,
        _spec: &ReservationSpec,
    ) -> Result<Vec<Environment>, EnvironmentError> {
        Ok(self.envs.clone())
    }

    async fn release(&mut self) -> Result<(), EnvironmentError> {
        *self.releases.lock().unwrap() += 1;
        Ok(())
    }
}

/// A locally attached dwm1001 selected by index.
pub fn board_env(index: u32) -> Environment {
    Environment::default()
        .with_var(BOARD, "dwm1001")
        .with_var(BOARD_INDEX, index.to_string())
}

pub fn file_spec() -> ReservationSpec {
    ReservationSpec::File {
        path: ".boards.yaml".into(),
    }
}

pub const UWB_LINE: &str =
    r#"[{"bn":"pepper:uwb:8fd6","bt":84060,"n":"d_cm","v":218,"u":"cm"},{"n":"los","v":100,"u":"%"}]"#;
pub const BLE_LINE: &str = r#"{"bn":"DW0001:pepper:ble:2ede8fd6","bt":83782,"n":"rssi","v":-52,"u":"dBm"}"#;
pub const EPOCH_LINE: &str = r#"{"tag":"DW0001:door","epoch":1367,"pets":[{"pet":{"etl":"aa01","rtl":"bb02","uwb":{"exposure":12,"req_count":30,"avg_d_cm":150.5},"ble":{"exposure":40}}}]}"#;
