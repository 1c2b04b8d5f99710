//! IoT-LAB testbed: reservation-backed environments.
//!
//! Requested devices are RIOT board names (`dwm1001`) or explicit node
//! addresses (`dwm1001-5.saclay.iot-lab.info`). The factory submits one
//! reservation for all of them, waits for it to run, then maps every assigned
//! node back to the environment that asked for it.
//!
//! The REST calls sit behind [`TestbedApi`] so the mapping logic can be
//! exercised without the testbed.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use pepper_data::Position;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TestbedConfig;
use crate::environment::{
    BOARD, Environment, EnvironmentFactory, IOTLAB_EXP_ID, IOTLAB_NODE, ReservationSpec,
};
use crate::error::{EnvironmentError, TestbedError};

pub const SITES: &[&str] = &["grenoble", "lille", "saclay"];

/// RIOT `BOARD` → (IoT-LAB node name, radio).
const BOARD_ARCHI_MAP: &[(&str, &str, &str)] = &[
    ("arduino-zero", "arduino-zero", "xbee"),
    ("b-l072z-lrwan1", "st-lrwan1", "sx1276"),
    ("b-l475e-iot01a", "st-iotnode", "multi"),
    ("dwm1001", "dwm1001", "dw1000"),
    ("firefly", "firefly", "multi"),
    ("frdm-kw41z", "frdm-kw41z", "multi"),
    ("iotlab-a8-m3", "a8", "at86rf231"),
    ("iotlab-m3", "m3", "at86rf231"),
    ("microbit", "microbit", "ble"),
    ("nrf51dk", "nrf51dk", "ble"),
    ("nrf52dk", "nrf52dk", "ble"),
    ("nrf52832-mdk", "nrf52832mdk", "ble"),
    ("nrf52840dk", "nrf52840dk", "multi"),
    ("nrf52840-mdk", "nrf52840mdk", "multi"),
    ("pba-d-01-kw2x", "phynode", "kw2xrf"),
    ("samr21-xpro", "samr21", "at86rf233"),
    ("samr30-xpro", "samr30", "at86rf212b"),
];

static NODE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-zA-Z\-]+)-\d+\.[a-z]+\.iot-lab\.info").expect("valid node regex")
});

fn archi_entry(board: &str) -> Option<&'static (&'static str, &'static str, &'static str)> {
    BOARD_ARCHI_MAP.iter().find(|(b, _, _)| *b == board)
}

/// Whether `board` can be booked on IoT-LAB.
pub fn valid_board(board: &str) -> bool {
    archi_entry(board).is_some()
}

/// IoT-LAB `archi` string for a board, e.g. `dwm1001:dw1000`.
pub fn archi_from_board(board: &str) -> Option<String> {
    archi_entry(board).map(|(_, name, radio)| format!("{name}:{radio}"))
}

/// Board matching a node address: `m3-102.lille.iot-lab.info` => `iotlab-m3`.
pub fn board_from_iotlab_node(address: &str) -> Result<&'static str, TestbedError> {
    let name = NODE_ADDRESS
        .captures(address)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| TestbedError::InvalidNodeAddress(address.to_string()))?;
    BOARD_ARCHI_MAP
        .iter()
        .find(|(_, node_name, _)| *node_name == name)
        .map(|(board, _, _)| *board)
        .ok_or_else(|| TestbedError::InvalidNodeAddress(address.to_string()))
}

/// Whether an assigned address belongs to a board (prefix convention).
fn address_matches_board(board: &str, address: &str) -> bool {
    archi_entry(board).is_some_and(|(_, name, _)| address.starts_with(name))
}

fn check_site(site: &str) -> Result<(), TestbedError> {
    if SITES.contains(&site) {
        Ok(())
    } else {
        Err(TestbedError::UnknownSite {
            site: site.to_string(),
            expected: SITES,
        })
    }
}

fn check_node(address: &str, site: &str, board: Option<&str>) -> Result<(), TestbedError> {
    if !address.contains(site) {
        return Err(TestbedError::SiteMismatch {
            node: address.to_string(),
            site: site.to_string(),
        });
    }
    if let Some(board) = board
        && board_from_iotlab_node(address)? != board
    {
        return Err(TestbedError::BoardMismatch {
            node: address.to_string(),
            board: board.to_string(),
        });
    }
    Ok(())
}

/// Turn requested boards/addresses into validated environments.
///
/// Address-only requests get their `BOARD` derived from the address.
pub fn request_envs(boards: &[String], site: &str) -> Result<Vec<Environment>, TestbedError> {
    check_site(site)?;
    boards
        .iter()
        .map(|requested| {
            if valid_board(requested) {
                Ok(Environment::default().with_var(BOARD, requested.as_str()))
            } else {
                check_node(requested, site, None)?;
                let board = board_from_iotlab_node(requested)?;
                Ok(Environment::default()
                    .with_var(IOTLAB_NODE, requested.as_str())
                    .with_var(BOARD, board))
            }
        })
        .collect()
}

/// One requested resource of a reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// Any node of the given archi on a site
    Alias { archi: String, site: String },
    /// A specific node
    Physical(String),
}

impl Resource {
    fn for_env(env: &Environment, site: &str) -> Result<Self, TestbedError> {
        if let Some(address) = env.get(IOTLAB_NODE) {
            return Ok(Self::Physical(address.to_string()));
        }
        let board = env.board().unwrap_or_default();
        archi_from_board(board)
            .map(|archi| Self::Alias {
                archi,
                site: site.to_string(),
            })
            .ok_or_else(|| TestbedError::UnsupportedBoard(board.to_string()))
    }
}

/// Assigned node and its coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePosition {
    pub network_address: String,
    pub position: Position,
}

/// The subset of the IoT-LAB REST API used by the orchestrator.
#[async_trait]
pub trait TestbedApi: Send + Sync {
    /// Submit a reservation, returning its id.
    async fn submit(
        &self,
        name: &str,
        duration_min: u32,
        resources: &[Resource],
    ) -> Result<u64, TestbedError>;

    /// Current reservation state (`Waiting`, `Running`, ...).
    async fn state(&self, exp_id: u64) -> Result<String, TestbedError>;

    /// Network addresses assigned to the reservation.
    async fn nodes(&self, exp_id: u64) -> Result<Vec<String>, TestbedError>;

    /// Positions of the assigned nodes.
    async fn positions(&self, exp_id: u64) -> Result<Vec<NodePosition>, TestbedError>;

    async fn stop(&self, exp_id: u64) -> Result<(), TestbedError>;
}

/// reqwest-backed IoT-LAB REST client.
#[derive(Clone)]
pub struct RestTestbedApi {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: u64,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    nodes: Vec<String>,
}

#[derive(Deserialize)]
struct NodesResponse {
    items: Vec<NodeItem>,
}

#[derive(Deserialize)]
struct NodeItem {
    network_address: String,
    #[serde(default)]
    x: Value,
    #[serde(default)]
    y: Value,
    #[serde(default)]
    z: Value,
}

/// The testbed reports coordinates as numbers or numeric strings.
fn coordinate(value: &Value) -> Option<f64> {
    let coordinate = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    coordinate.is_finite().then_some(coordinate)
}

impl NodeItem {
    fn position(&self) -> Option<Position> {
        Some([
            coordinate(&self.x)?,
            coordinate(&self.y)?,
            coordinate(&self.z)?,
        ])
    }
}

impl RestTestbedApi {
    /// Create a client, taking credentials from the config or from
    /// `IOTLAB_USER` / `IOTLAB_PASSWORD`.
    pub fn from_config(config: &TestbedConfig) -> Result<Self, TestbedError> {
        let user = config
            .user
            .clone()
            .or_else(|| std::env::var("IOTLAB_USER").ok());
        let password = config
            .password
            .clone()
            .or_else(|| std::env::var("IOTLAB_PASSWORD").ok());
        let (Some(user), Some(password)) = (user, password) else {
            return Err(TestbedError::MissingCredentials);
        };
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            user,
            password,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, TestbedError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TestbedError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, TestbedError> {
        let response = self
            .client
            .get(self.url(path))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Ok(Self::checked(response).await?.json().await?)
    }
}

#[async_trait]
impl TestbedApi for RestTestbedApi {
    async fn submit(
        &self,
        name: &str,
        duration_min: u32,
        resources: &[Resource],
    ) -> Result<u64, TestbedError> {
        let nodes: Vec<Value> = resources
            .iter()
            .enumerate()
            .map(|(idx, resource)| match resource {
                Resource::Alias { archi, site } => json!({
                    "alias": (idx + 1).to_string(),
                    "nbnodes": 1,
                    "properties": { "archi": archi, "site": site, "mobile": false },
                }),
                Resource::Physical(address) => json!(address),
            })
            .collect();
        let experiment = json!({
            "name": name,
            "duration": duration_min,
            "nodes": nodes,
        });

        let part = reqwest::multipart::Part::text(experiment.to_string())
            .file_name("new_exp.json")
            .mime_str("application/json")?;
        let form = reqwest::multipart::Form::new().part("new_exp.json", part);

        let response = self
            .client
            .post(self.url("experiments"))
            .basic_auth(&self.user, Some(&self.password))
            .multipart(form)
            .send()
            .await?;
        let submitted: SubmitResponse = Self::checked(response).await?.json().await?;
        Ok(submitted.id)
    }

    async fn state(&self, exp_id: u64) -> Result<String, TestbedError> {
        let info: ExperimentInfo = self.get_json(&format!("experiments/{exp_id}")).await?;
        Ok(info.state.unwrap_or_default())
    }

    async fn nodes(&self, exp_id: u64) -> Result<Vec<String>, TestbedError> {
        let info: ExperimentInfo = self.get_json(&format!("experiments/{exp_id}")).await?;
        Ok(info.nodes)
    }

    async fn positions(&self, exp_id: u64) -> Result<Vec<NodePosition>, TestbedError> {
        let nodes: NodesResponse = self.get_json(&format!("experiments/{exp_id}/nodes")).await?;
        Ok(nodes
            .items
            .into_iter()
            .filter_map(|item| match item.position() {
                Some(position) => Some(NodePosition {
                    position,
                    network_address: item.network_address,
                }),
                None => {
                    warn!(node = %item.network_address, "Invalid coordinates, node has no position");
                    None
                }
            })
            .collect())
    }

    async fn stop(&self, exp_id: u64) -> Result<(), TestbedError> {
        let response = self
            .client
            .delete(self.url(&format!("experiments/{exp_id}")))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }
}

/// Environments backed by an IoT-LAB reservation.
pub struct IotLabEnvFactory {
    api: Box<dyn TestbedApi>,
    exp_id: Option<u64>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl IotLabEnvFactory {
    pub fn new(api: Box<dyn TestbedApi>, config: &TestbedConfig) -> Self {
        Self {
            api,
            exp_id: None,
            poll_interval: config.poll_interval(),
            wait_timeout: config.wait_timeout(),
        }
    }

    /// Id of the reservation currently held, if any.
    pub fn exp_id(&self) -> Option<u64> {
        self.exp_id
    }

    /// Block until the reservation is running.
    async fn wait_running(&self, exp_id: u64) -> Result<(), TestbedError> {
        let started = Instant::now();
        loop {
            let state = self.api.state(exp_id).await?;
            match state.as_str() {
                "Running" => return Ok(()),
                "Waiting" | "toLaunch" | "Launching" => {
                    debug!(exp_id, state = %state, "Waiting for experiment");
                }
                _ => return Err(TestbedError::UnexpectedState { exp_id, state }),
            }
            if started.elapsed() >= self.wait_timeout {
                return Err(TestbedError::WaitTimeout {
                    exp_id,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Assign every board-only environment the first unused address of its kind.
fn map_nodes_to_envs(envs: Vec<Environment>, mut nodes: Vec<String>, exp_id: u64) -> Vec<Environment> {
    envs.into_iter()
        .map(|env| {
            let requested = env.get(IOTLAB_NODE).map(str::to_string);
            let env = match requested {
                Some(address) => {
                    nodes.retain(|node| *node != address);
                    env
                }
                None => {
                    let board = env.board().unwrap_or_default().to_string();
                    match nodes.iter().position(|node| address_matches_board(&board, node)) {
                        Some(idx) => {
                            let address = nodes.remove(idx);
                            env.with_var(IOTLAB_NODE, address)
                        }
                        None => {
                            warn!(board = %board, "No reserved node left for board");
                            env
                        }
                    }
                }
            };
            env.with_var(IOTLAB_EXP_ID, exp_id.to_string())
        })
        .collect()
}

/// Attach positions, keeping only environments whose node reported one.
fn map_positions(envs: Vec<Environment>, mut positions: Vec<NodePosition>) -> Vec<Environment> {
    positions.sort_by(|a, b| a.network_address.cmp(&b.network_address));
    let by_address: BTreeMap<&str, Position> = positions
        .iter()
        .map(|p| (p.network_address.as_str(), p.position))
        .collect();
    envs.into_iter()
        .filter_map(|env| {
            let position = env.get(IOTLAB_NODE).and_then(|a| by_address.get(a)).copied();
            match position {
                Some(position) => Some(env.with_position(Some(position))),
                None => {
                    warn!(env = %env, "Dropping environment without an assigned position");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl EnvironmentFactory for IotLabEnvFactory {
    fn name(&self) -> &'static str {
        "iotlab"
    }

    async fn reserve(
        &mut self,
        spec: &ReservationSpec,
    ) -> Result<Vec<Environment>, EnvironmentError> {
        let ReservationSpec::Testbed {
            boards,
            name,
            site,
            duration_min,
        } = spec
        else {
            return Err(EnvironmentError::UnsupportedSpec(self.name()));
        };

        let envs = request_envs(boards, site)?;
        let resources = envs
            .iter()
            .map(|env| Resource::for_env(env, site))
            .collect::<Result<Vec<_>, _>>()?;

        info!(name = %name, site = %site, devices = resources.len(), "Submitting experiment");
        let exp_id = self.api.submit(name, *duration_min, &resources).await?;
        self.exp_id = Some(exp_id);

        info!(exp_id, "Waiting for experiment to go to state \"Running\"");
        self.wait_running(exp_id).await?;

        let nodes = self.api.nodes(exp_id).await?;
        let envs = map_nodes_to_envs(envs, nodes, exp_id);
        let positions = self.api.positions(exp_id).await?;
        Ok(map_positions(envs, positions))
    }

    async fn release(&mut self) -> Result<(), EnvironmentError> {
        if let Some(exp_id) = self.exp_id.take() {
            info!(exp_id, "Stopping experiment");
            self.api.stop(exp_id).await?;
        }
        Ok(())
    }
}
