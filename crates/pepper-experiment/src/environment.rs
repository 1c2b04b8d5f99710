//! Execution environments and the factories that produce them.
//!
//! An [`Environment`] is the set of build/flash variables that address one
//! device (`BOARD`, `IOTLAB_NODE`, `DEBUG_ADAPTER_ID`, ...) plus its optional
//! physical position. Environments come from an [`EnvironmentFactory`]:
//! either a testbed reservation ([`crate::iotlab::IotLabEnvFactory`]) or a
//! static boards file ([`FileEnvFactory`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pepper_data::Position;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::TestbedConfig;
use crate::error::{DeviceError, EnvironmentError};
use crate::iotlab::{IotLabEnvFactory, RestTestbedApi};

pub const BOARD: &str = "BOARD";
pub const BOARD_INDEX: &str = "BOARD_INDEX";
pub const IOTLAB_NODE: &str = "IOTLAB_NODE";
pub const IOTLAB_EXP_ID: &str = "IOTLAB_EXP_ID";
pub const DEBUG_ADAPTER_ID: &str = "DEBUG_ADAPTER_ID";
pub const TERMLOG: &str = "TERMLOG";

/// How a device is addressed, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing<'a> {
    /// Testbed network address, e.g. `dwm1001-1.lille.iot-lab.info`
    NetworkAddress(&'a str),
    /// Locally attached board selected by index
    BoardIndex { board: Option<&'a str>, index: &'a str },
    /// Locally attached board selected by debug adapter serial
    DebugAdapter { board: Option<&'a str>, id: &'a str },
}

impl Addressing<'_> {
    /// Identifier used for log files and node records.
    pub fn node_id(&self) -> String {
        match self {
            Self::NetworkAddress(address) => address.to_string(),
            Self::BoardIndex { board, index: id } | Self::DebugAdapter { board, id } => {
                match board {
                    Some(board) => format!("{board}_{id}"),
                    None => id.to_string(),
                }
            }
        }
    }
}

/// One device's environment variables and position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
    position: Option<Position>,
}

impl Environment {
    pub fn new(vars: BTreeMap<String, String>, position: Option<Position>) -> Self {
        Self { vars, position }
    }

    /// Return a copy with `key` set to `value`.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_position(mut self, position: Option<Position>) -> Self {
        self.position = position;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn into_vars(self) -> BTreeMap<String, String> {
        self.vars
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn board(&self) -> Option<&str> {
        self.get(BOARD)
    }

    /// Addressing scheme by precedence: network address > board index > debug adapter.
    pub fn addressing(&self) -> Option<Addressing<'_>> {
        if let Some(address) = self.get(IOTLAB_NODE) {
            return Some(Addressing::NetworkAddress(address));
        }
        if let Some(index) = self.get(BOARD_INDEX) {
            return Some(Addressing::BoardIndex {
                board: self.board(),
                index,
            });
        }
        self.get(DEBUG_ADAPTER_ID).map(|id| Addressing::DebugAdapter {
            board: self.board(),
            id,
        })
    }

    /// Derive the node identifier, failing if no addressing scheme is present.
    pub fn node_id(&self) -> Result<String, DeviceError> {
        self.addressing()
            .map(|addressing| addressing.node_id())
            .ok_or_else(|| DeviceError::NodeClassification(self.clone()))
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.vars.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

/// What to reserve, and therefore which factory serves it.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationSpec {
    /// Book devices on the testbed: each entry is a board name or a node address.
    Testbed {
        boards: Vec<String>,
        name: String,
        site: String,
        duration_min: u32,
    },
    /// Read environments from a static boards file.
    File { path: PathBuf },
}

impl ReservationSpec {
    /// Build the factory serving this spec.
    pub fn factory(
        &self,
        testbed: &TestbedConfig,
    ) -> Result<Box<dyn EnvironmentFactory>, EnvironmentError> {
        match self {
            Self::Testbed { .. } => {
                let api = RestTestbedApi::from_config(testbed)?;
                Ok(Box::new(IotLabEnvFactory::new(Box::new(api), testbed)))
            }
            Self::File { .. } => Ok(Box::new(FileEnvFactory)),
        }
    }

    /// Number of devices requested, when known upfront.
    pub fn requested(&self) -> Option<usize> {
        match self {
            Self::Testbed { boards, .. } => Some(boards.len()),
            Self::File { .. } => None,
        }
    }
}

/// Produces execution environments and owns whatever lease backs them.
///
/// `release` must be safe to call repeatedly and after a failed `reserve`.
#[async_trait]
pub trait EnvironmentFactory: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn reserve(&mut self, spec: &ReservationSpec)
    -> Result<Vec<Environment>, EnvironmentError>;

    async fn release(&mut self) -> Result<(), EnvironmentError>;
}

/// A scalar YAML value; boards files mix strings and numbers (`BOARD_INDEX: 3`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

/// One entry of a boards file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BoardEntry {
    WithPosition {
        env: BTreeMap<String, ScalarValue>,
        #[serde(default)]
        position: Option<Position>,
    },
    Bare(BTreeMap<String, ScalarValue>),
}

impl From<BoardEntry> for Environment {
    fn from(entry: BoardEntry) -> Self {
        let (vars, position) = match entry {
            BoardEntry::WithPosition { env, position } => (env, position),
            BoardEntry::Bare(env) => (env, None),
        };
        let vars = vars
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();
        Environment::new(vars, position)
    }
}

/// Parse the contents of a boards file (YAML or JSON).
pub fn parse_boards(text: &str, path: &Path) -> Result<Vec<Environment>, EnvironmentError> {
    let entries: Option<Vec<BoardEntry>> =
        serde_yaml::from_str(text).map_err(|source| EnvironmentError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(entries
        .unwrap_or_default()
        .into_iter()
        .map(Environment::from)
        .collect())
}

/// Environments declared in a static boards file. Nothing to reserve or release.
#[derive(Debug, Default)]
pub struct FileEnvFactory;

#[async_trait]
impl EnvironmentFactory for FileEnvFactory {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn reserve(
        &mut self,
        spec: &ReservationSpec,
    ) -> Result<Vec<Environment>, EnvironmentError> {
        let ReservationSpec::File { path } = spec else {
            return Err(EnvironmentError::UnsupportedSpec(self.name()));
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| EnvironmentError::Read {
                path: path.clone(),
                source,
            })?;
        let envs = parse_boards(&text, path)?;
        info!(path = %path.display(), count = envs.len(), "Loaded boards file");
        Ok(envs)
    }

    async fn release(&mut self) -> Result<(), EnvironmentError> {
        debug!("File environments hold no lease");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        Environment::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            None,
        )
    }

    #[test]
    fn test_node_id_prefers_network_address() {
        let e = env(&[
            (BOARD, "dwm1001"),
            (BOARD_INDEX, "3"),
            (IOTLAB_NODE, "dwm1001-1.lille.iot-lab.info"),
        ]);
        assert_eq!(e.node_id().unwrap(), "dwm1001-1.lille.iot-lab.info");
    }

    #[test]
    fn test_node_id_board_index() {
        let e = env(&[(BOARD, "dwm1001"), (BOARD_INDEX, "3")]);
        assert_eq!(e.node_id().unwrap(), "dwm1001_3");
    }

    #[test]
    fn test_node_id_debug_adapter() {
        let e = env(&[(BOARD, "dwm1001"), (DEBUG_ADAPTER_ID, "000760001234")]);
        assert_eq!(e.node_id().unwrap(), "dwm1001_000760001234");
    }

    #[test]
    fn test_node_id_requires_addressing() {
        let e = env(&[(BOARD, "dwm1001")]);
        assert!(matches!(
            e.node_id(),
            Err(DeviceError::NodeClassification(_))
        ));
    }

    #[test]
    fn test_parse_boards_file() {
        let text = r#"
- BOARD: dwm1001
  BOARD_INDEX: 3
- env:
    BOARD: dwm1001
    DEBUG_ADAPTER_ID: "000760001234"
  position: [1.0, 2.5, 0.0]
- IOTLAB_NODE: dwm1001-2.lille.iot-lab.info
"#;
        let envs = parse_boards(text, Path::new("boards.yaml")).unwrap();

        assert_eq!(envs.len(), 3);
        assert_eq!(envs[0].get(BOARD_INDEX), Some("3"));
        assert_eq!(envs[0].position(), None);
        assert_eq!(envs[1].position(), Some([1.0, 2.5, 0.0]));
        assert_eq!(envs[1].node_id().unwrap(), "dwm1001_000760001234");
        assert_eq!(envs[2].node_id().unwrap(), "dwm1001-2.lille.iot-lab.info");
    }

    #[test]
    fn test_empty_boards_file() {
        assert!(parse_boards("[]", Path::new("b.yaml")).unwrap().is_empty());
        assert!(parse_boards("~", Path::new("b.yaml")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_factory_rejects_testbed_spec() {
        let mut factory = FileEnvFactory;
        let spec = ReservationSpec::Testbed {
            boards: vec!["dwm1001".into()],
            name: "x".into(),
            site: "lille".into(),
            duration_min: 10,
        };
        assert!(matches!(
            factory.reserve(&spec).await,
            Err(EnvironmentError::UnsupportedSpec("file"))
        ));
        factory.release().await.unwrap();
        factory.release().await.unwrap();
    }
}
