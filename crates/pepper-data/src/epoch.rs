//! End-of-epoch summaries.
//!
//! At the end of every epoch the firmware prints one JSON object listing the
//! encounters (PETs) it recorded, e.g.
//!
//! ```text
//! {"tag":"DWAFDE:door","epoch":1367,"pets":[{"pet":{"etl":"..","rtl":"..","uwb":{..},"ble":{..}}}]}
//! ```
//!
//! The statistics emitted vary between firmware versions, so everything but
//! the exposure count is optional and stays absent rather than defaulting to 0.

use serde::{Deserialize, Serialize};

/// UWB ranging statistics for one encounter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UwbStats {
    pub exposure: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_d_cm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_los: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_rssi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lst_scheduled: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lst_aborted: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lst_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_scheduled: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_aborted: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_timeout: Option<u32>,
}

/// BLE scan statistics for one encounter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BleStats {
    pub exposure: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_rssi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_d_cm: Option<f64>,
}

/// A Proximity Encounter Token pair and the radio statistics behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pet {
    /// Long-term token hash
    pub etl: String,
    /// Rolling token hash
    pub rtl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uwb: Option<UwbStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble: Option<BleStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetElement {
    pub pet: Pet,
}

/// Summary of one finished epoch on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Free-form label, `<node>:<scenario>` or just `<scenario>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub epoch: u64,
    pub pets: Vec<PetElement>,
}

impl EpochSummary {
    /// Parse one output line; `None` when it is not an epoch summary.
    pub fn from_json_str(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    /// Scenario part of the tag: `DWABCD:door` => `door`.
    pub fn annotation_tag(&self) -> Option<&str> {
        self.tag.as_deref().and_then(|tag| tag.rsplit(':').next())
    }

    /// Node part of the tag: `DWABCD:door` => `DWABCD`.
    pub fn node_id(&self) -> Option<&str> {
        self.tag
            .as_deref()
            .and_then(|tag| tag.split_once(':'))
            .map(|(node, _)| node)
    }
}
