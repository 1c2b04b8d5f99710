//! Persisted experiment results.
//!
//! A snapshot is the only artifact an experiment run leaves behind: one
//! record per node, stripped of anything tied to the live device session.
//! Snapshots are stored as newline-delimited JSON, one snapshot per line.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::ClassifiedOutput;
use crate::datum::{TelemetryKind, TelemetrySample};
use crate::epoch::EpochSummary;

/// Physical position of a device, `(x, y, z)` in meters.
pub type Position = [f64; 3];

/// How a node's epoch operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum EpochOutcome {
    /// The campaign ended and the shell prompt came back
    Completed,
    /// The node's deadline elapsed first
    TimedOut,
    /// The caller stopped an unbounded campaign
    Stopped,
    /// The control channel failed
    Failed(String),
}

/// Results of one node, without its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub epoch_data: Vec<EpochSummary>,
    #[serde(default)]
    pub telemetry: Vec<TelemetrySample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<EpochOutcome>,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>, position: Option<Position>) -> Self {
        Self {
            node_id: node_id.into(),
            position,
            uid: None,
            epoch_data: Vec::new(),
            telemetry: Vec::new(),
            outcome: None,
        }
    }

    /// Store classified output, appending to what is already there.
    pub fn absorb(&mut self, output: ClassifiedOutput) {
        self.epoch_data.extend(output.summaries);
        self.telemetry.extend(output.telemetry);
    }

    pub fn ble(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.telemetry.iter().filter(|s| s.kind == TelemetryKind::Ble)
    }

    pub fn uwb(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.telemetry.iter().filter(|s| s.kind == TelemetryKind::Uwb)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid snapshot on line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// All node results of one experiment run, in provisioning order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub nodes: Vec<NodeRecord>,
}

impl ExperimentSnapshot {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Serialize as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Render snapshots as newline-delimited JSON.
    pub fn to_ndjson(snapshots: &[ExperimentSnapshot]) -> Result<String, SnapshotError> {
        let mut out = String::new();
        for snapshot in snapshots {
            out.push_str(&snapshot.to_json_line()?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse newline-delimited JSON, ignoring blank lines.
    pub fn from_ndjson(text: &str) -> Result<Vec<ExperimentSnapshot>, SnapshotError> {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| SnapshotError::Decode {
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::datum::{Measurement, MeasurementKind};
    use crate::epoch::{BleStats, Pet, PetElement, UwbStats};

    fn sample_snapshot() -> ExperimentSnapshot {
        let mut a = NodeRecord::new("dwm1001-1.lille.iot-lab.info", Some([1.5, 2.0, 0.25]));
        a.uid = Some("DWAFDE".to_string());
        a.outcome = Some(EpochOutcome::Completed);
        a.absorb(classify(
            r#"[{"bn":"pepper:ble:2ede8fd6","bt":83782,"n":"rssi","v":-52,"u":"dBm"}]
[{"bn":"DWAFDE:pepper:uwb:8fd6","bt":84060,"n":"d_cm","v":218,"u":"cm"},{"n":"los","v":100,"u":"%"}]
{"tag":"DWAFDE:door","epoch":1367,"pets":[{"pet":{"etl":"AA","rtl":"BB","uwb":{"exposure":14,"req_count":7,"avg_d_cm":51},"ble":{"exposure":24,"scan_count":22,"avg_rssi":-44.89,"avg_d_cm":5}}}]}"#,
        ));

        let mut b = NodeRecord::new("dwm1001_3", None);
        b.outcome = Some(EpochOutcome::Failed("channel closed".to_string()));

        ExperimentSnapshot::new(vec![a, b])
    }

    #[test]
    fn test_ndjson_round_trip() {
        let snapshots = vec![sample_snapshot(), ExperimentSnapshot::default()];
        let text = ExperimentSnapshot::to_ndjson(&snapshots).unwrap();

        assert_eq!(text.lines().count(), 2);
        assert_eq!(ExperimentSnapshot::from_ndjson(&text).unwrap(), snapshots);
    }

    /// Finite doubles spread over the whole bit range plus short decimals
    /// like the ones the firmware prints.
    fn float_values(count: usize) -> Vec<f64> {
        let mut state = 0x9e37_79b9_7f4a_7c15_u64;
        let mut next = move || {
            // splitmix64
            state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^ (z >> 31)
        };
        let mut values = vec![-10.001230000000001, 0.24600513000025961, -0.0, f64::MIN_POSITIVE];
        while values.len() < count {
            let bits = next();
            let raw = f64::from_bits(bits);
            if raw.is_finite() {
                values.push(raw);
            }
            let scaled = (bits % 2_000_000) as f64 / 1e5 - 10.0 + (bits >> 40) as f64 * 1e-17;
            values.push(scaled);
        }
        values
    }

    #[test]
    fn test_ndjson_round_trip_preserves_floats() {
        let values = float_values(20_000);
        let mut nodes = Vec::new();
        for (idx, chunk) in values.chunks(4).enumerate() {
            let [x, y, z, v] = chunk else {
                continue;
            };
            let mut node = NodeRecord::new(format!("dwm1001_{idx}"), Some([*x, *y, *z]));
            node.telemetry.push(TelemetrySample {
                kind: TelemetryKind::Uwb,
                neighbor: "8fd6".to_string(),
                node_id: None,
                tag: "pepper".to_string(),
                time: idx as i64,
                measurements: vec![Measurement {
                    kind: MeasurementKind::DCm,
                    value: *v,
                    unit: "cm".to_string(),
                    time: idx as i64,
                }],
            });
            node.epoch_data.push(EpochSummary {
                tag: None,
                epoch: idx as u64,
                pets: vec![PetElement {
                    pet: Pet {
                        etl: "AA".to_string(),
                        rtl: "BB".to_string(),
                        uwb: Some(UwbStats {
                            exposure: 1,
                            avg_d_cm: Some(*x),
                            avg_los: Some(*y),
                            avg_rssi: Some(*z),
                            ..Default::default()
                        }),
                        ble: Some(BleStats {
                            exposure: 1,
                            avg_rssi: Some(*v),
                            ..Default::default()
                        }),
                    },
                }],
            });
            nodes.push(node);
        }

        // one snapshot per node keeps mismatches easy to locate
        let snapshots: Vec<_> = nodes
            .into_iter()
            .map(|node| ExperimentSnapshot::new(vec![node]))
            .collect();
        let text = ExperimentSnapshot::to_ndjson(&snapshots).unwrap();
        let loaded = ExperimentSnapshot::from_ndjson(&text).unwrap();

        assert_eq!(loaded.len(), snapshots.len());
        for (got, want) in loaded.iter().zip(&snapshots) {
            assert_eq!(got, want);
        }
    }

    #[test]
    fn test_record_splits_radios() {
        let snapshot = sample_snapshot();
        let node = snapshot.node("dwm1001-1.lille.iot-lab.info").unwrap();
        assert_eq!(node.ble().count(), 1);
        assert_eq!(node.uwb().count(), 1);
        assert_eq!(node.epoch_data.len(), 1);
    }

    #[test]
    fn test_decode_error_reports_line() {
        let err = ExperimentSnapshot::from_ndjson("{\"nodes\":[]}\n\nnot json\n").unwrap_err();
        assert!(matches!(err, SnapshotError::Decode { line: 3, .. }));
    }
}
