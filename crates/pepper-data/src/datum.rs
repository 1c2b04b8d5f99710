//! Telemetry records: SenML-like measurement lines emitted while an epoch runs.
//!
//! The firmware prints one record per line, either as a single object
//!
//! ```text
//! {"bn":"DWABCD:pepper:uwb:8fd6","bt":84060,"n":"d_cm","v":218,"u":"cm"}
//! ```
//!
//! or as an array whose first element carries the shared annotation tag
//! (`bn`) and base time (`bt`):
//!
//! ```text
//! [{"bn":"pepper:uwb:2ede8fd6","bt":84060,"n":"d_cm","v":218,"u":"cm"},{"n":"los","v":100,"u":"%"}]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single raw SenML element as printed by the firmware.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Datum {
    /// Annotation tag, only present on the first element of a record
    #[serde(default)]
    pub bn: Option<String>,
    /// Measurement name (`rssi`, `d_cm`, `los`)
    pub n: String,
    /// Measurement value
    pub v: f64,
    /// Unit
    pub u: String,
    /// Base time in milliseconds, shared by all elements of a record
    #[serde(default)]
    pub bt: Option<i64>,
    /// Element time offset in milliseconds
    #[serde(default)]
    pub t: Option<i64>,
}

/// Radio subsystem that produced a telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Ble,
    Uwb,
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => f.write_str("ble"),
            Self::Uwb => f.write_str("uwb"),
        }
    }
}

impl FromStr for TelemetryKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ble" => Ok(Self::Ble),
            "uwb" => Ok(Self::Uwb),
            _ => Err(()),
        }
    }
}

/// Name of a scalar measurement inside a telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Rssi,
    DCm,
    Los,
}

impl FromStr for MeasurementKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rssi" => Ok(Self::Rssi),
            "d_cm" => Ok(Self::DCm),
            "los" => Ok(Self::Los),
            _ => Err(()),
        }
    }
}

/// One timestamped scalar measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub kind: MeasurementKind,
    pub value: f64,
    pub unit: String,
    /// `t + bt` in milliseconds
    pub time: i64,
}

/// Parsed annotation tag: `<node>:<subsystem>:<kind>:<neighbor>` or
/// `<subsystem>:<kind>:<neighbor>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationTag {
    pub node_id: Option<String>,
    pub subsystem: String,
    pub kind: TelemetryKind,
    pub neighbor: String,
}

impl AnnotationTag {
    /// Parse a `bn` value, returning `None` for anything that is neither the
    /// 3- nor the 4-segment form or names an unknown radio.
    pub fn parse(tag: &str) -> Option<Self> {
        let segments: Vec<&str> = tag.split(':').collect();
        let (node_id, rest) = match segments.as_slice() {
            [node, rest @ ..] if segments.len() == 4 => (Some(node.to_string()), rest),
            rest if segments.len() == 3 => (None, rest),
            _ => return None,
        };
        let [subsystem, kind, neighbor] = rest else {
            return None;
        };
        if neighbor.is_empty() {
            return None;
        }
        Some(Self {
            node_id,
            subsystem: subsystem.to_string(),
            kind: kind.parse().ok()?,
            neighbor: neighbor.to_string(),
        })
    }
}

/// A classified telemetry record: everything one line reported about one neighbor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub kind: TelemetryKind,
    /// Neighbor identifier as printed (e.g. `2ede8fd6` or `8fd6`)
    pub neighbor: String,
    /// Reporting node, only known for 4-segment tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Subsystem segment of the tag (usually `pepper`)
    pub tag: String,
    /// Timestamp of the record (`t + bt` of its first element)
    pub time: i64,
    pub measurements: Vec<Measurement>,
}

impl TelemetrySample {
    /// Build a sample from the raw elements of one record.
    ///
    /// The first element carries the tag and base time; every element
    /// (including the first) contributes a measurement when its name is known.
    /// A time that does not fit in `i64` rejects the whole record.
    pub fn from_datums(datums: &[Datum]) -> Option<Self> {
        let base = datums.first()?;
        let tag = AnnotationTag::parse(base.bn.as_deref()?)?;
        let bt = base.bt.unwrap_or(0);

        let mut measurements = Vec::with_capacity(datums.len());
        for datum in datums {
            let Ok(kind) = datum.n.parse() else {
                continue;
            };
            measurements.push(Measurement {
                kind,
                value: datum.v,
                unit: datum.u.clone(),
                time: datum.t.unwrap_or(0).checked_add(bt)?,
            });
        }

        Some(Self {
            kind: tag.kind,
            neighbor: tag.neighbor,
            node_id: tag.node_id,
            tag: tag.subsystem,
            time: base.t.unwrap_or(0).checked_add(bt)?,
            measurements,
        })
    }

    /// Parse one output line in either the single-object or the array form.
    pub fn from_json_str(line: &str) -> Option<Self> {
        let datums: Vec<Datum> = match serde_json::from_str::<Value>(line).ok()? {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<_, _>>()
                .ok()?,
            value @ Value::Object(_) => vec![serde_json::from_value(value).ok()?],
            _ => return None,
        };
        Self::from_datums(&datums)
    }

    fn value_of(&self, kind: MeasurementKind) -> Option<f64> {
        self.measurements
            .iter()
            .find(|m| m.kind == kind)
            .map(|m| m.value)
    }

    pub fn rssi(&self) -> Option<f64> {
        self.value_of(MeasurementKind::Rssi)
    }

    pub fn d_cm(&self) -> Option<f64> {
        self.value_of(MeasurementKind::DCm)
    }

    pub fn los(&self) -> Option<f64> {
        self.value_of(MeasurementKind::Los)
    }

    /// Device uid of the neighbor: `8fd6` => `DW8FD6`.
    ///
    /// Only short (4 character) identifiers map to a uid.
    pub fn neighbor_uid(&self) -> Option<String> {
        (self.neighbor.len() == 4).then(|| format!("DW{}", self.neighbor.to_uppercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ble_array() {
        let line = r#"[{"bn":"pepper:ble:2ede8fd6","bt":83782,"n":"rssi","v":-52,"u":"dBm"}]"#;
        let sample = TelemetrySample::from_json_str(line).unwrap();

        assert_eq!(sample.kind, TelemetryKind::Ble);
        assert_eq!(sample.neighbor, "2ede8fd6");
        assert_eq!(sample.node_id, None);
        assert_eq!(sample.tag, "pepper");
        assert_eq!(sample.time, 83782);
        assert_eq!(sample.rssi(), Some(-52.0));
        assert_eq!(sample.neighbor_uid(), None);
    }

    #[test]
    fn test_parse_uwb_single_object_with_node() {
        let line = r#"{"bn":"DWABCD:pepper:uwb:8fd6","bt":84060,"n":"d_cm","v":218,"u":"cm"}"#;
        let sample = TelemetrySample::from_json_str(line).unwrap();

        assert_eq!(sample.kind, TelemetryKind::Uwb);
        assert_eq!(sample.node_id.as_deref(), Some("DWABCD"));
        assert_eq!(sample.d_cm(), Some(218.0));
        assert_eq!(sample.los(), None);
        assert_eq!(sample.neighbor_uid().as_deref(), Some("DW8FD6"));
    }

    #[test]
    fn test_sub_measurements_share_base_time() {
        let line = r#"[{"bn":"pepper:uwb:2ede8fd6","bt":84060,"n":"d_cm","v":218,"u":"cm"},{"n":"los","v":100,"u":"%","t":5},{"n":"rssi","v":0,"u":"dBm"}]"#;
        let sample = TelemetrySample::from_json_str(line).unwrap();

        assert_eq!(sample.measurements.len(), 3);
        assert_eq!(sample.los(), Some(100.0));
        assert_eq!(sample.rssi(), Some(0.0));
        assert_eq!(sample.measurements[1].time, 84065);
        assert_eq!(sample.measurements[2].time, 84060);
    }

    #[test]
    fn test_time_overflow_rejects_record() {
        let base = r#"{"bn":"pepper:ble:2ede","bt":9223372036854775807,"t":1,"n":"rssi","v":-52,"u":"dBm"}"#;
        assert!(TelemetrySample::from_json_str(base).is_none());

        let element = r#"[{"bn":"pepper:uwb:2ede","bt":10,"n":"d_cm","v":218,"u":"cm"},{"n":"los","v":100,"u":"%","t":9223372036854775807}]"#;
        assert!(TelemetrySample::from_json_str(element).is_none());

        let negative = r#"{"bn":"pepper:ble:2ede","bt":-9223372036854775808,"t":-1,"n":"rssi","v":-52,"u":"dBm"}"#;
        assert!(TelemetrySample::from_json_str(negative).is_none());
    }

    #[test]
    fn test_negative_base_time() {
        let line = r#"[{"bn":"pepper:ble:2ede","bt":-500,"t":20,"n":"rssi","v":-52,"u":"dBm"}]"#;
        let sample = TelemetrySample::from_json_str(line).unwrap();
        assert_eq!(sample.time, -480);
        assert_eq!(sample.measurements[0].time, -480);
    }

    #[test]
    fn test_rejects_unknown_tags() {
        assert!(AnnotationTag::parse("pepper:lora:2ede").is_none());
        assert!(AnnotationTag::parse("ble:2ede").is_none());
        assert!(AnnotationTag::parse("a:b:ble:c:d").is_none());
        assert!(TelemetrySample::from_json_str(r#"[{"n":"rssi","v":1,"u":"dBm"}]"#).is_none());
        assert!(TelemetrySample::from_json_str("[]").is_none());
        assert!(TelemetrySample::from_json_str("42").is_none());
    }
}
