//! Output classifier: turn a captured device transcript into typed records.
//!
//! Every line is classified independently. Telemetry is tried first, then
//! epoch summaries; anything else (shell noise, partial lines, other logs) is
//! dropped with a debug event. Firmware versions differ in which of the two
//! schema families they print, so both may appear alone or interleaved.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datum::{TelemetryKind, TelemetrySample};
use crate::epoch::EpochSummary;

/// Result of classifying a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Epoch(EpochSummary),
    Telemetry(TelemetrySample),
}

/// Classified records of one capture, each list in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedOutput {
    pub summaries: Vec<EpochSummary>,
    pub telemetry: Vec<TelemetrySample>,
}

impl ClassifiedOutput {
    /// Telemetry samples produced by one radio.
    pub fn telemetry_of(&self, kind: TelemetryKind) -> impl Iterator<Item = &TelemetrySample> {
        self.telemetry.iter().filter(move |s| s.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty() && self.telemetry.is_empty()
    }

    /// Append another capture's records after this one's.
    pub fn extend(&mut self, other: ClassifiedOutput) {
        self.summaries.extend(other.summaries);
        self.telemetry.extend(other.telemetry);
    }
}

/// Classify one line. Never fails: unrecognized input yields `None`.
pub fn classify_line(line: &str) -> Option<Classified> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(sample) = TelemetrySample::from_json_str(line) {
        return Some(Classified::Telemetry(sample));
    }
    if let Some(summary) = EpochSummary::from_json_str(line) {
        return Some(Classified::Epoch(summary));
    }
    debug!(line, "Skipping unrecognized output line");
    None
}

/// Classify a whole capture, line by line.
pub fn classify(output: &str) -> ClassifiedOutput {
    classify_lines(output.lines())
}

/// Classify an already split capture.
pub fn classify_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> ClassifiedOutput {
    let mut result = ClassifiedOutput::default();
    for line in lines {
        match classify_line(line) {
            Some(Classified::Epoch(summary)) => result.summaries.push(summary),
            Some(Classified::Telemetry(sample)) => result.telemetry.push(sample),
            None => {}
        }
    }
    result
}
