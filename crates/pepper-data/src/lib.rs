//! PEPPER data: the records a PEPPER device prints and the classifier that reads them.
//!
//! A running device interleaves two schema families on its shell:
//! - per-encounter telemetry (BLE RSSI, UWB distance/line-of-sight)
//! - end-of-epoch summaries listing the encounter tokens it collected
//!
//! This crate has no I/O: it parses captured text and defines the snapshot
//! format an experiment persists.

pub mod classifier;
pub mod datum;
pub mod epoch;
pub mod snapshot;

pub use classifier::{Classified, ClassifiedOutput, classify, classify_line, classify_lines};
pub use datum::{Measurement, MeasurementKind, TelemetryKind, TelemetrySample};
pub use epoch::{BleStats, EpochSummary, Pet, PetElement, UwbStats};
pub use snapshot::{EpochOutcome, ExperimentSnapshot, NodeRecord, Position, SnapshotError};
