//! PEPPER experiment orchestrator.
//!
//! Runs a PEPPER proximity-tracing campaign over a set of RIOT devices:
//! - environments come from an IoT-LAB reservation or a static boards file
//! - each device is flashed, reset and driven through its shell
//! - all nodes run the campaign concurrently, each with its own deadline
//! - their output is classified into epoch summaries and telemetry and
//!   persisted as one snapshot

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod environment;
pub mod error;
pub mod experiment;
pub mod iotlab;
pub mod results;
pub mod sanitizer;
pub mod shell;

pub use config::ExperimentConfig;
pub use coordinator::{EpochCoordinator, EpochState, Node, epoch_timeout};
pub use device::{DeviceControlFactory, FirmwareTool, RiotMakeTool};
pub use environment::{Environment, EnvironmentFactory, FileEnvFactory, ReservationSpec};
pub use experiment::Orchestrator;
pub use results::ExperimentDataStore;
pub use shell::{DeviceSession, PepperParams};
