//! Core orchestration library for the DAQ run monitor.
//!
//! This crate owns everything in `SPEC_FULL.md`'s components C1-C13: path
//! layout, configuration, the masking bootstrap, raw-file discovery, the
//! job queue and priority model, the exclusive-merge token, the worker
//! pool, the four pipeline stages, the idle/completion state machine, and
//! timing telemetry. The `daq-monitor` crate wraps this library with a
//! CLI, logging setup, and two small companion binaries.

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod external;
pub mod job;
pub mod masking;
pub mod paths;
pub mod queue;
pub mod scanner;
pub mod stages;
pub mod state;
pub mod timing;
pub mod token;

pub use config::{ConfigOverrides, MonitorConfig};
pub use coordinator::{Coordinator, RunOutcome};
pub use error::{MonitorError, Result};
pub use external::ProcessTools;
