//! Pachyderm backup operator
//!
//! Two cooperating processes share this crate:
//! - the operator, which watches PachydermExport and PachydermImport
//!   resources and drives their state machines
//! - the backup handler, which stores jobs in SQLite, serves them over the
//!   coordination API and runs them against database pods

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod reconcilers;
pub mod runtime;

pub use config::{HandlerConfig, OperatorConfig};
pub use error::{Error, Result};
