//! Prometheus metrics for the Pachyderm backup operator and backup handler
//!
//! This module exposes metrics for monitoring operator health and dispatch throughput.

mod prometheus;

pub use prometheus::*;
