//! Adapters between the state machines and the Kubernetes API

mod cluster;
mod secrets;

pub use cluster::*;
pub use secrets::*;
