//! Backup handler: job store, coordination API and dispatch loop

pub mod api;
pub mod archive;
pub mod client;
pub mod dispatch;
pub mod executor;
pub mod models;
pub mod store;

pub use archive::Archiver;
pub use client::{CoordinationApi, HandlerClient};
pub use dispatch::{CycleSummary, Dispatcher, JobOutcome};
pub use executor::{ExecOutput, ExecRequest, KubeExecutor, RemoteExecutor};
pub use models::{BackupEnvelope, Completion, Job, JobMeta, RestoreEnvelope, RestorePhase};
pub use store::JobStore;
