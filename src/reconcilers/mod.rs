//! Reconcilers for PachydermExport and PachydermImport
//!
//! Each reconciler advances its resource by one step per call:
//! - Validating the spec and the referenced storage secret
//! - Submitting the job to the backup handler and polling it
//! - Toggling maintenance mode on the affected Pachyderm instance
//! - Updating resource status

pub mod export;
pub mod import;

#[cfg(test)]
pub mod testing;
