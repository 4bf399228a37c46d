// crates/server/src/jobs/mod.rs
//! Shared per-job bookkeeping: status snapshots and live processes.

pub mod registry;
pub mod status;

pub use registry::{ExitPoll, ProcessHandle, ProcessRegistry};
pub use status::{JobOutcome, JobRecord, JobSnapshot, JobStatus, StatusStore, StatusUpdate};
