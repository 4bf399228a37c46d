// crates/server/src/separation/mod.rs
//! Running the separation tool.

pub mod command;
pub mod progress;
pub mod supervisor;

pub use command::{separation_command, ToolCommand};
pub use supervisor::{SeparationError, SeparationRun, Supervisor, SupervisorSettings};
