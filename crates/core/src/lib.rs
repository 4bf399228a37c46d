// crates/core/src/lib.rs
pub mod error;
pub mod format;
pub mod options;
pub mod sandbox;
pub mod validate;

pub use error::*;
pub use format::*;
pub use options::*;
pub use sandbox::*;
pub use validate::*;
