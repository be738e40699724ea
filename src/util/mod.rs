//! Small shared helpers

pub mod fs;
pub mod process;

pub use fs::{fsync_dir, write_atomic};
pub use process::{run, CommandOutput, ProcessError};
