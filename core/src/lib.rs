pub mod error;
pub mod exit;
pub mod options;

pub use error::{FsckError, Result};
pub use exit::ExitStatus;
pub use options::{CheckOptions, RepairMode, BAD_POINTER_TOLERANCE};
