// Run options for a consistency check

use crate::error::{FsckError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of out-of-range pointers an inode may carry before
/// its whole tree is considered untrustworthy.
pub const BAD_POINTER_TOLERANCE: u32 = 10;

/// How repair questions are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairMode {
    /// Ask the operator for every repair
    Ask,
    /// Answer yes to every repair
    Yes,
    /// Answer no to every repair and never write to the device
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    pub repair_mode: RepairMode,
    /// Unattended mode; fixes what is safe without asking
    pub preen: bool,
    /// Check even if the filesystem is marked clean or preen looks unsafe
    pub force: bool,
    pub bad_pointer_tolerance: u32,
    /// env_logger filter used when RUST_LOG is unset
    pub log_level: Option<String>,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            repair_mode: RepairMode::Ask,
            preen: false,
            force: false,
            bad_pointer_tolerance: BAD_POINTER_TOLERANCE,
            log_level: None,
        }
    }
}

impl CheckOptions {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let options: CheckOptions = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bad_pointer_tolerance == 0 {
            return Err(FsckError::Configuration(
                "bad_pointer_tolerance must be at least 1".to_string(),
            ));
        }
        if self.preen && self.repair_mode == RepairMode::Ask {
            return Err(FsckError::Configuration(
                "preen mode cannot ask questions; use repair_mode yes or no".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the device may be written to during the run.
    pub fn writable(&self) -> bool {
        self.repair_mode != RepairMode::No
    }
}
