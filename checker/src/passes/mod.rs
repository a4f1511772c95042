// Check passes

pub mod pass1;
pub mod pass1b;
pub mod pass2;
pub mod pass3;
pub mod pass4;
pub mod pass5;

use crate::cancel::CancelState;
use crate::context::FsckContext;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PassId {
    Pass1,
    Pass1b,
    Pass2,
    Pass3,
    Pass4,
    Pass5,
}

impl PassId {
    pub const ALL: [PassId; 6] = [
        PassId::Pass1,
        PassId::Pass1b,
        PassId::Pass2,
        PassId::Pass3,
        PassId::Pass4,
        PassId::Pass5,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PassId::Pass1 => "Pass1",
            PassId::Pass1b => "Pass1b",
            PassId::Pass2 => "Pass2",
            PassId::Pass3 => "Pass3",
            PassId::Pass4 => "Pass4",
            PassId::Pass5 => "Pass5",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            PassId::Pass1 => "checking inodes, blocks, and sizes",
            PassId::Pass1b => "resolving duplicate block references",
            PassId::Pass2 => "checking directory structure",
            PassId::Pass3 => "checking directory connectivity",
            PassId::Pass4 => "checking reference counts",
            PassId::Pass5 => "checking allocation bitmaps",
        }
    }
}

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassStatus {
    Completed,
    /// Interrupted; the run continues with the next pass
    Skipped,
    /// Interrupted; the run stops
    Aborted,
}

/// Status to end a pass with when an interrupt is pending
pub(crate) fn interrupted(ctx: &FsckContext) -> Option<PassStatus> {
    match ctx.poll_cancel() {
        CancelState::Continue => None,
        CancelState::SkipPass => Some(PassStatus::Skipped),
        CancelState::Abort => Some(PassStatus::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_order() {
        assert_eq!(PassId::ALL.first(), Some(&PassId::Pass1));
        assert_eq!(PassId::ALL.last(), Some(&PassId::Pass5));
        assert_eq!(PassId::Pass1b.name(), "Pass1b");
    }
}
