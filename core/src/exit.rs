// Process exit status for a checker run

use serde::{Deserialize, Serialize};

/// Exit statuses, using the conventional fsck numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Ok,
    ErrorsCorrected,
    ErrorsUncorrected,
    FatalError,
    UsageError,
    Canceled,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::ErrorsCorrected => 1,
            ExitStatus::ErrorsUncorrected => 4,
            ExitStatus::FatalError => 8,
            ExitStatus::UsageError => 16,
            ExitStatus::Canceled => 32,
        }
    }

    /// Status of a run that was not canceled, from its repair counters.
    pub fn from_counts(errors_found: u64, errors_corrected: u64) -> Self {
        if errors_found == 0 {
            ExitStatus::Ok
        } else if errors_corrected >= errors_found {
            ExitStatus::ErrorsCorrected
        } else {
            ExitStatus::ErrorsUncorrected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_fsck_convention() {
        assert_eq!(ExitStatus::Ok.code(), 0);
        assert_eq!(ExitStatus::ErrorsCorrected.code(), 1);
        assert_eq!(ExitStatus::ErrorsUncorrected.code(), 4);
        assert_eq!(ExitStatus::FatalError.code(), 8);
        assert_eq!(ExitStatus::UsageError.code(), 16);
        assert_eq!(ExitStatus::Canceled.code(), 32);
    }

    #[test]
    fn test_from_counts() {
        assert_eq!(ExitStatus::from_counts(0, 0), ExitStatus::Ok);
        assert_eq!(ExitStatus::from_counts(3, 3), ExitStatus::ErrorsCorrected);
        assert_eq!(ExitStatus::from_counts(3, 2), ExitStatus::ErrorsUncorrected);
    }
}
