use chrono::NaiveDate;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("an activity day is already recorded for competition {competition_id} on {date}")]
    DuplicateActivityDay {
        competition_id: String,
        date: NaiveDate,
    },

    #[error("students already belong to another group in this competition: {}", student_ids.join(", "))]
    MembershipConflict { student_ids: Vec<String> },

    #[error("{0} not found")]
    NotFound(String),

    #[error("store call timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScoringError {
    /// Rejections are reported back to the user as-is; everything else is a
    /// backend failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ScoringError::Validation(_)
                | ScoringError::DuplicateActivityDay { .. }
                | ScoringError::MembershipConflict { .. }
                | ScoringError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScoringError>;
