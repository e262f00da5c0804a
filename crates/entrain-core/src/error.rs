//! Error types for entrain

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EntrainError {
    #[error("Invalid participant ID {0:?}: expected {len} digits", len = crate::participant::PARTICIPANT_ID_LEN)]
    InvalidParticipantId(String),
    #[error("Invalid allocation record: {0}")]
    InvalidAllocation(String),
    #[error("Unknown rhythm: {0}")]
    UnknownRhythm(String),
}

pub type Result<T> = std::result::Result<T, EntrainError>;
