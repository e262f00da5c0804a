//! Participant identity

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EntrainError, Result};

/// Number of digits in a participant ID
pub const PARTICIPANT_ID_LEN: usize = 9;

/// Fixed-length numeric participant identifier, e.g. `000000001`.
///
/// Leading zeros are significant, so the ID is kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let valid = trimmed.len() == PARTICIPANT_ID_LEN && trimmed.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(EntrainError::InvalidParticipantId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = EntrainError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = EntrainError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}
