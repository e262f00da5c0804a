//! entrain-core: Domain types for the rhythm-tapping experiment

pub mod algorithms;
pub mod allocation;
mod error;
pub mod participant;
pub mod record;
pub mod sequencer;
pub mod session;
pub mod stimulus;
pub mod summary;

pub use algorithms::{align_onsets, match_markers, MarkerCheck, OnsetAlignment, ALIGNMENT_WINDOW_MS};
pub use allocation::{Allocation, BalanceLedger, Complexity, Ear, SequenceOrder};
pub use error::{EntrainError, Result};
pub use participant::{ParticipantId, PARTICIPANT_ID_LEN};
pub use record::{QualityCheck, TrialMetrics, TrialRecord};
pub use sequencer::{
    Pause, PauseKind, Phase, PhaseEntry, SequenceSlot, SequencerState, Step, TrialDescriptor,
    TrialId, TrialSequencer,
};
pub use session::{missing_trials, resume_plan, FailedTrial, FailureKind, SessionState};
pub use stimulus::{RhythmId, StimulusSchedule};
pub use summary::{SummaryRow, SUMMARY_COLUMNS};
