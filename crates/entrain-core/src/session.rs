//! Session progress state and resumption planning

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::allocation::Allocation;
use crate::participant::ParticipantId;
use crate::sequencer::{Phase, SequenceSlot, Step, TrialDescriptor, TrialId, TrialSequencer};

/// Taxonomy of trial-local failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Capture,
    Analysis,
    Store,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "CaptureFailure",
            Self::Analysis => "AnalysisFailure",
            Self::Store => "StoreFailure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTrial {
    pub trial: TrialId,
    pub kind: FailureKind,
    pub reason: String,
}

/// Progress snapshot flushed after every trial (`session.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub participant_id: ParticipantId,
    pub allocation: Allocation,
    pub current_slot: Option<SequenceSlot>,
    pub current_phase: Option<Phase>,
    pub current_trial: Option<u32>,
    pub completed_trials: u32,
    pub failed_trials: Vec<FailedTrial>,
    pub finished: bool,
}

impl SessionState {
    pub fn new(participant_id: ParticipantId, allocation: Allocation) -> Self {
        Self {
            participant_id,
            allocation,
            current_slot: None,
            current_phase: None,
            current_trial: None,
            completed_trials: 0,
            failed_trials: Vec::new(),
            finished: false,
        }
    }

    pub fn begin_trial(&mut self, trial: &TrialDescriptor) {
        self.current_slot = Some(trial.slot);
        self.current_phase = Some(trial.phase);
        self.current_trial = Some(trial.index);
    }

    /// A trial that finally persisted is no longer a failure
    pub fn complete_trial(&mut self, trial: TrialId) {
        self.completed_trials += 1;
        self.failed_trials.retain(|f| f.trial != trial);
    }

    /// Latest failure per trial wins
    pub fn fail_trial(&mut self, trial: TrialId, kind: FailureKind, reason: impl Into<String>) {
        self.failed_trials.retain(|f| f.trial != trial);
        self.failed_trials.push(FailedTrial { trial, kind, reason: reason.into() });
    }

    /// Bring a stored snapshot in line with what the output tree holds
    pub fn reconcile(&mut self, persisted: &BTreeSet<TrialId>) {
        self.completed_trials = persisted.len() as u32;
        self.failed_trials.retain(|f| !persisted.contains(&f.trial));
        self.finished = false;
    }
}

/// Design trials that have no persisted directory
pub fn missing_trials(allocation: Allocation, persisted: &BTreeSet<TrialId>) -> Vec<TrialDescriptor> {
    TrialSequencer::new(allocation)
        .trials()
        .filter(|t| t.trial_id().is_some_and(|id| !persisted.contains(&id)))
        .collect()
}

/// Steps needed to complete a partially persisted session.
///
/// Persisted trials are dropped. A sequence with nothing missing is skipped
/// entirely, practice included. Phase headers survive only when their
/// phase still has trials to run, and a pause survives only when trials
/// run both before and after it.
pub fn resume_plan(allocation: Allocation, persisted: &BTreeSet<TrialId>) -> Vec<Step> {
    let steps: Vec<Step> = TrialSequencer::new(allocation).collect();
    let missing = missing_trials(allocation, persisted);

    let slot_pending = |slot: SequenceSlot| missing.iter().any(|t| t.slot == slot);
    let phase_pending = |slot: SequenceSlot, phase: Phase| {
        if phase == Phase::Practice {
            return slot_pending(slot);
        }
        missing.iter().any(|t| t.slot == slot && t.phase == phase)
    };
    let keep_trial = |t: &TrialDescriptor| match t.trial_id() {
        Some(id) => !persisted.contains(&id),
        None => slot_pending(t.slot),
    };

    let kept: Vec<Option<Step>> = steps
        .iter()
        .map(|step| match step {
            Step::EnterPhase(entry) => phase_pending(entry.slot, entry.phase).then_some(*step),
            Step::Trial(t) => keep_trial(t).then_some(*step),
            Step::Pause(_) => Some(*step),
        })
        .collect();

    let runs_trial = |s: &Option<Step>| matches!(s, Some(Step::Trial(_)));
    kept.iter()
        .enumerate()
        .filter_map(|(i, step)| match step {
            Some(Step::Pause(_)) => {
                let before = kept[..i].iter().any(runs_trial);
                let after = kept[i + 1..].iter().any(runs_trial);
                (before && after).then_some(*step).flatten()
            }
            other => *other,
        })
        .collect()
}
