//! Trial sequencer: phase/trial state machine for one participant session
//!
//! The sequencer is a pure generator. It yields phase entries, trial
//! descriptors and pauses in presentation order and never performs I/O;
//! the controller sleeps for pauses and runs trials.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocation::{Allocation, Ear};
use crate::stimulus::RhythmId;

pub const PRACTICE_TRIALS: u32 = 2;
pub const TRIALS_PER_BLOCK: u32 = 6;
/// Pause after test block 1 of each sequence
pub const SHORT_BREAK: Duration = Duration::from_secs(15);
/// Pause between the two sequences
pub const LONG_BREAK: Duration = Duration::from_secs(120);
/// Practice trials are listen-only and leave nothing on disk
pub const PERSIST_PRACTICE: bool = false;
/// Persisted trial directories per stimulus
pub const PERSISTED_TRIALS_PER_SEQUENCE: u32 =
    2 * TRIALS_PER_BLOCK + if PERSIST_PRACTICE { PRACTICE_TRIALS } else { 0 };

/// Presentation position of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceSlot {
    First,
    Second,
}

impl SequenceSlot {
    /// Stimulus directory number (`stimulus_<X>`)
    pub fn number(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Practice,
    TestBlock1,
    TestBlock2,
}

impl Phase {
    pub fn trial_count(self) -> u32 {
        match self {
            Self::Practice => PRACTICE_TRIALS,
            Self::TestBlock1 | Self::TestBlock2 => TRIALS_PER_BLOCK,
        }
    }

    /// Whether trials in this phase are recorded, analyzed and persisted
    pub fn is_recorded(self) -> bool {
        !matches!(self, Self::Practice) || PERSIST_PRACTICE
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Practice => "practice",
            Self::TestBlock1 => "test_block_1",
            Self::TestBlock2 => "test_block_2",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    BetweenBlocks,
    BetweenSequences,
}

impl PauseKind {
    pub fn duration(self) -> Duration {
        match self {
            Self::BetweenBlocks => SHORT_BREAK,
            Self::BetweenSequences => LONG_BREAK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pause {
    pub kind: PauseKind,
    pub duration: Duration,
}

impl From<PauseKind> for Pause {
    fn from(kind: PauseKind) -> Self {
        Self { kind, duration: kind.duration() }
    }
}

/// Output-tree identity of a trial: `stimulus_<stimulus>/trial_<trial>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId {
    pub stimulus: u8,
    pub trial: u32,
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stimulus_{}/trial_{}", self.stimulus, self.trial)
    }
}

/// One trial as yielded by the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialDescriptor {
    pub slot: SequenceSlot,
    pub phase: Phase,
    /// 1-based index within the phase
    pub index: u32,
    pub rhythm: RhythmId,
    pub ear: Ear,
}

impl TrialDescriptor {
    /// Trial number within the sequence: practice 1..2, test 1..12
    pub fn trial_number(&self) -> u32 {
        match self.phase {
            Phase::Practice | Phase::TestBlock1 => self.index,
            Phase::TestBlock2 => TRIALS_PER_BLOCK + self.index,
        }
    }

    /// Directory identity, `None` for trials that are never persisted
    pub fn trial_id(&self) -> Option<TrialId> {
        if !self.phase.is_recorded() {
            return None;
        }
        let trial = if PERSIST_PRACTICE && self.phase != Phase::Practice {
            PRACTICE_TRIALS + self.trial_number()
        } else {
            self.trial_number()
        };
        Some(TrialId { stimulus: self.slot.number(), trial })
    }
}

impl fmt::Display for TrialDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stimulus {} ({}, {} ear) {} trial {}",
            self.slot.number(),
            self.rhythm,
            self.ear,
            self.phase,
            self.index
        )
    }
}

/// Phase header yielded before the first trial of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEntry {
    pub slot: SequenceSlot,
    pub phase: Phase,
    pub rhythm: RhythmId,
    pub ear: Ear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    EnterPhase(PhaseEntry),
    Trial(TrialDescriptor),
    Pause(Pause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    Idle,
    Practice(SequenceSlot),
    TestBlock1(SequenceSlot),
    Break15(SequenceSlot),
    TestBlock2(SequenceSlot),
    Break120,
    Done,
}

impl SequencerState {
    fn phase(self) -> Option<(SequenceSlot, Phase)> {
        match self {
            Self::Practice(slot) => Some((slot, Phase::Practice)),
            Self::TestBlock1(slot) => Some((slot, Phase::TestBlock1)),
            Self::TestBlock2(slot) => Some((slot, Phase::TestBlock2)),
            _ => None,
        }
    }

    /// State that follows a completed phase
    fn after_phase(self) -> Self {
        match self {
            Self::Practice(slot) => Self::TestBlock1(slot),
            Self::TestBlock1(slot) => Self::Break15(slot),
            Self::TestBlock2(SequenceSlot::First) => Self::Break120,
            Self::TestBlock2(SequenceSlot::Second) => Self::Done,
            other => other,
        }
    }
}

/// Lazy, finite, non-restartable step generator
#[derive(Debug)]
pub struct TrialSequencer {
    allocation: Allocation,
    state: SequencerState,
    /// 0 until the current phase has been entered
    next_index: u32,
}

impl TrialSequencer {
    pub fn new(allocation: Allocation) -> Self {
        Self {
            allocation,
            state: SequencerState::Idle,
            next_index: 0,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Just the trial descriptors, in order
    pub fn trials(self) -> impl Iterator<Item = TrialDescriptor> {
        self.filter_map(|step| match step {
            Step::Trial(t) => Some(t),
            _ => None,
        })
    }
}

impl Iterator for TrialSequencer {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        loop {
            match self.state {
                SequencerState::Idle => {
                    self.state = SequencerState::Practice(SequenceSlot::First);
                    self.next_index = 0;
                }
                SequencerState::Done => return None,
                SequencerState::Break15(slot) => {
                    self.state = SequencerState::TestBlock2(slot);
                    self.next_index = 0;
                    return Some(Step::Pause(PauseKind::BetweenBlocks.into()));
                }
                SequencerState::Break120 => {
                    self.state = SequencerState::Practice(SequenceSlot::Second);
                    self.next_index = 0;
                    return Some(Step::Pause(PauseKind::BetweenSequences.into()));
                }
                state => {
                    let Some((slot, phase)) = state.phase() else { return None };
                    let rhythm = self.allocation.rhythm_for(slot);
                    let ear = self.allocation.ear_for(slot);

                    if self.next_index == 0 {
                        self.next_index = 1;
                        return Some(Step::EnterPhase(PhaseEntry { slot, phase, rhythm, ear }));
                    }
                    if self.next_index <= phase.trial_count() {
                        let index = self.next_index;
                        self.next_index += 1;
                        return Some(Step::Trial(TrialDescriptor { slot, phase, index, rhythm, ear }));
                    }
                    self.state = state.after_phase();
                    self.next_index = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{Complexity, SequenceOrder};

    fn alloc() -> Allocation {
        Allocation::new(Complexity::Complex, Ear::Right, SequenceOrder::Two)
    }

    #[test]
    fn test_step_order() {
        let steps: Vec<Step> = TrialSequencer::new(alloc()).collect();
        // 6 phases, 28 trials, 3 pauses
        assert_eq!(steps.len(), 6 + 28 + 3);

        let pauses: Vec<(usize, Pause)> = steps
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Step::Pause(p) => Some((i, *p)),
                _ => None,
            })
            .collect();
        assert_eq!(pauses.len(), 3);
        assert_eq!(pauses[0].1.duration, Duration::from_secs(15));
        assert_eq!(pauses[1].1.duration, Duration::from_secs(120));
        assert_eq!(pauses[2].1.duration, Duration::from_secs(15));
        assert_eq!(pauses[1].1.kind, PauseKind::BetweenSequences);

        // Pause placement: after 1 + 2 + 1 + 6 steps (practice header+trials, block header+trials)
        assert_eq!(pauses[0].0, 10);
        assert!(matches!(steps[pauses[0].0 - 1], Step::Trial(TrialDescriptor { phase: Phase::TestBlock1, index: 6, .. })));
        assert!(matches!(steps[pauses[0].0 + 1], Step::EnterPhase(PhaseEntry { phase: Phase::TestBlock2, .. })));
        assert!(matches!(steps.last(), Some(Step::Trial(TrialDescriptor { slot: SequenceSlot::Second, phase: Phase::TestBlock2, index: 6, .. }))));
    }

    #[test]
    fn test_sequence_order_two_swaps_rhythm_and_ear() {
        let trials: Vec<TrialDescriptor> = TrialSequencer::new(alloc()).trials().collect();
        let first = trials[0];
        assert_eq!(first.slot, SequenceSlot::First);
        assert_eq!(first.rhythm.index, 2);
        assert_eq!(first.ear, Ear::Right);

        let second = trials.iter().find(|t| t.slot == SequenceSlot::Second).unwrap();
        assert_eq!(second.rhythm.index, 1);
        assert_eq!(second.ear, Ear::Left);

        // Counts are unaffected by ordering
        let order_one = Allocation::new(Complexity::Complex, Ear::Right, SequenceOrder::One);
        assert_eq!(TrialSequencer::new(order_one).trials().count(), trials.len());
    }

    #[test]
    fn test_trial_ids_are_monotonic_per_stimulus() {
        let ids: Vec<TrialId> = TrialSequencer::new(alloc())
            .trials()
            .filter_map(|t| t.trial_id())
            .collect();
        assert_eq!(ids.len() as u32, 2 * PERSISTED_TRIALS_PER_SEQUENCE);
        assert_eq!(PERSISTED_TRIALS_PER_SEQUENCE, 12);
        for stimulus in [1u8, 2] {
            let trials: Vec<u32> = ids.iter().filter(|i| i.stimulus == stimulus).map(|i| i.trial).collect();
            assert_eq!(trials, (1..=12).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_practice_is_not_persisted() {
        let practice: Vec<TrialDescriptor> = TrialSequencer::new(alloc())
            .trials()
            .filter(|t| t.phase == Phase::Practice)
            .collect();
        assert_eq!(practice.len(), 4);
        assert!(practice.iter().all(|t| t.trial_id().is_none() && !t.phase.is_recorded()));
    }

    #[test]
    fn test_exhausted_sequencer_stays_done() {
        let mut seq = TrialSequencer::new(alloc());
        assert_eq!(seq.state(), SequencerState::Idle);
        for _ in seq.by_ref() {}
        assert_eq!(seq.state(), SequencerState::Done);
        assert!(seq.next().is_none());
    }
}
