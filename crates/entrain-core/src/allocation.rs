//! Condition allocation and the balancing ledger

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EntrainError, Result};
use crate::participant::ParticipantId;
use crate::sequencer::SequenceSlot;
use crate::stimulus::RhythmId;

/// Rhythm complexity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Complex,
}

impl Complexity {
    pub const ALL: [Complexity; 2] = [Complexity::Simple, Complexity::Complex];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Complex => "complex",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(Self::Simple),
            "complex" => Ok(Self::Complex),
            other => Err(EntrainError::InvalidAllocation(format!("complexity {other:?}"))),
        }
    }
}

/// Presentation ear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ear {
    Left,
    Right,
}

impl Ear {
    pub const ALL: [Ear; 2] = [Ear::Left, Ear::Right];

    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    /// Stereo channel index (0 = left, 1 = right)
    pub fn channel(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(EntrainError::InvalidAllocation(format!("ear {other:?}"))),
        }
    }
}

impl fmt::Display for Ear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which physical rhythm of the tier is presented first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SequenceOrder {
    /// Rhythm 1 then rhythm 2
    One,
    /// Rhythm 2 then rhythm 1
    Two,
}

impl SequenceOrder {
    pub const ALL: [SequenceOrder; 2] = [SequenceOrder::One, SequenceOrder::Two];

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "1" => Ok(Self::One),
            "2" => Ok(Self::Two),
            other => Err(EntrainError::InvalidAllocation(format!("sequence_order {other:?}"))),
        }
    }
}

/// Randomized condition values assigned to one participant.
///
/// Each allocation is also one cell of the balancing ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Allocation {
    pub complexity: Complexity,
    pub first_ear: Ear,
    pub sequence_order: SequenceOrder,
}

impl Allocation {
    pub fn new(complexity: Complexity, first_ear: Ear, sequence_order: SequenceOrder) -> Self {
        Self { complexity, first_ear, sequence_order }
    }

    /// All 8 condition cells in a stable order
    pub fn all_cells() -> Vec<Allocation> {
        let mut cells = Vec::with_capacity(8);
        for complexity in Complexity::ALL {
            for first_ear in Ear::ALL {
                for sequence_order in SequenceOrder::ALL {
                    cells.push(Self::new(complexity, first_ear, sequence_order));
                }
            }
        }
        cells
    }

    /// Ear alternates between the two presented sequences
    pub fn ear_for(&self, slot: SequenceSlot) -> Ear {
        match slot {
            SequenceSlot::First => self.first_ear,
            SequenceSlot::Second => self.first_ear.opposite(),
        }
    }

    /// Physical rhythm presented in the given slot
    pub fn rhythm_for(&self, slot: SequenceSlot) -> RhythmId {
        let index = match (self.sequence_order, slot) {
            (SequenceOrder::One, SequenceSlot::First) | (SequenceOrder::Two, SequenceSlot::Second) => 1,
            (SequenceOrder::Two, SequenceSlot::First) | (SequenceOrder::One, SequenceSlot::Second) => 2,
        };
        RhythmId { complexity: self.complexity, index }
    }

    /// Compact label, e.g. `complex-stimulus2-rightear`
    pub fn condition_label(&self) -> String {
        format!(
            "{}-stimulus{}-{}ear",
            self.complexity.as_str(),
            self.sequence_order.number(),
            self.first_ear.as_str()
        )
    }

    /// Render the `allocation.txt` key/value record
    pub fn to_record(&self, participant: &ParticipantId) -> String {
        format!(
            "participant_id={}\ncomplexity={}\nfirst_ear={}\nsequence_order={}\ncondition={}\n",
            participant,
            self.complexity.as_str(),
            self.first_ear.as_str(),
            self.sequence_order.number(),
            self.condition_label()
        )
    }

    /// Parse an `allocation.txt` record back into its participant and allocation
    pub fn parse_record(text: &str) -> Result<(ParticipantId, Allocation)> {
        let mut fields = BTreeMap::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                return Err(EntrainError::InvalidAllocation(format!("malformed line {line:?}")));
            };
            fields.insert(key.trim(), value.trim());
        }

        let field = |key: &str| {
            fields
                .get(key)
                .copied()
                .ok_or_else(|| EntrainError::InvalidAllocation(format!("missing {key}")))
        };

        let participant = ParticipantId::new(field("participant_id")?)?;
        let allocation = Allocation::new(
            Complexity::parse(field("complexity")?)?,
            Ear::parse(field("first_ear")?)?,
            SequenceOrder::parse(field("sequence_order")?)?,
        );
        Ok((participant, allocation))
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.condition_label())
    }
}

/// Cumulative per-cell allocation counts across all participants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceLedger {
    /// Keyed by condition label
    counts: BTreeMap<String, u64>,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, cell: &Allocation) -> u64 {
        self.counts.get(&cell.condition_label()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Difference between the fullest and emptiest cell
    pub fn spread(&self) -> u64 {
        let counts: Vec<u64> = Allocation::all_cells().iter().map(|c| self.count(c)).collect();
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        max - min
    }

    /// Cells holding the minimum count
    pub fn least_filled(&self) -> Vec<Allocation> {
        let cells = Allocation::all_cells();
        let min = cells.iter().map(|c| self.count(c)).min().unwrap_or(0);
        cells.into_iter().filter(|c| self.count(c) == min).collect()
    }

    /// Draw uniformly among the least-filled cells
    pub fn draw(&self, rng: &mut fastrand::Rng) -> Allocation {
        let candidates = self.least_filled();
        candidates[rng.usize(..candidates.len())]
    }

    pub fn record(&mut self, cell: &Allocation) {
        *self.counts.entry(cell.condition_label()).or_insert(0) += 1;
    }
}
