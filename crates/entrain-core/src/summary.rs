//! Participant summary rows (`participant_analysis.csv`)

use crate::allocation::Allocation;
use crate::participant::ParticipantId;
use crate::record::TrialRecord;
use crate::sequencer::TrialDescriptor;

pub const SUMMARY_COLUMNS: &[&str] = &[
    "participant_id",
    "allocation",
    "stimulus_number",
    "rhythm",
    "ear",
    "phase",
    "trial_number",
    "trial_failed",
    "failure_reason",
    "total_stimuli",
    "detected_stimuli",
    "total_responses",
    "aligned_responses",
    "mean_asynchrony",
    "sd_asynchrony",
    "percent_responses",
    "percent_responses_aligned",
    "mean_stimulus_ioi",
    "mean_response_ioi",
    "num_markers",
    "detected_markers",
    "marker_detection_rate",
    "max_marker_error",
    "percent_bad_taps",
];

/// One CSV row, already rendered to cell text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    cells: Vec<String>,
}

impl SummaryRow {
    pub fn new(
        participant: &ParticipantId,
        allocation: &Allocation,
        trial: &TrialDescriptor,
        record: &TrialRecord,
    ) -> Self {
        let m = &record.metrics;
        let stimulus_number = trial.trial_id().map(|id| id.stimulus).unwrap_or(trial.slot.number());
        let trial_number = trial.trial_id().map(|id| id.trial).unwrap_or(trial.trial_number());

        let cells = vec![
            participant.to_string(),
            allocation.condition_label(),
            stimulus_number.to_string(),
            trial.rhythm.to_string(),
            trial.ear.to_string(),
            trial.phase.to_string(),
            trial_number.to_string(),
            record.quality.failed.to_string(),
            record.quality.reason.clone(),
            m.total_stimuli.to_string(),
            m.detected_stimuli.to_string(),
            m.total_responses.to_string(),
            m.aligned_responses.to_string(),
            opt(m.mean_asynchrony_ms),
            opt(m.sd_asynchrony_ms),
            num(m.percent_responses),
            num(m.percent_responses_aligned),
            opt(m.mean_stimulus_ioi_ms),
            opt(m.mean_response_ioi_ms),
            record.markers.expected.to_string(),
            record.markers.detected.to_string(),
            num(record.markers.detection_rate()),
            opt(record.markers.max_error_ms),
            opt(m.percent_bad_taps),
        ];
        Self { cells }
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn header_line() -> String {
        let mut line = SUMMARY_COLUMNS.join(",");
        line.push('\n');
        line
    }

    pub fn to_csv_line(&self) -> String {
        let mut line = self.cells.iter().map(|c| escape(c)).collect::<Vec<_>>().join(",");
        line.push('\n');
        line
    }
}

fn num(v: f64) -> String {
    format!("{v:.3}")
}

/// Undefined metrics are written as empty cells
fn opt(v: Option<f64>) -> String {
    v.map(num).unwrap_or_default()
}

fn escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
