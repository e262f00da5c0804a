//! Per-trial analysis record and derived metrics

use serde::{Deserialize, Serialize};

use crate::algorithms::{self, MarkerCheck, OnsetAlignment};

/// Analysis-side verdict on capture quality.
///
/// A failed quality check still yields a persisted trial; it only flags
/// the row in the summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub failed: bool,
    pub reason: String,
}

impl QualityCheck {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { failed: true, reason: reason.into() }
    }
}

/// Accuracy and alignment metrics of one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMetrics {
    pub total_stimuli: usize,
    pub detected_stimuli: usize,
    pub total_responses: usize,
    pub aligned_responses: usize,
    pub mean_asynchrony_ms: Option<f64>,
    pub sd_asynchrony_ms: Option<f64>,
    /// Responses per stimulus onset, in percent
    pub percent_responses: f64,
    /// Stimulus onsets that received an aligned response, in percent
    pub percent_responses_aligned: f64,
    pub mean_stimulus_ioi_ms: Option<f64>,
    pub mean_response_ioi_ms: Option<f64>,
    /// Responses that could not be aligned to any beat, in percent
    pub percent_bad_taps: Option<f64>,
}

impl TrialMetrics {
    pub fn compute(
        stimulus_onsets: &[f64],
        detected_stimuli: usize,
        response_onsets: &[f64],
        alignment: &[OnsetAlignment],
    ) -> Self {
        let asynchronies: Vec<f64> = alignment.iter().filter_map(|a| a.asynchrony_ms).collect();
        let aligned_responses = asynchronies.len();
        let total_stimuli = stimulus_onsets.len();
        let total_responses = response_onsets.len();

        let percent = |num: usize, den: usize| {
            if den == 0 { 0.0 } else { 100.0 * num as f64 / den as f64 }
        };

        Self {
            total_stimuli,
            detected_stimuli,
            total_responses,
            aligned_responses,
            mean_asynchrony_ms: algorithms::mean(&asynchronies),
            sd_asynchrony_ms: algorithms::std_dev(&asynchronies),
            percent_responses: percent(total_responses, total_stimuli),
            percent_responses_aligned: percent(aligned_responses, total_stimuli),
            mean_stimulus_ioi_ms: algorithms::mean_ioi(stimulus_onsets),
            mean_response_ioi_ms: algorithms::mean_ioi(response_onsets),
            percent_bad_taps: (total_responses > 0)
                .then(|| percent(total_responses.saturating_sub(aligned_responses), total_responses)),
        }
    }

    /// Name of the first numeric field that is NaN or infinite
    pub fn non_finite_field(&self) -> Option<&'static str> {
        let fields = [
            ("mean_asynchrony_ms", self.mean_asynchrony_ms),
            ("sd_asynchrony_ms", self.sd_asynchrony_ms),
            ("percent_responses", Some(self.percent_responses)),
            ("percent_responses_aligned", Some(self.percent_responses_aligned)),
            ("mean_stimulus_ioi_ms", self.mean_stimulus_ioi_ms),
            ("mean_response_ioi_ms", self.mean_response_ioi_ms),
            ("percent_bad_taps", self.percent_bad_taps),
        ];
        fields
            .into_iter()
            .find(|(_, v)| v.is_some_and(|v| !v.is_finite()))
            .map(|(name, _)| name)
    }
}

/// Full numeric record of an analyzed trial (`numerical_data_trial_<Y>.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Scheduled rhythm onsets
    pub stim_onsets_ms: Vec<f64>,
    /// Rhythm onsets found on the loopback channel, latency-compensated
    pub stim_onsets_detected_ms: Vec<f64>,
    /// Tap onsets found on the microphone channel, latency-compensated
    pub resp_onsets_ms: Vec<f64>,
    pub alignment: Vec<OnsetAlignment>,
    pub markers: MarkerCheck,
    pub metrics: TrialMetrics,
    pub quality: QualityCheck,
}

impl TrialRecord {
    /// Every numeric value the record carries, for finiteness checks
    pub fn numeric_values(&self) -> impl Iterator<Item = f64> + '_ {
        let alignment = self.alignment.iter().flat_map(|a| {
            [Some(a.stimulus_ms), a.response_ms, a.asynchrony_ms].into_iter().flatten()
        });
        let markers = [self.markers.max_error_ms, self.markers.latency_ms].into_iter().flatten();
        self.stim_onsets_ms
            .iter()
            .chain(&self.stim_onsets_detected_ms)
            .chain(&self.resp_onsets_ms)
            .copied()
            .chain(alignment)
            .chain(markers)
    }
}
