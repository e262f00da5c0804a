//! Bundled onset-detection collaborator

use std::error::Error;

use entrain_core::stimulus::{frames_to_ms, ms_to_frames};
use entrain_core::{align_onsets, match_markers, QualityCheck, TrialMetrics, TrialRecord, ALIGNMENT_WINDOW_MS};
use fundsp::hacker::*;
use tracing::debug;

use super::plot;
use super::{AnalysisCollaborator, CollaboratorInput, TrialAnalysis};

/// Marker/beat match tolerance on the loopback channel
const LOOPBACK_TOLERANCE_MS: f64 = 50.0;

/// Envelope onset detector settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetParams {
    pub highpass_hz: f32,
    pub smoothing_ms: f64,
    /// Refractory period after an onset
    pub min_distance_ms: f64,
    /// Fraction of the envelope maximum an onset must reach
    pub relative_threshold: f32,
    pub absolute_floor: f32,
}

impl OnsetParams {
    /// Taps and rendered beats
    pub const RHYTHM: Self = Self {
        highpass_hz: 30.0,
        smoothing_ms: 5.0,
        min_distance_ms: 100.0,
        relative_threshold: 0.3,
        absolute_floor: 0.01,
    };

    /// Single tap after the ear check tone
    pub const EAR_CHECK: Self = Self {
        highpass_hz: 30.0,
        smoothing_ms: 50.0,
        min_distance_ms: 50.0,
        relative_threshold: 0.0,
        absolute_floor: 0.01,
    };
}

/// High-pass, rectify and smooth into an amplitude envelope
pub fn envelope(signal: &[f32], sample_rate: u32, params: &OnsetParams) -> Vec<f32> {
    let mut filter = highpass_hz(params.highpass_hz, 0.707);
    filter.set_sample_rate(sample_rate as f64);

    let rectified: Vec<f32> = signal
        .iter()
        .map(|&s| filter.tick(&Frame::from([s]))[0].abs())
        .collect();

    let window = Ord::max(ms_to_frames(params.smoothing_ms, sample_rate), 1);
    let mut smoothed = Vec::with_capacity(rectified.len());
    let mut acc = 0.0f32;
    for (i, &v) in rectified.iter().enumerate() {
        acc += v;
        if i >= window {
            acc -= rectified[i - window];
        }
        smoothed.push(acc.max(0.0) / window as f32);
    }
    smoothed
}

/// Rising-edge onsets of the envelope, in ms from the start of `signal`
pub fn detect_onsets(signal: &[f32], sample_rate: u32, params: &OnsetParams) -> Vec<f64> {
    let env = envelope(signal, sample_rate, params);
    let max = env.iter().copied().fold(0.0f32, f32::max);
    let threshold = (max * params.relative_threshold).max(params.absolute_floor);
    let refractory = ms_to_frames(params.min_distance_ms, sample_rate);

    let mut onsets = Vec::new();
    let mut armed = true;
    let mut last: Option<usize> = None;
    for (i, &v) in env.iter().enumerate() {
        if v < threshold {
            armed = true;
            continue;
        }
        let clear = last.is_none_or(|l| i - l >= refractory);
        if armed && clear {
            onsets.push(frames_to_ms(i, sample_rate));
            last = Some(i);
        }
        armed = false;
    }
    onsets
}

/// True when a tap shows up in the first 3 s of an ear check recording
pub fn detect_tap(mic: &[f32], sample_rate: u32) -> bool {
    detect_onsets(mic, sample_rate, &OnsetParams::EAR_CHECK)
        .iter()
        .any(|&t| (0.0..3000.0).contains(&t))
}

/// Default collaborator: envelope onsets on both channels, marker-based
/// latency compensation, nearest-beat alignment.
#[derive(Debug, Clone)]
pub struct OnsetAnalyzer {
    pub params: OnsetParams,
    pub alignment_window_ms: f64,
}

impl Default for OnsetAnalyzer {
    fn default() -> Self {
        Self { params: OnsetParams::RHYTHM, alignment_window_ms: ALIGNMENT_WINDOW_MS }
    }
}

impl AnalysisCollaborator for OnsetAnalyzer {
    fn name(&self) -> &str {
        "onset-analyzer"
    }

    fn analyze(&self, input: &CollaboratorInput<'_>) -> Result<TrialAnalysis, Box<dyn Error + Send + Sync>> {
        let schedule = input.schedule;
        let sr = input.sample_rate;

        let loopback_onsets = detect_onsets(&input.capture.loopback, sr, &self.params);
        let markers = match_markers(&schedule.marker_onsets_ms, &loopback_onsets, LOOPBACK_TOLERANCE_MS);
        let latency = markers.latency_ms.unwrap_or(0.0);

        let (Some(&first), Some(&last)) = (schedule.onsets_ms.first(), schedule.onsets_ms.last()) else {
            return Err(format!("stimulus {} has no onsets", schedule.rhythm).into());
        };
        let span = (first - self.alignment_window_ms)..=(last + self.alignment_window_ms);

        let stim_onsets_detected_ms: Vec<f64> = loopback_onsets
            .iter()
            .map(|t| t - latency)
            .filter(|t| span.contains(t))
            .collect();
        let detected_stimuli = schedule
            .onsets_ms
            .iter()
            .filter(|s| stim_onsets_detected_ms.iter().any(|d| (d - *s).abs() <= LOOPBACK_TOLERANCE_MS))
            .count();

        let resp_onsets_ms: Vec<f64> = detect_onsets(&input.capture.mic, sr, &self.params)
            .into_iter()
            .map(|t| t - latency)
            .filter(|t| span.contains(t))
            .collect();

        let alignment = align_onsets(&schedule.onsets_ms, &resp_onsets_ms, self.alignment_window_ms);
        let metrics = TrialMetrics::compute(&schedule.onsets_ms, detected_stimuli, &resp_onsets_ms, &alignment);

        let quality = if markers.detected < markers.expected {
            QualityCheck::failed(format!("markers missing: {} of {} detected", markers.detected, markers.expected))
        } else if resp_onsets_ms.is_empty() {
            QualityCheck::failed("no taps detected")
        } else {
            QualityCheck::ok()
        };

        debug!(
            trial = input.label,
            latency_ms = latency,
            responses = resp_onsets_ms.len(),
            markers = markers.detected,
            "Onset analysis done"
        );

        let record = TrialRecord {
            stim_onsets_ms: schedule.onsets_ms.clone(),
            stim_onsets_detected_ms,
            resp_onsets_ms,
            alignment,
            markers,
            metrics,
            quality,
        };
        let plot_png = plot::render_trial_plot(&record, schedule.duration_ms)?;
        Ok(TrialAnalysis { record, plot_png })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::RawCapture;
    use entrain_core::{Complexity, RhythmId, StimulusSchedule};

    const SR: u32 = 8000;

    /// Loopback = rendered stimulus, mic = short clicks `tap_delay_ms` after each beat
    pub fn synthetic_capture(schedule: &StimulusSchedule, tap_delay_ms: f64, taps: bool) -> RawCapture {
        let frames = schedule.trial_frames();
        let mut loopback = schedule.render();
        loopback.resize(frames, 0.0);
        let mut mic = vec![0.0f32; frames];
        if taps {
            for &t in &schedule.onsets_ms {
                let start = ms_to_frames(t + tap_delay_ms, schedule.sample_rate);
                for (i, s) in mic.iter_mut().skip(start).take(40).enumerate() {
                    *s = if i % 2 == 0 { 0.8 } else { -0.8 };
                }
            }
        }
        RawCapture { mic, loopback, sample_rate: schedule.sample_rate, lead_in_frames: 0 }
    }

    #[test]
    fn test_detect_onsets_on_clicks() {
        let mut signal = vec![0.0f32; 8000];
        for start in [800usize, 2400, 2500] {
            for (i, s) in signal.iter_mut().skip(start).take(40).enumerate() {
                *s = if i % 2 == 0 { 0.5 } else { -0.5 };
            }
        }
        let onsets = detect_onsets(&signal, SR, &OnsetParams::RHYTHM);
        // 2500 falls inside the refractory period of 2400
        assert_eq!(onsets.len(), 2);
        assert!((onsets[0] - 100.0).abs() < 5.0);
        assert!((onsets[1] - 300.0).abs() < 5.0);
    }

    #[test]
    fn test_detect_tap() {
        let silent = vec![0.0f32; 3 * SR as usize];
        assert!(!detect_tap(&silent, SR));

        let mut tapped = silent.clone();
        for (i, s) in tapped.iter_mut().skip(SR as usize).take(80).enumerate() {
            *s = if i % 2 == 0 { 0.6 } else { -0.6 };
        }
        assert!(detect_tap(&tapped, SR));
    }

    #[test]
    fn test_analyzer_finds_every_tap() {
        let rhythm = RhythmId { complexity: Complexity::Complex, index: 1 };
        let schedule = StimulusSchedule::new(rhythm, SR, 1000.0);
        let capture = synthetic_capture(&schedule, 20.0, true);
        let input = CollaboratorInput { capture: &capture, schedule: &schedule, sample_rate: SR, label: "test" };

        let analysis = OnsetAnalyzer::default().analyze(&input).unwrap();
        let record = &analysis.record;
        assert_eq!(record.markers.detected, 6);
        assert_eq!(record.metrics.total_responses, schedule.onsets_ms.len());
        assert_eq!(record.metrics.aligned_responses, schedule.onsets_ms.len());
        assert_eq!(record.metrics.detected_stimuli, schedule.onsets_ms.len());
        let mean = record.metrics.mean_asynchrony_ms.unwrap();
        assert!((5.0..35.0).contains(&mean), "mean asynchrony {mean}");
        assert!(!record.quality.failed);
        assert!(analysis.plot_png.starts_with(&super::super::PNG_SIGNATURE));
    }

    #[test]
    fn test_no_taps_flags_quality() {
        let rhythm = RhythmId { complexity: Complexity::Simple, index: 2 };
        let schedule = StimulusSchedule::new(rhythm, SR, 500.0);
        let capture = synthetic_capture(&schedule, 0.0, false);
        let input = CollaboratorInput { capture: &capture, schedule: &schedule, sample_rate: SR, label: "test" };

        let record = OnsetAnalyzer::default().analyze(&input).unwrap().record;
        assert!(record.resp_onsets_ms.is_empty());
        assert!(record.quality.failed);
        assert_eq!(record.metrics.percent_bad_taps, None);
    }
}
