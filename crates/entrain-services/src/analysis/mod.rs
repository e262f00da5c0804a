//! Analysis bridge: shapes a trial capture for the analysis collaborator and
//! vets what comes back.

pub mod onsets;
pub mod plot;

use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};

use entrain_core::{StimulusSchedule, TrialRecord};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capture::{peak, RawCapture};

pub use onsets::{detect_tap, OnsetAnalyzer, OnsetParams};

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Microphone peak below which a trial counts as silent
const SILENCE_FLOOR: f32 = 0.05;

/// What the collaborator sees of a trial
#[derive(Debug, Clone, Copy)]
pub struct CollaboratorInput<'a> {
    pub capture: &'a RawCapture,
    pub schedule: &'a StimulusSchedule,
    pub sample_rate: u32,
    /// Trial identity for the collaborator's own logging
    pub label: &'a str,
}

/// What the collaborator hands back
#[derive(Debug, Clone)]
pub struct TrialAnalysis {
    pub record: TrialRecord,
    pub plot_png: Vec<u8>,
}

/// External onset-detection/alignment component.
///
/// Any error it returns, and any panic it raises, is treated as opaque.
pub trait AnalysisCollaborator: Send {
    fn name(&self) -> &str;
    fn analyze(&self, input: &CollaboratorInput<'_>) -> Result<TrialAnalysis, Box<dyn StdError + Send + Sync>>;
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Collaborator rejected the trial: {0}")]
    Rejected(String),
    #[error("Collaborator panicked")]
    Panicked,
    #[error("Malformed analysis result: {0}")]
    Malformed(String),
}

/// Single adapter around the collaborator bound at startup
pub struct AnalysisBridge {
    collaborator: Box<dyn AnalysisCollaborator>,
}

impl AnalysisBridge {
    pub fn new(collaborator: Box<dyn AnalysisCollaborator>) -> Self {
        Self { collaborator }
    }

    pub fn analyze(
        &self,
        capture: &RawCapture,
        schedule: &StimulusSchedule,
        label: &str,
    ) -> Result<TrialAnalysis, AnalysisError> {
        let input = CollaboratorInput { capture, schedule, sample_rate: capture.sample_rate, label };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.collaborator.analyze(&input)));
        let analysis = match outcome {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => {
                warn!(trial = label, error = %e, "Collaborator returned an error");
                return Err(AnalysisError::Rejected(e.to_string()));
            }
            Err(_) => {
                warn!(trial = label, "Collaborator panicked");
                return Err(AnalysisError::Panicked);
            }
        };

        validate(&analysis, capture, schedule)?;
        debug!(trial = label, collaborator = self.collaborator.name(), "Analysis accepted");
        Ok(analysis)
    }
}

/// Shape checks on a collaborator result
fn validate(analysis: &TrialAnalysis, capture: &RawCapture, schedule: &StimulusSchedule) -> Result<(), AnalysisError> {
    let record = &analysis.record;

    if let Some(field) = record.metrics.non_finite_field() {
        return Err(AnalysisError::Malformed(format!("{field} is not finite")));
    }
    if record.numeric_values().any(|v| !v.is_finite()) {
        return Err(AnalysisError::Malformed("onset data contains non-finite values".into()));
    }
    if record.alignment.len() != schedule.onsets_ms.len() {
        return Err(AnalysisError::Malformed(format!(
            "alignment has {} entries for {} stimulus onsets",
            record.alignment.len(),
            schedule.onsets_ms.len()
        )));
    }
    if schedule.response_window_ms > 0.0 && peak(&capture.mic) >= SILENCE_FLOOR && record.resp_onsets_ms.is_empty() {
        return Err(AnalysisError::Malformed("no response onsets for a non-silent capture".into()));
    }
    if !analysis.plot_png.starts_with(&PNG_SIGNATURE) {
        return Err(AnalysisError::Malformed("plot is not a PNG image".into()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use entrain_core::{align_onsets, Complexity, MarkerCheck, QualityCheck, RhythmId, TrialMetrics};

    /// Collaborator that echoes the schedule back as perfectly tapped
    pub struct FakeCollaborator {
        pub panic_on_label: Option<String>,
        pub reject_on_label: Option<String>,
        pub mean_override: Option<f64>,
    }

    impl FakeCollaborator {
        pub fn new() -> Self {
            Self { panic_on_label: None, reject_on_label: None, mean_override: None }
        }
    }

    impl AnalysisCollaborator for FakeCollaborator {
        fn name(&self) -> &str {
            "fake"
        }

        fn analyze(&self, input: &CollaboratorInput<'_>) -> Result<TrialAnalysis, Box<dyn StdError + Send + Sync>> {
            if self.panic_on_label.as_deref() == Some(input.label) {
                panic!("collaborator blew up");
            }
            if self.reject_on_label.as_deref() == Some(input.label) {
                return Err("model file /opt/tapper/weights.bin unreadable".into());
            }
            let stim = input.schedule.onsets_ms.clone();
            let resp: Vec<f64> = stim.iter().map(|t| t + 10.0).collect();
            let alignment = align_onsets(&stim, &resp, 200.0);
            let mut metrics = TrialMetrics::compute(&stim, stim.len(), &resp, &alignment);
            if let Some(m) = self.mean_override {
                metrics.mean_asynchrony_ms = Some(m);
            }
            Ok(TrialAnalysis {
                record: TrialRecord {
                    stim_onsets_detected_ms: stim.clone(),
                    stim_onsets_ms: stim,
                    resp_onsets_ms: resp,
                    alignment,
                    markers: MarkerCheck { expected: 6, detected: 6, max_error_ms: Some(0.0), latency_ms: Some(0.0) },
                    metrics,
                    quality: QualityCheck::ok(),
                },
                plot_png: PNG_SIGNATURE.to_vec(),
            })
        }
    }

    struct Failing;

    impl AnalysisCollaborator for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn analyze(&self, _: &CollaboratorInput<'_>) -> Result<TrialAnalysis, Box<dyn StdError + Send + Sync>> {
            Err("onset detector could not converge".into())
        }
    }

    fn fixture() -> (RawCapture, StimulusSchedule) {
        let schedule = StimulusSchedule::new(RhythmId { complexity: Complexity::Simple, index: 1 }, 8000, 1000.0);
        let capture = RawCapture {
            mic: vec![0.0; schedule.trial_frames()],
            loopback: schedule.render(),
            sample_rate: 8000,
            lead_in_frames: 0,
        };
        (capture, schedule)
    }

    #[test]
    fn test_accepts_well_formed_result() {
        let (capture, schedule) = fixture();
        let bridge = AnalysisBridge::new(Box::new(FakeCollaborator::new()));
        let analysis = bridge.analyze(&capture, &schedule, "stimulus_1/trial_1").unwrap();
        assert_eq!(analysis.record.alignment.len(), schedule.onsets_ms.len());
    }

    #[test]
    fn test_collaborator_error_is_rejected() {
        let (capture, schedule) = fixture();
        let bridge = AnalysisBridge::new(Box::new(Failing));
        assert!(matches!(bridge.analyze(&capture, &schedule, "t"), Err(AnalysisError::Rejected(_))));
    }

    #[test]
    fn test_panic_is_contained() {
        let (capture, schedule) = fixture();
        let fake = FakeCollaborator { panic_on_label: Some("boom".into()), ..FakeCollaborator::new() };
        let bridge = AnalysisBridge::new(Box::new(fake));
        assert!(matches!(bridge.analyze(&capture, &schedule, "boom"), Err(AnalysisError::Panicked)));
        assert!(bridge.analyze(&capture, &schedule, "fine").is_ok());
    }

    #[test]
    fn test_non_finite_metric_is_malformed() {
        let (capture, schedule) = fixture();
        let fake = FakeCollaborator { mean_override: Some(f64::NAN), ..FakeCollaborator::new() };
        let bridge = AnalysisBridge::new(Box::new(fake));
        let err = bridge.analyze(&capture, &schedule, "t").unwrap_err();
        assert!(matches!(err, AnalysisError::Malformed(ref m) if m.contains("mean_asynchrony_ms")));
    }

    #[test]
    fn test_loud_capture_without_onsets_is_malformed() {
        let (mut capture, schedule) = fixture();
        capture.mic[100] = 0.9;
        let analyzer = OnsetAnalyzer { params: OnsetParams { absolute_floor: 10.0, ..OnsetParams::RHYTHM }, alignment_window_ms: 200.0 };
        let bridge = AnalysisBridge::new(Box::new(analyzer));
        assert!(matches!(bridge.analyze(&capture, &schedule, "t"), Err(AnalysisError::Malformed(_))));
    }
}
