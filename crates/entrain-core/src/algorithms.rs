//! Onset alignment and timing statistics

use serde::{Deserialize, Serialize};

// ============================================================================
// Onset Alignment
// ============================================================================

/// Widest tap/beat distance still counted as a response to that beat
pub const ALIGNMENT_WINDOW_MS: f64 = 200.0;

/// One stimulus onset paired with its response, if any
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OnsetAlignment {
    pub stimulus_ms: f64,
    pub response_ms: Option<f64>,
    /// response - stimulus (negative = tap anticipated the beat)
    pub asynchrony_ms: Option<f64>,
}

/// Pair each stimulus onset with the nearest unused response onset
///
/// # Arguments
/// * `stimulus` - Stimulus onsets in ms, ascending
/// * `responses` - Detected response onsets in ms, ascending
/// * `window_ms` - Maximum |asynchrony| for a pairing
///
/// # Returns
/// One entry per stimulus onset, in stimulus order. A response is used at
/// most once; the window is narrowed to half the distance to the next or
/// previous beat so fast passages cannot steal a neighbour's tap.
pub fn align_onsets(stimulus: &[f64], responses: &[f64], window_ms: f64) -> Vec<OnsetAlignment> {
    let mut used = vec![false; responses.len()];

    stimulus
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let prev_gap = i.checked_sub(1).map(|p| s - stimulus[p]).unwrap_or(f64::INFINITY);
            let next_gap = stimulus.get(i + 1).map(|n| n - s).unwrap_or(f64::INFINITY);
            let limit = window_ms.min(prev_gap / 2.0).min(next_gap / 2.0);

            let best = responses
                .iter()
                .enumerate()
                .filter(|(j, r)| !used[*j] && (*r - s).abs() <= limit)
                .min_by(|(_, a), (_, b)| (*a - s).abs().total_cmp(&(*b - s).abs()))
                .map(|(j, r)| (j, *r));

            match best {
                Some((j, r)) => {
                    used[j] = true;
                    OnsetAlignment { stimulus_ms: s, response_ms: Some(r), asynchrony_ms: Some(r - s) }
                }
                None => OnsetAlignment { stimulus_ms: s, response_ms: None, asynchrony_ms: None },
            }
        })
        .collect()
}

// ============================================================================
// Statistics
// ============================================================================

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Mean inter-onset interval
pub fn mean_ioi(onsets: &[f64]) -> Option<f64> {
    let iois: Vec<f64> = onsets.windows(2).map(|w| w[1] - w[0]).collect();
    mean(&iois)
}

// ============================================================================
// Marker Matching
// ============================================================================

/// Outcome of matching detected marker beats against the schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerCheck {
    pub expected: usize,
    pub detected: usize,
    /// Largest |detected - expected| after latency compensation
    pub max_error_ms: Option<f64>,
    /// Constant capture latency estimated from the first marker
    pub latency_ms: Option<f64>,
}

impl MarkerCheck {
    pub fn detection_rate(&self) -> f64 {
        if self.expected == 0 {
            return 0.0;
        }
        self.detected as f64 / self.expected as f64
    }
}

/// Match expected markers against loopback onsets
///
/// The first detected onset is taken as the first marker; its offset from
/// the schedule is the capture latency that every other onset is shifted by.
pub fn match_markers(expected: &[f64], detected: &[f64], tolerance_ms: f64) -> MarkerCheck {
    let Some(&first) = detected.first() else {
        return MarkerCheck { expected: expected.len(), detected: 0, max_error_ms: None, latency_ms: None };
    };
    let latency = first - expected.first().copied().unwrap_or(0.0);

    let errors: Vec<f64> = expected
        .iter()
        .filter_map(|&e| {
            detected
                .iter()
                .map(|d| (d - latency - e).abs())
                .min_by(f64::total_cmp)
                .filter(|err| *err <= tolerance_ms)
        })
        .collect();

    MarkerCheck {
        expected: expected.len(),
        detected: errors.len(),
        max_error_ms: errors.iter().copied().max_by(f64::total_cmp),
        latency_ms: Some(latency),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_onsets() {
        let stim = [0.0, 500.0, 1000.0, 1500.0];
        let resp = [-20.0, 530.0, 1400.0, 1490.0, 3000.0];
        let aligned = align_onsets(&stim, &resp, ALIGNMENT_WINDOW_MS);

        assert_eq!(aligned.len(), 4);
        assert_eq!(aligned[0].asynchrony_ms, Some(-20.0));
        assert_eq!(aligned[1].asynchrony_ms, Some(30.0));
        assert_eq!(aligned[2].response_ms, None); // nearest tap at 1400 is out of window
        assert_eq!(aligned[3].response_ms, Some(1490.0));
    }

    #[test]
    fn test_align_uses_each_response_once() {
        // Fast passage: 130 ms IOI limits window to 65 ms
        let stim = [0.0, 130.0];
        let resp = [60.0];
        let aligned = align_onsets(&stim, &resp, ALIGNMENT_WINDOW_MS);
        assert_eq!(aligned[0].response_ms, Some(60.0));
        assert_eq!(aligned[1].response_ms, None);
    }

    #[test]
    fn test_stats() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 3.0]), Some(2.0));
        assert_eq!(std_dev(&[1.0, 3.0]), Some(1.0));
        assert_eq!(mean_ioi(&[0.0, 100.0, 300.0]), Some(150.0));
        assert_eq!(mean_ioi(&[5.0]), None);
    }

    #[test]
    fn test_match_markers_compensates_latency() {
        let expected = [0.0, 280.0, 510.0, 5000.0, 5280.0, 5510.0];
        let detected: Vec<f64> = expected.iter().map(|e| e + 40.0).chain([2000.0]).collect();
        let check = match_markers(&expected, &detected, 15.0);
        assert_eq!(check.detected, 6);
        assert_eq!(check.latency_ms, Some(40.0));
        assert_eq!(check.max_error_ms, Some(0.0));
        assert_eq!(check.detection_rate(), 1.0);

        let none = match_markers(&expected, &[], 15.0);
        assert_eq!(none.detected, 0);
        assert_eq!(none.detection_rate(), 0.0);
    }
}
