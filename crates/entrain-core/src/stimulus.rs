//! Rhythm catalogue and stimulus schedules

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::allocation::{Complexity, Ear};

/// Default capture/playback sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Marker beats at the start of every stimulus (ms, relative)
pub const MARKER_ONSETS_MS: [f64; 3] = [0.0, 280.0, 510.0];
/// Silence between the marker group and the rhythm
pub const MARKER_GAP_MS: f64 = 1000.0;
/// Length of one rendered beat
pub const BEAT_LENGTH_MS: f64 = 50.0;

const MARKER_FREQ_HZ: f64 = 1200.0;
const MARKER_GAIN: f64 = 0.9;
const BEAT_FREQ_HZ: f64 = 800.0;
const BEAT_GAIN: f64 = 0.7;
const ATTACK_MS: f64 = 5.0;

const SIMPLE_1: &[f64] = &[0.0, 520.0, 520.0, 520.0, 260.0, 260.0, 520.0, 520.0];
const SIMPLE_2: &[f64] = &[0.0, 520.0, 260.0, 260.0, 520.0, 260.0, 260.0, 520.0, 520.0];
const COMPLEX_1: &[f64] = &[0.0, 130.0, 260.0, 390.0, 260.0, 130.0, 260.0, 390.0, 260.0];
const COMPLEX_2: &[f64] = &[0.0, 390.0, 130.0, 260.0, 520.0, 260.0, 130.0, 390.0];

/// One of the two rhythms of a complexity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RhythmId {
    pub complexity: Complexity,
    /// 1 or 2
    pub index: u8,
}

impl RhythmId {
    /// Inter-onset intervals in ms; the leading 0 places the first beat at t=0
    pub fn iois(&self) -> &'static [f64] {
        match (self.complexity, self.index) {
            (Complexity::Simple, 1) => SIMPLE_1,
            (Complexity::Simple, _) => SIMPLE_2,
            (Complexity::Complex, 1) => COMPLEX_1,
            (Complexity::Complex, _) => COMPLEX_2,
        }
    }
}

impl fmt::Display for RhythmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.complexity.as_str(), self.index)
    }
}

/// Cumulative sum of inter-onset intervals
pub fn onsets_from_ioi(iois: &[f64]) -> Vec<f64> {
    iois.iter()
        .scan(0.0, |t, ioi| {
            *t += ioi;
            Some(*t)
        })
        .collect()
}

/// Onset timeline of one stimulus presentation, all times in ms from playback start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusSchedule {
    pub rhythm: RhythmId,
    /// Rhythm beats the participant taps along with
    pub onsets_ms: Vec<f64>,
    /// Start and end marker beats (3 each)
    pub marker_onsets_ms: Vec<f64>,
    /// Playback length
    pub duration_ms: f64,
    /// Recording continues this long after playback ends
    pub response_window_ms: f64,
    pub sample_rate: u32,
}

impl StimulusSchedule {
    pub fn new(rhythm: RhythmId, sample_rate: u32, response_window_ms: f64) -> Self {
        let rhythm_start = MARKER_ONSETS_MS[2] + MARKER_GAP_MS;
        let onsets_ms: Vec<f64> = onsets_from_ioi(rhythm.iois())
            .into_iter()
            .map(|t| t + rhythm_start)
            .collect();
        let last_beat = onsets_ms.last().copied().unwrap_or(rhythm_start);
        let end_start = last_beat + MARKER_GAP_MS;

        let mut marker_onsets_ms: Vec<f64> = MARKER_ONSETS_MS.to_vec();
        marker_onsets_ms.extend(MARKER_ONSETS_MS.iter().map(|t| t + end_start));

        let duration_ms = end_start + MARKER_ONSETS_MS[2] + BEAT_LENGTH_MS;

        Self {
            rhythm,
            onsets_ms,
            marker_onsets_ms,
            duration_ms,
            response_window_ms: response_window_ms.max(0.0),
            sample_rate,
        }
    }

    /// Deterministic trial length: stimulus plus response window
    pub fn trial_duration_ms(&self) -> f64 {
        self.duration_ms + self.response_window_ms
    }

    pub fn playback_frames(&self) -> usize {
        ms_to_frames(self.duration_ms, self.sample_rate)
    }

    pub fn trial_frames(&self) -> usize {
        ms_to_frames(self.trial_duration_ms(), self.sample_rate)
    }

    /// Render the mono stimulus waveform
    pub fn render(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.playback_frames()];
        for &t in &self.marker_onsets_ms {
            add_burst(&mut out, t, MARKER_FREQ_HZ, MARKER_GAIN, self.sample_rate);
        }
        for &t in &self.onsets_ms {
            add_burst(&mut out, t, BEAT_FREQ_HZ, BEAT_GAIN, self.sample_rate);
        }
        out
    }

    /// Render interleaved stereo with the stimulus only in `ear`
    pub fn render_stereo(&self, ear: Ear) -> Vec<f32> {
        place_in_ear(&self.render(), ear)
    }
}

/// Spread a mono signal into interleaved stereo, silent on the other side
pub fn place_in_ear(mono: &[f32], ear: Ear) -> Vec<f32> {
    let mut stereo = vec![0.0f32; mono.len() * 2];
    for (frame, &s) in stereo.chunks_exact_mut(2).zip(mono) {
        frame[ear.channel()] = s;
    }
    stereo
}

/// Headphone check tone: 0.75 s silence, 1.5 s of 440 Hz, 0.75 s silence
pub fn ear_check_tone(sample_rate: u32, ear: Ear) -> Vec<f32> {
    let pad = ms_to_frames(750.0, sample_rate);
    let tone_len = ms_to_frames(1500.0, sample_rate);
    let mut mono = vec![0.0f32; pad * 2 + tone_len];
    for i in 0..tone_len {
        let t = i as f64 / sample_rate as f64;
        mono[pad + i] = (2.0 * PI * 440.0 * t).sin() as f32;
    }
    place_in_ear(&mono, ear)
}

pub fn ms_to_frames(ms: f64, sample_rate: u32) -> usize {
    (ms * sample_rate as f64 / 1000.0).round() as usize
}

pub fn frames_to_ms(frames: usize, sample_rate: u32) -> f64 {
    frames as f64 * 1000.0 / sample_rate as f64
}

fn add_burst(out: &mut [f32], onset_ms: f64, freq: f64, gain: f64, sample_rate: u32) {
    let start = ms_to_frames(onset_ms, sample_rate);
    let len = ms_to_frames(BEAT_LENGTH_MS, sample_rate);
    let attack = ms_to_frames(ATTACK_MS, sample_rate).max(1);
    let decay = len as f64 / 5.0;

    for i in 0..len {
        let Some(slot) = out.get_mut(start + i) else { break };
        let t = i as f64 / sample_rate as f64;
        let env = if i < attack {
            i as f64 / attack as f64
        } else {
            (-((i - attack) as f64) / decay).exp()
        };
        *slot += (gain * env * (2.0 * PI * freq * t).sin()) as f32;
    }
}
