//! Stimulus/capture coordination for one trial

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use entrain_core::stimulus::{ear_check_tone, frames_to_ms};
use entrain_core::{Ear, StimulusSchedule, TrialDescriptor};
use thiserror::Error;
use tracing::{debug, info};

use crate::audio_io::{DuplexDevice, DuplexRecording};

/// Device faults during a trial. Any of these fails the trial only.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Input buffer overrun")]
    Overrun,
    #[error("Capture started {late_ms:.1} ms after playback")]
    LateCapture { late_ms: f64 },
    #[error("Capture stream never delivered audio")]
    NotArmed,
    #[error("Capture did not finish in time")]
    Timeout,
    #[error("Capture aborted by operator")]
    Aborted,
    #[error("Input channel {0} missing from capture")]
    ChannelMissing(usize),
    #[error("Capture ran at {actual} Hz, expected {expected} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },
}

impl CaptureError {
    pub fn from_stream_error(err: cpal::StreamError) -> Self {
        match err {
            cpal::StreamError::DeviceNotAvailable => Self::DeviceUnavailable("device no longer available".into()),
            cpal::StreamError::BackendSpecific { err } => Self::Stream(err.description),
        }
    }
}

/// Input channel layout of the duplex device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    pub mic: usize,
    pub loopback_left: usize,
    pub loopback_right: usize,
}

impl ChannelMap {
    pub fn loopback(&self, ear: Ear) -> usize {
        match ear {
            Ear::Left => self.loopback_left,
            Ear::Right => self.loopback_right,
        }
    }

    pub fn max_channel(&self) -> usize {
        self.mic.max(self.loopback_left).max(self.loopback_right)
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self { mic: 0, loopback_left: 1, loopback_right: 2 }
    }
}

/// Trial capture aligned to playback start (frame 0 = first stimulus frame)
#[derive(Debug, Clone)]
pub struct RawCapture {
    /// Participant microphone
    pub mic: Vec<f32>,
    /// Loopback of the stimulus as presented in the trial's ear
    pub loopback: Vec<f32>,
    pub sample_rate: u32,
    /// Frames recorded before playback started, already trimmed off
    pub lead_in_frames: usize,
}

impl RawCapture {
    pub fn duration_ms(&self) -> f64 {
        frames_to_ms(self.mic.len(), self.sample_rate)
    }

    /// Mono mix saved as the trial recording
    pub fn combined(&self) -> Vec<f32> {
        let mic = normalize(&self.mic);
        let loopback = normalize(&self.loopback);
        let sum: Vec<f32> = mic.iter().zip(&loopback).map(|(a, b)| a + b).collect();
        normalize(&sum)
    }
}

/// Scale to unit peak; silence is returned unchanged
pub fn normalize(samples: &[f32]) -> Vec<f32> {
    let peak = peak(samples);
    if peak <= f32::EPSILON {
        return samples.to_vec();
    }
    samples.iter().map(|s| s / peak).collect()
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Drives one trial at a time on an exclusively held device.
pub struct CaptureCoordinator<D: DuplexDevice> {
    device: D,
    channels: ChannelMap,
    abort: Arc<AtomicBool>,
}

impl<D: DuplexDevice> CaptureCoordinator<D> {
    pub fn new(device: D, channels: ChannelMap, abort: Arc<AtomicBool>) -> Self {
        Self { device, channels, abort }
    }

    pub fn sample_rate(&self) -> u32 {
        self.device.sample_rate()
    }

    /// Play the trial's stimulus in its ear and record for the full trial
    /// duration (stimulus plus response window).
    pub fn run_trial(
        &mut self,
        trial: &TrialDescriptor,
        schedule: &StimulusSchedule,
    ) -> Result<RawCapture, CaptureError> {
        if schedule.sample_rate != self.device.sample_rate() {
            return Err(CaptureError::SampleRateMismatch {
                expected: schedule.sample_rate,
                actual: self.device.sample_rate(),
            });
        }

        let playback = schedule.render_stereo(trial.ear);
        let frames = schedule.trial_frames();
        debug!(%trial, frames, "Starting duplex capture");

        let recording = self.device.play_and_record(&playback, frames, &self.abort)?;
        let capture = self.split(&recording, trial.ear, frames)?;

        info!(
            %trial,
            duration_ms = capture.duration_ms(),
            lead_in_frames = capture.lead_in_frames,
            "Trial captured"
        );
        Ok(capture)
    }

    /// Listen-only presentation of the trial's stimulus
    pub fn present(&mut self, trial: &TrialDescriptor, schedule: &StimulusSchedule) -> Result<(), CaptureError> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(CaptureError::Aborted);
        }
        self.device.play(&schedule.render_stereo(trial.ear), &self.abort)?;
        debug!(%trial, "Stimulus presented");
        Ok(())
    }

    /// Play the check tone in `ear` and return the microphone recording
    pub fn ear_check(&mut self, ear: Ear) -> Result<Vec<f32>, CaptureError> {
        let tone = ear_check_tone(self.device.sample_rate(), ear);
        let frames = tone.len() / 2;
        let recording = self.device.play_and_record(&tone, frames, &self.abort)?;
        let mic = recording.channel(self.channels.mic).ok_or(CaptureError::ChannelMissing(self.channels.mic))?;
        Ok(trim(mic, recording.lead_in_frames, frames))
    }

    fn split(&self, recording: &DuplexRecording, ear: Ear, frames: usize) -> Result<RawCapture, CaptureError> {
        if recording.sample_rate != self.device.sample_rate() {
            return Err(CaptureError::SampleRateMismatch {
                expected: self.device.sample_rate(),
                actual: recording.sample_rate,
            });
        }
        let loopback_channel = self.channels.loopback(ear);
        let mic = recording.channel(self.channels.mic).ok_or(CaptureError::ChannelMissing(self.channels.mic))?;
        let loopback = recording
            .channel(loopback_channel)
            .ok_or(CaptureError::ChannelMissing(loopback_channel))?;

        Ok(RawCapture {
            mic: trim(mic, recording.lead_in_frames, frames),
            loopback: trim(loopback, recording.lead_in_frames, frames),
            sample_rate: recording.sample_rate,
            lead_in_frames: recording.lead_in_frames,
        })
    }
}

fn trim(mut samples: Vec<f32>, lead_in: usize, frames: usize) -> Vec<f32> {
    samples.drain(..lead_in.min(samples.len()));
    samples.truncate(frames);
    samples
}
