//! Duplex audio I/O: the experiment's input/output device pair

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SupportedStreamConfig};
use crossbeam_channel::{bounded, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, info};

use crate::audio_input::AudioInputService;
use crate::capture::CaptureError;

/// Input chunks buffered between the device callback and the collector
const CHUNK_QUEUE: usize = 512;
/// How long to wait for the first input callback before giving up
const ARM_TIMEOUT: Duration = Duration::from_secs(2);
/// Slack added on top of the expected trial length
const TRIAL_SLACK: Duration = Duration::from_secs(3);

/// Device open/configuration errors. These are fatal at session start,
/// never per-trial failures.
#[derive(Debug, Error)]
pub enum AudioIoError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Device {device} does not support {sample_rate} Hz")]
    SampleRateUnsupported { device: String, sample_rate: u32 },
    #[error("Device {device} has fewer than {needed} channels")]
    NotEnoughChannels { device: String, needed: u16 },
    #[error("Output device {0} has no f32 stereo config")]
    OutputFormat(String),
    #[error("Audio configuration error: {0}")]
    Config(String),
}

/// Named devices and channel layout from the experiment config
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub input_name: String,
    pub output_name: String,
    pub sample_rate: u32,
    /// Highest input channel index the session reads
    pub max_input_channel: u16,
}

/// Raw interleaved recording from one duplex run
#[derive(Debug, Clone)]
pub struct DuplexRecording {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Input frames captured before playback started
    pub lead_in_frames: usize,
}

impl DuplexRecording {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Extract one channel, `None` if it does not exist
    pub fn channel(&self, index: usize) -> Option<Vec<f32>> {
        let channels = self.channels as usize;
        if index >= channels {
            return None;
        }
        Some(self.samples.chunks_exact(channels).map(|frame| frame[index]).collect())
    }
}

/// Exclusive playback + capture hardware used by the coordinator
pub trait DuplexDevice: Send {
    fn sample_rate(&self) -> u32;
    /// Start capture, then play interleaved stereo `playback`, and keep
    /// recording until `record_frames` frames past playback start exist.
    fn play_and_record(
        &mut self,
        playback: &[f32],
        record_frames: usize,
        abort: &AtomicBool,
    ) -> Result<DuplexRecording, CaptureError>;
    /// Playback only (listen-only practice)
    fn play(&mut self, playback: &[f32], abort: &AtomicBool) -> Result<(), CaptureError>;
}

/// Configured input/output device pair, held for the whole session.
///
/// Streams are built per call and dropped before the call returns, so the
/// hardware is released on every exit path.
pub struct DevicePair {
    input: Device,
    input_config: SupportedStreamConfig,
    output: Device,
    output_config: SupportedStreamConfig,
    sample_rate: u32,
}

impl DevicePair {
    pub fn open(config: &DeviceConfig) -> Result<Self, AudioIoError> {
        let input = AudioInputService::find_device(&config.input_name)?;
        let input_config =
            AudioInputService::config_for(&input, config.sample_rate, config.max_input_channel + 1)?;

        let output = Self::find_output(&config.output_name)?;
        let output_config = Self::output_config_for(&output, config.sample_rate)?;

        info!(
            input = %input.name().unwrap_or_default(),
            output = %output.name().unwrap_or_default(),
            sample_rate = config.sample_rate,
            input_channels = input_config.channels(),
            output_channels = output_config.channels(),
            "Opened experiment device pair"
        );

        Ok(Self {
            input,
            input_config,
            output,
            output_config,
            sample_rate: config.sample_rate,
        })
    }

    fn find_output(pattern: &str) -> Result<Device, AudioIoError> {
        let host = cpal::default_host();
        let needle = pattern.to_lowercase();
        host.output_devices()
            .map_err(|e| AudioIoError::Config(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n.to_lowercase().contains(&needle)))
            .ok_or_else(|| AudioIoError::DeviceNotFound(pattern.to_string()))
    }

    fn output_config_for(device: &Device, sample_rate: u32) -> Result<SupportedStreamConfig, AudioIoError> {
        let name = device.name().unwrap_or_default();
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| AudioIoError::Config(e.to_string()))?
            .filter(|r| r.channels() >= 2 && r.sample_format() == SampleFormat::F32)
            .collect();

        if ranges.is_empty() {
            return Err(AudioIoError::OutputFormat(name));
        }

        ranges
            .into_iter()
            .find(|r| r.min_sample_rate().0 <= sample_rate && sample_rate <= r.max_sample_rate().0)
            .map(|r| r.with_sample_rate(cpal::SampleRate(sample_rate)))
            .ok_or(AudioIoError::SampleRateUnsupported { device: name, sample_rate })
    }

    /// Build an output stream that plays stereo `playback` once, then silence
    fn build_output(
        &self,
        playback: Arc<Vec<f32>>,
        position: Arc<AtomicUsize>,
        started: Arc<OnceLock<Instant>>,
        fault_tx: crossbeam_channel::Sender<CaptureError>,
    ) -> Result<cpal::Stream, CaptureError> {
        let out_channels = self.output_config.channels() as usize;
        let total_frames = playback.len() / 2;

        self.output
            .build_output_stream(
                &self.output_config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    started.get_or_init(Instant::now);
                    let pos = position.load(Ordering::SeqCst);
                    let mut written = 0;
                    for (i, frame) in data.chunks_mut(out_channels).enumerate() {
                        frame.fill(0.0);
                        let src = pos + i;
                        if src < total_frames {
                            frame[0] = playback[src * 2];
                            frame[1] = playback[src * 2 + 1];
                        }
                        written += 1;
                    }
                    position.store((pos + written).min(total_frames), Ordering::SeqCst);
                },
                move |err| {
                    tracing::error!("Output stream error: {}", err);
                    let _ = fault_tx.try_send(CaptureError::from_stream_error(err));
                },
                None,
            )
            .map_err(|e| CaptureError::Stream(e.to_string()))
    }
}

impl DuplexDevice for DevicePair {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn play_and_record(
        &mut self,
        playback: &[f32],
        record_frames: usize,
        abort: &AtomicBool,
    ) -> Result<DuplexRecording, CaptureError> {
        let channels = self.input_config.channels();
        let (chunk_tx, chunk_rx) = bounded::<Vec<f32>>(CHUNK_QUEUE);
        let (fault_tx, fault_rx) = bounded::<CaptureError>(4);
        let capture_started = Arc::new(OnceLock::new());
        let playback_started = Arc::new(OnceLock::new());
        let overrun = Arc::new(AtomicBool::new(false));

        let input_stream = AudioInputService::build_stream(
            &self.input,
            &self.input_config,
            chunk_tx,
            fault_tx.clone(),
            capture_started.clone(),
            overrun.clone(),
        )?;
        input_stream.play().map_err(|e| CaptureError::Stream(e.to_string()))?;

        // Capture must be running before the first stimulus sample goes out
        let mut samples: Vec<f32> = Vec::with_capacity((record_frames + self.sample_rate as usize) * channels as usize);
        let arm_deadline = Instant::now() + ARM_TIMEOUT;
        while capture_started.get().is_none() {
            if Instant::now() > arm_deadline {
                return Err(CaptureError::NotArmed);
            }
            if let Ok(chunk) = chunk_rx.recv_timeout(Duration::from_millis(5)) {
                samples.extend(chunk);
            }
        }

        let position = Arc::new(AtomicUsize::new(0));
        let output_stream = self.build_output(
            Arc::new(playback.to_vec()),
            position.clone(),
            playback_started.clone(),
            fault_tx,
        )?;
        output_stream.play().map_err(|e| CaptureError::Stream(e.to_string()))?;

        let expected = Duration::from_secs_f64(record_frames as f64 / self.sample_rate as f64);
        let deadline = Instant::now() + expected + TRIAL_SLACK;

        loop {
            if abort.load(Ordering::SeqCst) {
                return Err(CaptureError::Aborted);
            }
            if let Ok(fault) = fault_rx.try_recv() {
                return Err(fault);
            }
            if overrun.load(Ordering::SeqCst) {
                return Err(CaptureError::Overrun);
            }
            if Instant::now() > deadline {
                return Err(CaptureError::Timeout);
            }

            if let (Some(cap), Some(play)) = (capture_started.get(), playback_started.get()) {
                let lead_in = lead_in_frames(*cap, *play, self.sample_rate)?;
                if samples.len() / channels as usize >= lead_in + record_frames {
                    samples.truncate((lead_in + record_frames) * channels as usize);
                    debug!(lead_in, record_frames, "Duplex capture complete");
                    return Ok(DuplexRecording {
                        samples,
                        channels,
                        sample_rate: self.sample_rate,
                        lead_in_frames: lead_in,
                    });
                }
            }

            match chunk_rx.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => samples.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CaptureError::DeviceUnavailable("input stream closed".into()));
                }
            }
        }
        // streams dropped here on every path
    }

    fn play(&mut self, playback: &[f32], abort: &AtomicBool) -> Result<(), CaptureError> {
        let (fault_tx, fault_rx) = bounded::<CaptureError>(4);
        let position = Arc::new(AtomicUsize::new(0));
        let total_frames = playback.len() / 2;

        let stream = self.build_output(
            Arc::new(playback.to_vec()),
            position.clone(),
            Arc::new(OnceLock::new()),
            fault_tx,
        )?;
        stream.play().map_err(|e| CaptureError::Stream(e.to_string()))?;

        let expected = Duration::from_secs_f64(total_frames as f64 / self.sample_rate as f64);
        let deadline = Instant::now() + expected + TRIAL_SLACK;

        while position.load(Ordering::SeqCst) < total_frames {
            if abort.load(Ordering::SeqCst) {
                return Err(CaptureError::Aborted);
            }
            if let Ok(fault) = fault_rx.try_recv() {
                return Err(fault);
            }
            if Instant::now() > deadline {
                return Err(CaptureError::Timeout);
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

/// Frames between capture start and playback start; playback first is fatal
fn lead_in_frames(capture: Instant, playback: Instant, sample_rate: u32) -> Result<usize, CaptureError> {
    let Some(lead) = playback.checked_duration_since(capture) else {
        let late = capture.duration_since(playback);
        return Err(CaptureError::LateCapture { late_ms: late.as_secs_f64() * 1000.0 });
    };
    Ok((lead.as_secs_f64() * sample_rate as f64).round() as usize)
}
