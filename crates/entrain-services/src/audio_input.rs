//! Audio input: device lookup and capture streams for the response microphone

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, FromSample, SampleFormat, StreamConfig, SupportedStreamConfig};
use crossbeam_channel::Sender;
use tracing::error;

use crate::audio_io::AudioIoError;
use crate::capture::CaptureError;

pub struct AudioInputService;

impl AudioInputService {
    /// Find an input device whose name contains `pattern` (case-insensitive)
    pub fn find_device(pattern: &str) -> Result<Device, AudioIoError> {
        let host = cpal::default_host();
        let needle = pattern.to_lowercase();

        host.input_devices()
            .map_err(|e| AudioIoError::Config(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n.to_lowercase().contains(&needle)))
            .ok_or_else(|| AudioIoError::DeviceNotFound(pattern.to_string()))
    }

    /// Pick a supported config at exactly `sample_rate` with at least `min_channels`
    pub fn config_for(
        device: &Device,
        sample_rate: u32,
        min_channels: u16,
    ) -> Result<SupportedStreamConfig, AudioIoError> {
        let name = device.name().unwrap_or_default();
        let mut ranges: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| AudioIoError::Config(e.to_string()))?
            .filter(|r| r.channels() >= min_channels)
            .collect();

        if ranges.is_empty() {
            return Err(AudioIoError::NotEnoughChannels { device: name, needed: min_channels });
        }

        // Fewest channels first, f32 preferred among equals
        ranges.sort_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32));

        ranges
            .into_iter()
            .find(|r| r.min_sample_rate().0 <= sample_rate && sample_rate <= r.max_sample_rate().0)
            .map(|r| r.with_sample_rate(cpal::SampleRate(sample_rate)))
            .ok_or(AudioIoError::SampleRateUnsupported { device: name, sample_rate })
    }

    /// Build (but do not start) an input stream that forwards interleaved
    /// f32 chunks. The first callback stamps `started`; a full queue sets
    /// `overrun`; stream errors go to `faults`.
    pub fn build_stream(
        device: &Device,
        config: &SupportedStreamConfig,
        chunk_tx: Sender<Vec<f32>>,
        fault_tx: Sender<CaptureError>,
        started: Arc<OnceLock<Instant>>,
        overrun: Arc<AtomicBool>,
    ) -> Result<cpal::Stream, CaptureError> {
        let stream_config: StreamConfig = config.config();

        match config.sample_format() {
            SampleFormat::F32 => Self::build_typed::<f32>(device, &stream_config, chunk_tx, fault_tx, started, overrun),
            SampleFormat::I16 => Self::build_typed::<i16>(device, &stream_config, chunk_tx, fault_tx, started, overrun),
            SampleFormat::I32 => Self::build_typed::<i32>(device, &stream_config, chunk_tx, fault_tx, started, overrun),
            format => Err(CaptureError::Stream(format!("Unsupported input format: {:?}", format))),
        }
    }

    fn build_typed<T>(
        device: &Device,
        config: &StreamConfig,
        tx: Sender<Vec<f32>>,
        fault_tx: Sender<CaptureError>,
        started: Arc<OnceLock<Instant>>,
        overrun: Arc<AtomicBool>,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: cpal::Sample + cpal::SizedSample + Send + 'static,
        f32: cpal::FromSample<T>,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    started.get_or_init(Instant::now);
                    let samples: Vec<f32> = data.iter().map(|s| f32::from_sample_(*s)).collect();
                    if tx.try_send(samples).is_err() {
                        overrun.store(true, Ordering::SeqCst);
                    }
                },
                move |err| {
                    error!("Input stream error: {}", err);
                    let _ = fault_tx.try_send(CaptureError::from_stream_error(err));
                },
                None,
            )
            .map_err(|e| CaptureError::Stream(e.to_string()))
    }
}
