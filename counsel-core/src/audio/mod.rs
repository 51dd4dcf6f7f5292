//! cpal-backed microphone input.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block or perform I/O, so it only mixes down to mono and
//! writes into the SPSC ring producer, whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`MicrophoneInput::open`] is therefore only ever called on the
//! capture framing thread, which also drops the stream.

pub mod device;
pub mod resample;

use std::sync::{atomic::AtomicBool, Arc};

use crate::{
    buffering::AudioProducer,
    capture::{CaptureConstraints, InputDevice, OpenedInput},
    error::Result,
};

/// The system microphone, optionally selected by name.
#[derive(Debug, Clone, Default)]
pub struct MicrophoneInput {
    preferred_device: Option<String>,
}

impl MicrophoneInput {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[cfg(feature = "audio-cpal")]
impl InputDevice for MicrophoneInput {
    fn open(
        &self,
        constraints: &CaptureConstraints,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<OpenedInput> {
        use cpal::{traits::StreamTrait, SampleFormat};
        use tracing::info;

        use crate::error::CounselError;

        let device = device::find_input_device(self.preferred_device.as_deref())?;
        let (config, format) = cpal_input::select_config(&device, constraints)?;
        let sample_rate = config.sample_rate.0;

        info!(
            sample_rate,
            channels = config.channels,
            format = ?format,
            "input stream config selected"
        );

        let stream = match format {
            SampleFormat::F32 => cpal_input::build_mono::<f32>(&device, &config, producer, running),
            SampleFormat::I16 => cpal_input::build_mono::<i16>(&device, &config, producer, running),
            SampleFormat::U16 => cpal_input::build_mono::<u16>(&device, &config, producer, running),
            SampleFormat::U8 => cpal_input::build_mono::<u8>(&device, &config, producer, running),
            other => {
                return Err(CounselError::DeviceUnavailable(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| CounselError::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CounselError::DeviceUnavailable(e.to_string()))?;

        Ok(OpenedInput {
            sample_rate,
            stream: Box::new(stream),
        })
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl InputDevice for MicrophoneInput {
    fn open(
        &self,
        _constraints: &CaptureConstraints,
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
    ) -> Result<OpenedInput> {
        Err(crate::error::CounselError::DeviceUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_input {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use cpal::{
        traits::DeviceTrait, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream,
        StreamConfig,
    };
    use tracing::{error, warn};

    use crate::{
        buffering::{AudioProducer, Producer},
        capture::CaptureConstraints,
        error::{CounselError, Result},
    };

    /// Prefer a config that delivers the wire rate natively with the fewest
    /// channels; otherwise fall back to the device default and resample.
    pub(super) fn select_config(
        device: &cpal::Device,
        constraints: &CaptureConstraints,
    ) -> Result<(StreamConfig, SampleFormat)> {
        let wanted = SampleRate(constraints.sample_rate);

        if let Ok(ranges) = device.supported_input_configs() {
            let native = ranges
                .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
                .min_by_key(|r| r.channels());
            if let Some(range) = native {
                let supported = range.with_sample_rate(wanted);
                return Ok((supported.config(), supported.sample_format()));
            }
        }

        let fallback = device
            .default_input_config()
            .map_err(|e| CounselError::DeviceUnavailable(e.to_string()))?;
        Ok((fallback.config(), fallback.sample_format()))
    }

    pub(super) fn build_mono<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let ch = config.channels.max(1) as usize;
        let mut mix_buf: Vec<f32> = Vec::new();

        device.build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch]
                        .iter()
                        .map(|s| s.to_sample::<f32>())
                        .sum();
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!(
                        "capture ring full: dropped {} samples",
                        mix_buf.len() - written
                    );
                }
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
    }
}
