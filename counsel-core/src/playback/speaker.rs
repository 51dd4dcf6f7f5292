//! cpal speaker output with sample-accurate scheduling.
//!
//! # Threading
//!
//! The `cpal::Stream` lives on a dedicated `speaker-output` thread that
//! builds it, plays it on request, and drops it on shutdown. The output
//! callback owns a small mixer and receives work through a lock-free
//! command ring:
//!
//! ```text
//! SpeakerOutput::schedule ──► [command ring] ──► output callback (mixer)
//!                                                  │
//! SpeakerOutput (drains) ◄── [retired ring] ◄──────┘ finished buffers
//! ```
//!
//! Finished sample buffers travel back through the retired ring so the
//! callback never frees memory. `schedule` refuses a unit once the mixer's
//! voice table could be full, so nothing accepted is dropped. The callback publishes the number of frames
//! rendered, which is the device clock seen by the scheduler.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{debug, info, warn};

use super::{AudioOutput, OutputFactory, UnitId};
use crate::audio::resample::resample_all;
use crate::error::{CounselError, Result};

/// Units the mixer can hold at once, pending or playing. `schedule` refuses
/// more rather than letting the callback drop them.
const MAX_VOICES: usize = 1024;
/// Room for a `Start` and a `Stop` per voice.
const COMMAND_CAPACITY: usize = MAX_VOICES * 2;
/// How long a unit stays booked after its nominal end. Covers the shift a
/// late voice gets in the mixer, which is at most one callback block.
const RETIRE_SLACK_SECS: f64 = 0.5;
const RESUME_TIMEOUT_SECS: u64 = 2;

enum MixerCommand {
    Start(Voice),
    Stop(UnitId),
}

struct Voice {
    id: UnitId,
    samples: Vec<f32>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

enum Control {
    Resume(crossbeam_channel::Sender<Result<()>>),
    Shutdown,
}

/// Control side of the mixer: the rings plus per-unit bookkeeping.
struct VoiceQueue {
    commands: HeapProd<MixerCommand>,
    retired: HeapCons<Vec<f32>>,
    frames_rendered: Arc<AtomicU64>,
    device_rate: u32,
    /// End time (s) of each unit the mixer may still hold.
    ends: HashMap<UnitId, f64>,
}

impl VoiceQueue {
    fn new(device_rate: u32) -> (Self, Mixer) {
        let (commands, command_rx) = HeapRb::<MixerCommand>::new(COMMAND_CAPACITY).split();
        let (retired_tx, retired) = HeapRb::<Vec<f32>>::new(MAX_VOICES).split();
        let frames_rendered = Arc::new(AtomicU64::new(0));

        let mixer = Mixer {
            commands: command_rx,
            retired: retired_tx,
            voices: Vec::with_capacity(MAX_VOICES),
            frame: 0,
            clock: Arc::clone(&frames_rendered),
        };
        let queue = Self {
            commands,
            retired,
            frames_rendered,
            device_rate,
            ends: HashMap::new(),
        };
        (queue, mixer)
    }

    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn drain_retired(&mut self) {
        while self.retired.try_pop().is_some() {}
        let now = self.now();
        self.ends.retain(|_, end| *end + RETIRE_SLACK_SECS > now);
    }

    fn push_command(&mut self, command: MixerCommand) -> Result<()> {
        self.commands
            .try_push(command)
            .map_err(|_| CounselError::Output("mixer command queue full".into()))
    }

    fn schedule(
        &mut self,
        id: UnitId,
        samples: &[f32],
        sample_rate: u32,
        start_at: f64,
    ) -> Result<()> {
        self.drain_retired();
        if self.ends.len() >= MAX_VOICES {
            return Err(CounselError::Output(format!(
                "playback queue full ({MAX_VOICES} units pending)"
            )));
        }

        let samples = resample_all(samples, sample_rate, self.device_rate)?;
        let requested = (start_at.max(0.0) * self.device_rate as f64).round() as u64;
        let start_frame = requested.max(self.frames_rendered.load(Ordering::Acquire));
        let end = (start_frame + samples.len() as u64) as f64 / self.device_rate as f64;

        self.push_command(MixerCommand::Start(Voice {
            id,
            samples,
            start_frame,
        }))?;
        self.ends.insert(id, end);
        Ok(())
    }

    fn stop(&mut self, id: UnitId) -> Result<()> {
        let Some(end) = self.ends.remove(&id) else {
            return Err(CounselError::Output(format!("unknown unit {}", id.0)));
        };
        // Sent even for a unit past its nominal end; a shifted voice may still be sounding.
        self.push_command(MixerCommand::Stop(id))?;
        if end <= self.now() {
            return Err(CounselError::Output(format!("unit {} already finished", id.0)));
        }
        Ok(())
    }
}

/// Default system speaker.
pub struct SpeakerOutput {
    control_tx: crossbeam_channel::Sender<Control>,
    queue: VoiceQueue,
    worker: Option<JoinHandle<()>>,
}

impl SpeakerOutput {
    /// Open the default output device. The stream starts paused; call
    /// [`AudioOutput::resume`] before expecting sound.
    pub fn open(preferred_rate: u32) -> Result<Self> {
        let (mut queue, mixer) = VoiceQueue::new(preferred_rate);
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<Control>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = std::thread::Builder::new()
            .name("speaker-output".into())
            .spawn(move || output_thread(preferred_rate, mixer, control_rx, ready_tx))
            .map_err(|e| CounselError::Output(format!("failed to spawn output thread: {e}")))?;

        queue.device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(CounselError::Output("output thread exited during open".into()));
            }
        };

        info!(device_rate = queue.device_rate, "speaker output opened");
        Ok(Self {
            control_tx,
            queue,
            worker: Some(worker),
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.queue.device_rate
    }
}

impl AudioOutput for SpeakerOutput {
    fn resume(&mut self) -> Result<()> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.control_tx
            .send(Control::Resume(ack_tx))
            .map_err(|_| CounselError::Output("output thread is gone".into()))?;
        ack_rx
            .recv_timeout(std::time::Duration::from_secs(RESUME_TIMEOUT_SECS))
            .map_err(|_| CounselError::Output("timed out resuming output".into()))?
    }

    fn now(&self) -> f64 {
        self.queue.now()
    }

    fn schedule(
        &mut self,
        id: UnitId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<()> {
        self.queue.schedule(id, &samples, sample_rate, start_at)
    }

    fn stop(&mut self, id: UnitId) -> Result<()> {
        self.queue.stop(id)
    }

    fn close(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.control_tx.send(Control::Shutdown);
        worker
            .join()
            .map_err(|_| CounselError::Output("output thread panicked".into()))?;
        self.queue.drain_retired();
        self.queue.ends.clear();
        debug!("speaker output closed");
        Ok(())
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("speaker output shutdown: {e}");
        }
    }
}

/// Opens a [`SpeakerOutput`] for every session.
#[derive(Debug, Clone)]
pub struct SpeakerFactory {
    sample_rate: u32,
}

impl Default for SpeakerFactory {
    fn default() -> Self {
        Self {
            sample_rate: crate::codec::PLAYBACK_SAMPLE_RATE,
        }
    }
}

impl OutputFactory for SpeakerFactory {
    fn create(&self) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(SpeakerOutput::open(self.sample_rate)?))
    }
}

/// Real-time side: owned by the output callback.
struct Mixer {
    commands: HeapCons<MixerCommand>,
    retired: HeapProd<Vec<f32>>,
    voices: Vec<Voice>,
    frame: u64,
    clock: Arc<AtomicU64>,
}

impl Mixer {
    /// Render `out.len() / channels` frames of interleaved audio.
    fn render(&mut self, out: &mut [f32], channels: usize) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                MixerCommand::Start(mut voice) => {
                    if self.voices.len() >= MAX_VOICES {
                        self.retire_buffer(voice.samples);
                        continue;
                    }
                    // Arrived after its start: play it whole from this block.
                    voice.start_frame = voice.start_frame.max(self.frame);
                    self.voices.push(voice);
                }
                MixerCommand::Stop(id) => {
                    let mut i = 0;
                    while i < self.voices.len() {
                        if self.voices[i].id == id {
                            let voice = self.voices.swap_remove(i);
                            self.retire_buffer(voice.samples);
                        } else {
                            i += 1;
                        }
                    }
                }
            }
        }

        out.fill(0.0);
        let frames = (out.len() / channels.max(1)) as u64;
        let block_start = self.frame;
        let block_end = block_start + frames;

        for voice in &self.voices {
            if voice.start_frame >= block_end || voice.end_frame() <= block_start {
                continue;
            }
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for t in from..to {
                let sample = voice.samples[(t - voice.start_frame) as usize];
                let base = (t - block_start) as usize * channels;
                for o in &mut out[base..base + channels] {
                    *o += sample;
                }
            }
        }
        for o in out.iter_mut() {
            *o = o.clamp(-1.0, 1.0);
        }

        self.frame = block_end;
        self.clock.store(block_end, Ordering::Release);

        let mut i = 0;
        while i < self.voices.len() {
            if self.voices[i].end_frame() <= block_end {
                let voice = self.voices.swap_remove(i);
                self.retire_buffer(voice.samples);
            } else {
                i += 1;
            }
        }
    }

    fn retire_buffer(&mut self, buffer: Vec<f32>) {
        // A full ring means the control side stopped draining; dropping here is the fallback.
        let _ = self.retired.try_push(buffer);
    }
}

fn output_thread(
    preferred_rate: u32,
    mixer: Mixer,
    control_rx: crossbeam_channel::Receiver<Control>,
    ready_tx: std::sync::mpsc::Sender<Result<u32>>,
) {
    use cpal::traits::StreamTrait;

    let stream = match cpal_output::build(preferred_rate, mixer) {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(control) = control_rx.recv() {
        match control {
            Control::Resume(ack) => {
                let result = stream
                    .play()
                    .map_err(|e| CounselError::Output(format!("failed to start output: {e}")));
                let _ = ack.send(result);
            }
            Control::Shutdown => break,
        }
    }
    if let Err(e) = stream.pause() {
        debug!("pause on shutdown failed: {e}");
    }
    drop(stream);
}

mod cpal_output {
    use cpal::{
        traits::{DeviceTrait, HostTrait},
        FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    };
    use tracing::{error, info};

    use super::Mixer;
    use crate::error::{CounselError, Result};

    pub(super) fn build(preferred_rate: u32, mixer: Mixer) -> Result<(Stream, u32)> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| CounselError::Output("no output device found".into()))?;
        let name = device.name().unwrap_or_else(|_| "unknown".into());

        let (config, format) = select_config(&device, preferred_rate)?;
        let rate = config.sample_rate.0;
        info!(
            device = %name,
            sample_rate = rate,
            channels = config.channels,
            format = ?format,
            "output stream config selected"
        );

        let stream = match format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer),
            other => {
                return Err(CounselError::Output(format!(
                    "unsupported output sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| CounselError::Output(e.to_string()))?;

        Ok((stream, rate))
    }

    fn select_config(device: &cpal::Device, preferred_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
        let wanted = SampleRate(preferred_rate);
        if let Ok(ranges) = device.supported_output_configs() {
            let native = ranges
                .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
                .min_by_key(|r| r.channels());
            if let Some(range) = native {
                let supported = range.with_sample_rate(wanted);
                return Ok((supported.config(), supported.sample_format()));
            }
        }

        let fallback = device
            .default_output_config()
            .map_err(|e| CounselError::Output(e.to_string()))?;
        Ok((fallback.config(), fallback.sample_format()))
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut mixer: Mixer,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels.max(1) as usize;
        let mut scratch: Vec<f32> = Vec::with_capacity(8192);

        device.build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                mixer.render(&mut scratch, channels);
                for (out, s) in data.iter_mut().zip(scratch.iter()) {
                    *out = s.to_sample::<T>();
                }
            },
            |err| error!("audio output stream error: {err}"),
            None,
        )
    }
}
