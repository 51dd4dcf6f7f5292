//! Capture pipeline: microphone → fixed-size frames → meter + codec → frame handler.
//!
//! ```text
//! InputDevice callback ─push_slice─► SPSC ring ─► framing thread
//!                                                   │ RateConverter (device rate → 16 kHz)
//!                                                   │ Framer (4096 samples)
//!                                                   │ FrameLevel::measure + encode_frame
//!                                                   ▼
//!                                              FrameHandler
//! ```
//!
//! The handler is the pipeline's only sink. Nothing in the capture graph is
//! routed to an output device, so captured audio is never monitored locally.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send`, so the device is opened, driven and dropped on
//! the framing thread. `open` blocks until that thread reports whether the
//! device came up.

use std::any::Any;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{
        create_audio_ring,
        frame::{Framer, CAPTURE_FRAME_SAMPLES},
        AudioConsumer, AudioProducer, Consumer,
    },
    codec::{encode_frame, EncodedFrame, CAPTURE_SAMPLE_RATE},
    error::{CounselError, Result},
    meter::{FrameLevel, DEFAULT_ACTIVITY_THRESHOLD, DEFAULT_VOLUME_GAIN},
};

/// Samples drained from the ring per framing iteration.
const DRAIN_CHUNK: usize = 1024;

/// Sleep when the ring is empty, so the framing thread does not spin.
const EMPTY_SLEEP_MS: u64 = 5;

/// What the pipeline asks of the input device.
#[derive(Debug, Clone)]
pub struct CaptureConstraints {
    /// Rate of emitted frames (Hz). Devices that cannot deliver it are resampled.
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_len: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub activity_threshold: f32,
    pub volume_gain: f32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            frame_len: CAPTURE_FRAME_SAMPLES,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            activity_threshold: DEFAULT_ACTIVITY_THRESHOLD,
            volume_gain: DEFAULT_VOLUME_GAIN,
        }
    }
}

/// A device that came up; `stream` keeps it alive until dropped.
pub struct OpenedInput {
    /// Rate at which the device pushes mono samples into the ring.
    pub sample_rate: u32,
    pub stream: Box<dyn Any>,
}

/// Source of mono f32 samples.
///
/// `open` runs on the framing thread and must push samples into `producer`
/// only while `running` is set.
pub trait InputDevice: Send + Sync + 'static {
    /// # Errors
    /// `CounselError::DeviceUnavailable` when no device exists or it cannot be opened.
    fn open(
        &self,
        constraints: &CaptureConstraints,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<OpenedInput>;
}

/// One encoded capture frame plus its meter readings.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub encoded: EncodedFrame,
    pub level: FrameLevel,
}

impl CapturedFrame {
    pub fn from_samples(samples: &[f32], constraints: &CaptureConstraints) -> Self {
        Self {
            encoded: encode_frame(samples, constraints.sample_rate),
            level: FrameLevel::measure(
                samples,
                constraints.activity_threshold,
                constraints.volume_gain,
            ),
        }
    }
}

pub type FrameHandler = Box<dyn FnMut(CapturedFrame) + Send>;

/// Owns the microphone and the framing thread.
pub struct CapturePipeline {
    /// `None` once unregistered; checked under the lock before every call.
    handler: Arc<Mutex<Option<FrameHandler>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    frames_emitted: Arc<AtomicU64>,
    device_sample_rate: u32,
}

impl CapturePipeline {
    /// Open `device` and start delivering frames to `handler`.
    ///
    /// Blocks until the device is confirmed open or has failed.
    pub fn open(
        device: Arc<dyn InputDevice>,
        constraints: CaptureConstraints,
        handler: FrameHandler,
    ) -> Result<Self> {
        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let handler = Arc::new(Mutex::new(Some(handler)));
        let frames_emitted = Arc::new(AtomicU64::new(0));

        info!(
            sample_rate = constraints.sample_rate,
            channels = constraints.channels,
            frame_len = constraints.frame_len,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "opening capture pipeline"
        );

        let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();
        let ctx = FramerContext {
            consumer,
            running: Arc::clone(&running),
            handler: Arc::clone(&handler),
            frames_emitted: Arc::clone(&frames_emitted),
            constraints,
        };

        let worker = thread::Builder::new()
            .name("capture-framer".into())
            .spawn(move || {
                let input = match device.open(&ctx.constraints, producer, Arc::clone(&ctx.running))
                {
                    Ok(input) => {
                        let _ = open_tx.send(Ok(input.sample_rate));
                        input
                    }
                    Err(e) => {
                        ctx.running.store(false, Ordering::SeqCst);
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                run_framer(ctx, input.sample_rate);
                // Device released on the thread that opened it.
                drop(input);
            })
            .map_err(|e| CounselError::DeviceUnavailable(format!("capture thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok(device_sample_rate)) => {
                info!(device_sample_rate, "capture pipeline running");
                Ok(Self {
                    handler,
                    running,
                    worker: Some(worker),
                    frames_emitted,
                    device_sample_rate,
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(CounselError::DeviceUnavailable(
                    "capture thread exited before the device opened".into(),
                ))
            }
        }
    }

    /// Stop capture and release the device. Safe to call any number of times.
    ///
    /// The handler is unregistered before the device is released, so no
    /// frame is delivered once this returns.
    pub fn close(&mut self) {
        if self.handler.lock().take().is_some() {
            debug!("capture frame handler unregistered");
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
            info!(
                frames = self.frames_emitted.load(Ordering::Relaxed),
                "capture pipeline closed"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.worker.is_some()
    }

    pub fn device_sample_rate(&self) -> u32 {
        self.device_sample_rate
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.close();
    }
}

struct FramerContext {
    consumer: AudioConsumer,
    running: Arc<AtomicBool>,
    handler: Arc<Mutex<Option<FrameHandler>>>,
    frames_emitted: Arc<AtomicU64>,
    constraints: CaptureConstraints,
}

fn run_framer(mut ctx: FramerContext, device_sample_rate: u32) {
    let mut converter =
        match RateConverter::new(device_sample_rate, ctx.constraints.sample_rate, DRAIN_CHUNK) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to create capture resampler: {e}");
                return;
            }
        };
    if !converter.is_passthrough() {
        info!(
            from = device_sample_rate,
            to = ctx.constraints.sample_rate,
            "capture resampling enabled"
        );
    }

    let mut framer = Framer::new(ctx.constraints.frame_len, ctx.constraints.sample_rate);
    let mut raw = vec![0f32; DRAIN_CHUNK];

    while ctx.running.load(Ordering::Relaxed) {
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        }

        let resampled = converter.process(&raw[..n]);
        for frame in framer.push(&resampled) {
            let captured = CapturedFrame::from_samples(&frame.samples, &ctx.constraints);
            let count = ctx.frames_emitted.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 40 == 0 {
                debug!(
                    frames = count,
                    rms = format_args!("{:.4}", captured.level.rms),
                    active = captured.level.active,
                    "capture level check"
                );
            }

            let mut guard = ctx.handler.lock();
            match guard.as_mut() {
                Some(handler) => handler(captured),
                None => return,
            }
        }
    }
}
