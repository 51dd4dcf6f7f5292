//! Gapless, cancellable playback of streamed synthesized audio.
//!
//! ## Scheduling
//!
//! ```text
//! device clock ──────────────────────────────────────────────►
//!              now  now+lead
//!               │     ├── unit 0 ──┼─ unit 1 ─┼─ unit 2 ─┤
//!                                                        ▲ next_start_time
//! ```
//!
//! Each inbound frame becomes one [`PlaybackUnit`] scheduled at the cursor.
//! When the cursor has fallen behind the device clock (startup, a gap in the
//! stream, or after [`PlaybackScheduler::cancel_all`]) the unit starts at
//! `now + lead_time` so it is never scheduled in the immediate past.
//!
//! The cursor, the active set and the output context belong to the scheduler
//! alone; nothing else mutates them.

#[cfg(feature = "audio-cpal")]
pub mod speaker;

#[cfg(feature = "audio-cpal")]
pub use speaker::{SpeakerFactory, SpeakerOutput};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{decode_frame, PLAYBACK_SAMPLE_RATE};
use crate::error::{CounselError, Result};

/// Minimum distance between "now" and the start of a unit scheduled after a gap.
pub const DEFAULT_LEAD_TIME_SECS: f64 = 0.050;

/// Generation-counted identifier of a scheduled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u64);

/// An audio output context with its own clock.
pub trait AudioOutput: Send {
    /// Start rendering if the context was created suspended.
    fn resume(&mut self) -> Result<()>;

    /// Device clock in seconds.
    fn now(&self) -> f64;

    /// Play `samples` (mono, at `sample_rate`) starting at device time `start_at`.
    fn schedule(
        &mut self,
        id: UnitId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<()>;

    /// Stop a unit immediately, whether it is playing or still pending.
    ///
    /// # Errors
    /// When the unit is unknown or has already finished on its own.
    fn stop(&mut self, id: UnitId) -> Result<()>;

    /// Release the device. Further calls are no-ops.
    fn close(&mut self) -> Result<()>;
}

/// Creates a fresh output context per voice session.
pub trait OutputFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn AudioOutput>>;
}

/// One scheduled buffer of synthesized audio.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub samples: Arc<[f32]>,
    /// Device time (s).
    pub start: f64,
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    sample_rate: u32,
    lead_time: f64,
    /// End time of the last scheduled unit.
    next_start_time: f64,
    active: BTreeMap<UnitId, PlaybackUnit>,
    next_id: u64,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self::with_settings(output, PLAYBACK_SAMPLE_RATE, DEFAULT_LEAD_TIME_SECS)
    }

    pub fn with_settings(output: Box<dyn AudioOutput>, sample_rate: u32, lead_time: f64) -> Self {
        Self {
            output,
            sample_rate,
            lead_time: lead_time.max(0.0),
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        self.output.resume()
    }

    /// Decode one base64 PCM16 frame and schedule it right after the previous one.
    ///
    /// Returns `Ok(None)` for frames that carry no samples.
    ///
    /// # Errors
    /// `MalformedInput` if the payload does not decode; the cursor is untouched.
    pub fn enqueue(&mut self, data: &str) -> Result<Option<UnitId>> {
        let samples = decode_frame(data)?;
        self.enqueue_samples(samples)
    }

    pub fn enqueue_samples(&mut self, samples: Vec<f32>) -> Result<Option<UnitId>> {
        if self.closed {
            return Err(CounselError::Output("playback scheduler is closed".into()));
        }
        self.reap_finished();
        if samples.is_empty() {
            return Ok(None);
        }

        let now = self.output.now();
        let start = if self.next_start_time <= now {
            now + self.lead_time
        } else {
            self.next_start_time
        };
        let duration = samples.len() as f64 / self.sample_rate as f64;

        let id = UnitId(self.next_id);
        self.next_id += 1;
        let samples: Arc<[f32]> = samples.into();

        self.output
            .schedule(id, Arc::clone(&samples), self.sample_rate, start)?;
        self.next_start_time = start + duration;
        self.active.insert(
            id,
            PlaybackUnit {
                id,
                samples,
                start,
                duration,
            },
        );

        debug!(
            unit = id.0,
            start = format_args!("{start:.3}"),
            duration = format_args!("{duration:.3}"),
            queued = self.active.len(),
            "playback unit scheduled"
        );
        Ok(Some(id))
    }

    /// Drop units that have played to the end. Returns how many were removed.
    pub fn reap_finished(&mut self) -> usize {
        let now = self.output.now();
        let before = self.active.len();
        self.active.retain(|_, unit| unit.end() > now);
        before - self.active.len()
    }

    /// Hard-stop everything queued or playing and pull the cursor back to now.
    ///
    /// Returns the number of units that were still active.
    pub fn cancel_all(&mut self) -> usize {
        let units = std::mem::take(&mut self.active);
        let count = units.len();
        for id in units.into_keys() {
            if let Err(e) = self.output.stop(id) {
                // Finished on its own between the last reap and now.
                debug!(unit = id.0, "stop skipped: {e}");
            }
        }
        self.next_start_time = self.output.now();
        if count > 0 {
            info!(cancelled = count, "playback cancelled");
        }
        count
    }

    /// Cancel playback and release the output context. Never fails.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.cancel_all();
        if let Err(e) = self.output.close() {
            warn!("failed to close audio output: {e}");
        }
        self.closed = true;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn now(&self) -> f64 {
        self.output.now()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Active units ordered by id (and therefore by start time).
    pub fn active_units(&self) -> impl Iterator<Item = &PlaybackUnit> {
        self.active.values()
    }

}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
