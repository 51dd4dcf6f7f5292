use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-session counters, shared between the controller task and the host.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub frames_captured: AtomicU64,
    pub frames_sent: AtomicU64,
    /// Captured frames discarded because the assistant was interrupted.
    pub frames_dropped: AtomicU64,
    pub send_failures: AtomicU64,
    pub units_scheduled: AtomicU64,
    pub units_cancelled: AtomicU64,
    pub malformed_frames: AtomicU64,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.send_failures.store(0, Ordering::Relaxed);
        self.units_scheduled.store(0, Ordering::Relaxed);
        self.units_cancelled.store(0, Ordering::Relaxed);
        self.malformed_frames.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            units_scheduled: self.units_scheduled.load(Ordering::Relaxed),
            units_cancelled: self.units_cancelled.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub send_failures: u64,
    pub units_scheduled: u64,
    pub units_cancelled: u64,
    pub malformed_frames: u64,
}
