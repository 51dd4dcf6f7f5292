//! The voice session state machine.
//!
//! ```text
//!            start()              Open
//! idle ──────────────► connecting ─────► connected
//!  ▲  error ◄─────────────┘   │             │ Closed        │ Error
//!  │  disconnected ◄──────────┴─────────────┘               ▼
//!  └──── end() from any state ◄──────────────────────── error
//! ```
//!
//! Every field is owned by the controller and mutated only by the task that
//! drives it. Capture frames and session events arrive on channels and are
//! applied in arrival order through [`VoiceSessionController::handle`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::diagnostics::SessionDiagnostics;
use crate::{
    capture::{CaptureConstraints, CapturePipeline, CapturedFrame, FrameHandler, InputDevice},
    codec::PLAYBACK_SAMPLE_RATE,
    error::{CounselError, Result},
    ipc::events::{ActivityEvent, SessionSnapshot, SessionStatus, SessionStatusEvent},
    playback::{OutputFactory, PlaybackScheduler, DEFAULT_LEAD_TIME_SECS},
    session::{InboundMessage, LiveConfig, LiveConnector, LiveSession, SessionEvent},
};

const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub live: LiveConfig,
    pub capture: CaptureConstraints,
    pub playback_lead_secs: f64,
}

impl ControllerConfig {
    pub fn new(live: LiveConfig) -> Self {
        Self {
            live,
            capture: CaptureConstraints::default(),
            playback_lead_secs: DEFAULT_LEAD_TIME_SECS,
        }
    }
}

/// Something the controller has to react to.
#[derive(Debug)]
pub enum ControllerEvent {
    Session(SessionEvent),
    /// The inbound channel closed without a final event.
    SessionGone,
    Frame(CapturedFrame),
}

pub struct VoiceSessionController {
    config: ControllerConfig,
    connector: Arc<dyn LiveConnector>,
    input: Arc<dyn InputDevice>,
    outputs: Arc<dyn OutputFactory>,

    status: SessionStatus,
    session: Option<Box<dyn LiveSession>>,
    inbound: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    scheduler: Option<PlaybackScheduler>,
    capture: Option<CapturePipeline>,
    frames: Option<mpsc::UnboundedReceiver<CapturedFrame>>,

    is_speaking: bool,
    is_listening: bool,
    volume: f32,
    activity_seq: u64,

    snapshot: Arc<Mutex<SessionSnapshot>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl VoiceSessionController {
    pub fn new(
        config: ControllerConfig,
        connector: Arc<dyn LiveConnector>,
        input: Arc<dyn InputDevice>,
        outputs: Arc<dyn OutputFactory>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            connector,
            input,
            outputs,
            status: SessionStatus::Idle,
            session: None,
            inbound: None,
            scheduler: None,
            capture: None,
            frames: None,
            is_speaking: false,
            is_listening: false,
            volume: 0.0,
            activity_seq: 0,
            snapshot: Arc::new(Mutex::new(SessionSnapshot::default())),
            status_tx,
            activity_tx,
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    /// Open the output, then connect the transport.
    ///
    /// The output is created and resumed before any network activity so the
    /// first inbound frame can be scheduled immediately.
    ///
    /// # Errors
    /// `AlreadyActive` while connecting or connected; otherwise the failure
    /// that moved the session to `error`.
    pub async fn start(&mut self) -> Result<()> {
        if !self.status.can_start() {
            return Err(CounselError::AlreadyActive);
        }
        self.teardown();
        self.diagnostics.reset();
        self.set_status(SessionStatus::Connecting, None, false);

        match self.open_output() {
            Ok(scheduler) => self.scheduler = Some(scheduler),
            Err(e) => return Err(self.fail(e)),
        }

        match self.connector.connect(&self.config.live).await {
            Ok(link) => {
                self.session = Some(link.session);
                self.inbound = Some(link.events);
                info!(model = %self.config.live.model, "transport connected, awaiting setup");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Full teardown from any state. Safe to call repeatedly.
    pub fn end(&mut self) {
        let previous = self.status;
        self.teardown();
        self.set_status(SessionStatus::Idle, None, true);
        info!(from = %previous, "voice session ended");
    }

    /// Wait for the next capture frame or session event.
    ///
    /// Never resolves while no session is live. Cancel safe.
    pub async fn next_event(&mut self) -> ControllerEvent {
        tokio::select! {
            biased;
            event = recv_or_pending(&mut self.inbound) => match event {
                Some(event) => ControllerEvent::Session(event),
                None => ControllerEvent::SessionGone,
            },
            Some(frame) = recv_or_pending(&mut self.frames) => ControllerEvent::Frame(frame),
        }
    }

    pub async fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Session(SessionEvent::Open) => self.on_open().await,
            ControllerEvent::Session(SessionEvent::Message(message)) => self.on_message(message),
            ControllerEvent::Session(SessionEvent::Closed) | ControllerEvent::SessionGone => {
                self.on_remote_closed()
            }
            ControllerEvent::Session(SessionEvent::Error(message)) => {
                self.on_remote_error(message)
            }
            ControllerEvent::Frame(frame) => self.on_frame(frame),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn is_listening(&self) -> bool {
        self.is_listening
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Units queued or playing right now.
    pub fn pending_playback(&mut self) -> usize {
        self.scheduler
            .as_mut()
            .map(|s| {
                s.reap_finished();
                s.active_len()
            })
            .unwrap_or(0)
    }

    pub fn has_capture(&self) -> bool {
        self.capture.is_some()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn shared_snapshot(&self) -> Arc<Mutex<SessionSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub fn diagnostics(&self) -> Arc<SessionDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn status_sender(&self) -> broadcast::Sender<SessionStatusEvent> {
        self.status_tx.clone()
    }

    pub fn activity_sender(&self) -> broadcast::Sender<ActivityEvent> {
        self.activity_tx.clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity_tx.subscribe()
    }

    // ── Event handlers ───────────────────────────────────────────────────────

    async fn on_open(&mut self) {
        if self.status != SessionStatus::Connecting {
            debug!(status = %self.status, "ignoring open outside connecting");
            return;
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let handler: FrameHandler = Box::new(move |frame| {
            let _ = frame_tx.send(frame);
        });
        let input = Arc::clone(&self.input);
        let constraints = self.config.capture.clone();

        let opened =
            tokio::task::spawn_blocking(move || CapturePipeline::open(input, constraints, handler))
                .await
                .map_err(|e| CounselError::Other(anyhow::anyhow!("capture open task failed: {e}")))
                .and_then(|r| r);

        match opened {
            Ok(capture) => {
                info!(device_rate = capture.device_sample_rate(), "microphone streaming");
                self.capture = Some(capture);
                self.frames = Some(frame_rx);
                self.set_status(SessionStatus::Connected, None, false);
            }
            Err(e) => {
                error!("failed to open microphone: {e}");
                self.fail(e);
            }
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        if self.status != SessionStatus::Connected {
            debug!(status = %self.status, "ignoring server content");
            return;
        }
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };

        let mut scheduled = 0u64;
        for data in &message.audio {
            match scheduler.enqueue(data) {
                Ok(Some(_)) => scheduled += 1,
                Ok(None) => {}
                Err(CounselError::MalformedInput(e)) => {
                    SessionDiagnostics::add(&self.diagnostics.malformed_frames, 1);
                    warn!("dropping malformed audio frame: {e}");
                }
                Err(e) => warn!("failed to schedule playback: {e}"),
            }
        }

        let mut cancelled = 0usize;
        if message.interrupted {
            cancelled = scheduler.cancel_all();
        }

        SessionDiagnostics::add(&self.diagnostics.units_scheduled, scheduled);
        SessionDiagnostics::add(&self.diagnostics.units_cancelled, cancelled as u64);

        if scheduled > 0 {
            self.set_speaking(true);
        }
        if message.interrupted {
            let dropped = self.drop_pending_frames();
            info!(cancelled, dropped, "assistant interrupted");
            self.set_speaking(false);
        }
        if message.turn_complete {
            debug!("turn complete");
            self.set_speaking(false);
        }
    }

    fn on_frame(&mut self, frame: CapturedFrame) {
        if self.status != SessionStatus::Connected {
            return;
        }
        SessionDiagnostics::add(&self.diagnostics.frames_captured, 1);

        self.is_listening = frame.level.active;
        self.volume = frame.level.volume;
        self.publish_activity(frame.level.rms);

        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.reap_finished();
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.send_realtime_input(&frame.encoded) {
            Ok(()) => SessionDiagnostics::add(&self.diagnostics.frames_sent, 1),
            Err(e) => {
                SessionDiagnostics::add(&self.diagnostics.send_failures, 1);
                warn!("failed to send audio frame: {e}");
            }
        }
    }

    fn on_remote_closed(&mut self) {
        match self.status {
            // A session that never opened was refused, not ended.
            SessionStatus::Connecting => {
                error!("remote closed the session before it was ready");
                self.fail(CounselError::ConnectionFailed(
                    "remote closed the connection before the session was ready".into(),
                ));
            }
            SessionStatus::Connected => {
                info!("remote closed the session");
                self.teardown();
                self.set_status(SessionStatus::Disconnected, None, false);
            }
            _ => {}
        }
    }

    fn on_remote_error(&mut self, message: String) {
        if !matches!(
            self.status,
            SessionStatus::Connecting | SessionStatus::Connected
        ) {
            return;
        }
        error!("session error: {message}");
        self.fail(CounselError::RemoteError(message));
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn open_output(&self) -> Result<PlaybackScheduler> {
        let mut output = self.outputs.create()?;
        output.resume()?;
        Ok(PlaybackScheduler::with_settings(
            output,
            PLAYBACK_SAMPLE_RATE,
            self.config.playback_lead_secs,
        ))
    }

    /// Tear down and move to `error`, handing the error back to the caller.
    fn fail(&mut self, err: CounselError) -> CounselError {
        self.teardown();
        self.set_status(SessionStatus::Error, Some(err.to_string()), false);
        err
    }

    /// Release everything live: playback, microphone, output, session.
    /// Never fails; problems are logged by the owners.
    fn teardown(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            let cancelled = scheduler.cancel_all();
            SessionDiagnostics::add(&self.diagnostics.units_cancelled, cancelled as u64);
        }
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        self.frames = None;
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.close();
        }
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.inbound = None;

        let changed = self.is_speaking || self.is_listening || self.volume != 0.0;
        self.is_speaking = false;
        self.is_listening = false;
        self.volume = 0.0;
        if changed {
            self.publish_activity(0.0);
        }
    }

    fn drop_pending_frames(&mut self) -> usize {
        let mut dropped = 0;
        if let Some(frames) = self.frames.as_mut() {
            while frames.try_recv().is_ok() {
                dropped += 1;
            }
        }
        SessionDiagnostics::add(&self.diagnostics.frames_dropped, dropped as u64);
        dropped
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.is_speaking != speaking {
            self.is_speaking = speaking;
            self.publish_activity(0.0);
        }
    }

    fn publish_activity(&mut self, rms: f32) {
        self.activity_seq += 1;
        {
            let mut snap = self.snapshot.lock();
            snap.is_speaking = self.is_speaking;
            snap.is_listening = self.is_listening;
            snap.volume = self.volume;
        }
        let _ = self.activity_tx.send(ActivityEvent {
            seq: self.activity_seq,
            rms,
            is_listening: self.is_listening,
            is_speaking: self.is_speaking,
            volume: self.volume,
        });
    }

    fn set_status(&mut self, status: SessionStatus, detail: Option<String>, ended: bool) {
        if self.status != status {
            info!(from = %self.status, to = %status, "session status changed");
        }
        self.status = status;
        {
            let mut snap = self.snapshot.lock();
            snap.status = status;
            snap.detail = detail.clone();
        }
        let _ = self.status_tx.send(SessionStatusEvent {
            status,
            detail,
            ended,
        });
    }
}

impl Drop for VoiceSessionController {
    fn drop(&mut self) {
        let live = self.session.is_some() || self.capture.is_some() || self.scheduler.is_some();
        if live || self.status != SessionStatus::Idle {
            self.end();
        }
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
