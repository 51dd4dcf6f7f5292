//! Voice session controller and engine behaviour against in-process doubles.
//!
//! Run with:
//!   cargo test -p counsel-core --test voice_session -- --nocapture

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use counsel_core::{
    buffering::{AudioProducer, Producer},
    capture::{CaptureConstraints, InputDevice, OpenedInput},
    codec::{float_to_pcm16, to_transport_text, EncodedFrame, CAPTURE_SAMPLE_RATE},
    engine::{ControllerConfig, ControllerEvent, VoiceEngine, VoiceSessionController},
    error::{CounselError, Result},
    ipc::events::{SessionStatus, SessionStatusEvent},
    playback::{AudioOutput, OutputFactory, UnitId, DEFAULT_LEAD_TIME_SECS},
    session::{InboundMessage, LiveConfig, LiveConnector, LiveLink, LiveSession, SessionEvent},
};

// ── Doubles ────────────────────────────────────────────────────────────────

/// Remote end of the recording transport: sees every sent frame and lets the
/// test inject inbound events.
#[derive(Default)]
struct Remote {
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    sent: Arc<Mutex<Vec<EncodedFrame>>>,
    closed: Arc<AtomicBool>,
    connects: AtomicUsize,
    fail_with: Mutex<Option<fn() -> CounselError>>,
}

impl Remote {
    fn inject(&self, event: SessionEvent) {
        let events = self.events.lock();
        let tx = events.as_ref().expect("no live session");
        tx.send(event).expect("controller dropped the inbound channel");
    }

    fn sent(&self) -> usize {
        self.sent.lock().len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct RecordingConnector(Arc<Remote>);

#[async_trait]
impl LiveConnector for RecordingConnector {
    async fn connect(&self, _config: &LiveConfig) -> Result<LiveLink> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(fail) = *self.0.fail_with.lock() {
            return Err(fail());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.events.lock() = Some(tx);
        self.0.closed.store(false, Ordering::SeqCst);
        Ok(LiveLink {
            session: Box::new(RecordingSession {
                sent: Arc::clone(&self.0.sent),
                closed: Arc::clone(&self.0.closed),
            }),
            events: rx,
        })
    }
}

struct RecordingSession {
    sent: Arc<Mutex<Vec<EncodedFrame>>>,
    closed: Arc<AtomicBool>,
}

impl LiveSession for RecordingSession {
    fn send_realtime_input(&mut self, frame: &EncodedFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CounselError::ConnectionFailed("closed".into()));
        }
        self.sent.lock().push(frame.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Microphone that delivers `frames` full frames of a constant level at open.
struct ToneInput {
    amplitude: f32,
    frames: usize,
}

impl InputDevice for ToneInput {
    fn open(
        &self,
        constraints: &CaptureConstraints,
        mut producer: AudioProducer,
        _running: Arc<AtomicBool>,
    ) -> Result<OpenedInput> {
        producer.push_slice(&vec![self.amplitude; constraints.frame_len * self.frames]);
        Ok(OpenedInput {
            sample_rate: CAPTURE_SAMPLE_RATE,
            stream: Box::new(producer),
        })
    }
}

struct NoMicrophone;

impl InputDevice for NoMicrophone {
    fn open(
        &self,
        _constraints: &CaptureConstraints,
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
    ) -> Result<OpenedInput> {
        Err(CounselError::DeviceUnavailable("permission denied".into()))
    }
}

#[derive(Default)]
struct OutputLog {
    clock: f64,
    resumed: bool,
    closed: bool,
    scheduled: Vec<(UnitId, f64, usize)>,
    stopped: Vec<UnitId>,
}

/// Output whose clock only moves when the test sets it.
struct ManualOutput(Arc<Mutex<OutputLog>>);

impl AudioOutput for ManualOutput {
    fn resume(&mut self) -> Result<()> {
        self.0.lock().resumed = true;
        Ok(())
    }

    fn now(&self) -> f64 {
        self.0.lock().clock
    }

    fn schedule(
        &mut self,
        id: UnitId,
        samples: Arc<[f32]>,
        _sample_rate: u32,
        start_at: f64,
    ) -> Result<()> {
        self.0.lock().scheduled.push((id, start_at, samples.len()));
        Ok(())
    }

    fn stop(&mut self, id: UnitId) -> Result<()> {
        self.0.lock().stopped.push(id);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.0.lock().closed = true;
        Ok(())
    }
}

struct ManualOutputs(Arc<Mutex<OutputLog>>);

impl OutputFactory for ManualOutputs {
    fn create(&self) -> Result<Box<dyn AudioOutput>> {
        let mut log = self.0.lock();
        log.closed = false;
        log.resumed = false;
        Ok(Box::new(ManualOutput(Arc::clone(&self.0))))
    }
}

struct Rig {
    controller: VoiceSessionController,
    remote: Arc<Remote>,
    output: Arc<Mutex<OutputLog>>,
}

fn rig(input: Arc<dyn InputDevice>) -> Rig {
    let remote = Arc::new(Remote::default());
    let output = Arc::new(Mutex::new(OutputLog::default()));
    let controller = VoiceSessionController::new(
        ControllerConfig::new(LiveConfig::audio("test-model", "Kore", "be kind")),
        Arc::new(RecordingConnector(Arc::clone(&remote))),
        input,
        Arc::new(ManualOutputs(Arc::clone(&output))),
    );
    Rig {
        controller,
        remote,
        output,
    }
}

fn quiet_rig() -> Rig {
    rig(Arc::new(ToneInput {
        amplitude: 0.0,
        frames: 0,
    }))
}

/// Base64 PCM16 of `secs` seconds at 24 kHz.
fn speech(secs: f64) -> String {
    let n = (secs * 24_000.0).round() as usize;
    to_transport_text(&float_to_pcm16(&vec![0.2; n]))
}

fn audio(frames: &[String]) -> ControllerEvent {
    ControllerEvent::Session(SessionEvent::Message(InboundMessage {
        audio: frames.to_vec(),
        ..Default::default()
    }))
}

fn flags(interrupted: bool, turn_complete: bool, frames: &[String]) -> ControllerEvent {
    ControllerEvent::Session(SessionEvent::Message(InboundMessage {
        audio: frames.to_vec(),
        interrupted,
        turn_complete,
    }))
}

async fn connected(rig: &mut Rig) {
    rig.controller.start().await.expect("start");
    rig.controller
        .handle(ControllerEvent::Session(SessionEvent::Open))
        .await;
    assert_eq!(rig.controller.status(), SessionStatus::Connected);
}

async fn wait_for_status(
    rx: &mut broadcast::Receiver<SessionStatusEvent>,
    want: SessionStatus,
) -> SessionStatusEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.status == want => return event,
                Ok(_) => continue,
                Err(e) => panic!("status channel failed: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want}"))
}

// ── State machine ──────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_connecting_connected_disconnected() {
    let mut rig = quiet_rig();
    assert_eq!(rig.controller.status(), SessionStatus::Idle);

    rig.controller.start().await.unwrap();
    assert_eq!(rig.controller.status(), SessionStatus::Connecting);
    assert!(rig.output.lock().resumed, "output must be resumed before connecting");
    assert_eq!(rig.remote.connects.load(Ordering::SeqCst), 1);
    assert!(!rig.controller.has_capture());

    rig.controller
        .handle(ControllerEvent::Session(SessionEvent::Open))
        .await;
    assert_eq!(rig.controller.status(), SessionStatus::Connected);
    assert!(rig.controller.has_capture());

    rig.controller
        .handle(ControllerEvent::Session(SessionEvent::Closed))
        .await;
    assert_eq!(rig.controller.status(), SessionStatus::Disconnected);
    assert!(!rig.controller.has_capture());
    assert!(!rig.controller.has_session());
    assert!(rig.remote.is_closed());
    assert!(rig.output.lock().closed);
}

#[tokio::test]
async fn close_before_setup_is_connection_failed() {
    for gone in [
        ControllerEvent::Session(SessionEvent::Closed),
        ControllerEvent::SessionGone,
    ] {
        let mut rig = quiet_rig();
        rig.controller.start().await.unwrap();
        assert_eq!(rig.controller.status(), SessionStatus::Connecting);

        rig.controller.handle(gone).await;
        assert_eq!(rig.controller.status(), SessionStatus::Error);
        let detail = rig.controller.shared_snapshot().lock().detail.clone();
        assert!(detail.unwrap_or_default().contains("before the session was ready"));
        assert!(!rig.controller.has_session());
        assert!(rig.remote.is_closed());
        assert!(rig.output.lock().closed);

        // Refused sessions are retryable like any other connection failure.
        rig.controller.start().await.unwrap();
        assert_eq!(rig.controller.status(), SessionStatus::Connecting);
    }
}

#[tokio::test]
async fn start_while_active_is_rejected() {
    let mut rig = quiet_rig();
    rig.controller.start().await.unwrap();
    assert!(matches!(
        rig.controller.start().await,
        Err(CounselError::AlreadyActive)
    ));

    rig.controller
        .handle(ControllerEvent::Session(SessionEvent::Open))
        .await;
    assert!(matches!(
        rig.controller.start().await,
        Err(CounselError::AlreadyActive)
    ));
    assert_eq!(rig.controller.status(), SessionStatus::Connected);
    assert_eq!(rig.remote.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_credential_is_an_error_state_that_can_be_retried() {
    let mut rig = quiet_rig();
    *rig.remote.fail_with.lock() = Some(|| CounselError::CredentialMissing);

    assert!(matches!(
        rig.controller.start().await,
        Err(CounselError::CredentialMissing)
    ));
    assert_eq!(rig.controller.status(), SessionStatus::Error);
    assert!(rig.output.lock().closed, "output opened for the attempt must be released");

    *rig.remote.fail_with.lock() = None;
    rig.controller.start().await.unwrap();
    assert_eq!(rig.controller.status(), SessionStatus::Connecting);
}

#[tokio::test]
async fn unreachable_remote_is_connection_failed() {
    let mut rig = quiet_rig();
    *rig.remote.fail_with.lock() = Some(|| CounselError::ConnectionFailed("refused".into()));

    let err = rig.controller.start().await.err().expect("start should fail");
    assert!(err.is_retryable());
    let snapshot = rig.controller.shared_snapshot().lock().clone();
    assert_eq!(snapshot.status, SessionStatus::Error);
    assert!(snapshot.detail.unwrap_or_default().contains("refused"));
}

#[tokio::test]
async fn microphone_failure_after_open_tears_down() {
    let mut rig = rig(Arc::new(NoMicrophone));
    rig.controller.start().await.unwrap();
    rig.controller
        .handle(ControllerEvent::Session(SessionEvent::Open))
        .await;

    assert_eq!(rig.controller.status(), SessionStatus::Error);
    let detail = rig.controller.shared_snapshot().lock().detail.clone();
    assert!(detail.unwrap_or_default().contains("permission denied"));
    assert!(rig.remote.is_closed());
    assert!(rig.output.lock().closed);
}

#[tokio::test]
async fn remote_error_moves_to_error() {
    let mut rig = quiet_rig();
    connected(&mut rig).await;

    rig.controller
        .handle(ControllerEvent::Session(SessionEvent::Error("quota exceeded".into())))
        .await;
    assert_eq!(rig.controller.status(), SessionStatus::Error);
    assert!(!rig.controller.has_capture());
    let detail = rig.controller.shared_snapshot().lock().detail.clone();
    assert!(detail.unwrap_or_default().contains("quota exceeded"));
}

#[tokio::test]
async fn end_works_from_every_state_and_twice() {
    let mut rig = quiet_rig();
    let mut status_rx = rig.controller.subscribe_status();

    rig.controller.end();
    assert_eq!(rig.controller.status(), SessionStatus::Idle);

    rig.controller.start().await.unwrap();
    rig.controller.end();
    assert_eq!(rig.controller.status(), SessionStatus::Idle);
    assert!(rig.remote.is_closed());

    connected(&mut rig).await;
    rig.controller.end();
    rig.controller.end();
    assert_eq!(rig.controller.status(), SessionStatus::Idle);
    assert!(!rig.controller.has_capture());
    assert!(!rig.controller.has_session());
    assert!(rig.output.lock().closed);

    let mut ended = 0;
    while let Ok(event) = status_rx.try_recv() {
        if event.ended {
            assert_eq!(event.status, SessionStatus::Idle);
            ended += 1;
        }
    }
    assert_eq!(ended, 4);
}

#[tokio::test]
async fn dropping_the_controller_releases_everything() {
    let mut rig = quiet_rig();
    connected(&mut rig).await;
    let Rig {
        controller,
        remote,
        output,
    } = rig;
    drop(controller);
    assert!(remote.is_closed());
    assert!(output.lock().closed);
}

// ── Playback ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn inbound_audio_is_scheduled_back_to_back() {
    let mut rig = quiet_rig();
    connected(&mut rig).await;

    rig.controller
        .handle(audio(&[speech(0.5), speech(0.3)]))
        .await;
    rig.controller.handle(audio(&[speech(0.2)])).await;
    assert!(rig.controller.is_speaking());
    assert_eq!(rig.controller.pending_playback(), 3);

    let starts: Vec<f64> = rig.output.lock().scheduled.iter().map(|s| s.1).collect();
    let t0 = DEFAULT_LEAD_TIME_SECS;
    assert!((starts[0] - t0).abs() < 1e-9);
    assert!((starts[1] - (t0 + 0.5)).abs() < 1e-9);
    assert!((starts[2] - (t0 + 0.8)).abs() < 1e-9);

    rig.controller.handle(flags(false, true, &[])).await;
    assert!(!rig.controller.is_speaking());
    assert_eq!(rig.controller.pending_playback(), 3, "turn complete lets audio finish");
}

#[tokio::test]
async fn interrupted_stops_playback_and_resets_the_cursor() {
    let mut rig = quiet_rig();
    connected(&mut rig).await;

    rig.controller
        .handle(audio(&[speech(0.5), speech(0.5)]))
        .await;
    assert!(rig.controller.is_speaking());
    rig.output.lock().clock = 0.3;

    rig.controller.handle(flags(true, false, &[])).await;
    assert!(!rig.controller.is_speaking());
    assert_eq!(rig.controller.pending_playback(), 0);
    assert_eq!(rig.output.lock().stopped.len(), 2);

    rig.controller.handle(audio(&[speech(0.1)])).await;
    let last_start = rig.output.lock().scheduled.last().map(|s| s.1).unwrap();
    assert!((last_start - (0.3 + DEFAULT_LEAD_TIME_SECS)).abs() < 1e-9);
}

#[tokio::test]
async fn one_message_applies_audio_then_interrupt_then_turn_complete() {
    let mut rig = quiet_rig();
    connected(&mut rig).await;

    rig.controller.handle(flags(true, false, &[speech(0.2)])).await;
    assert_eq!(rig.controller.pending_playback(), 0);
    assert!(!rig.controller.is_speaking());

    rig.controller.handle(flags(false, true, &[speech(0.2)])).await;
    assert_eq!(rig.controller.pending_playback(), 1);
    assert!(!rig.controller.is_speaking());

    let diag = rig.controller.diagnostics().snapshot();
    assert_eq!(diag.units_scheduled, 2);
    assert_eq!(diag.units_cancelled, 1);
}

#[tokio::test]
async fn malformed_audio_is_dropped_and_the_session_continues() {
    let mut rig = quiet_rig();
    connected(&mut rig).await;

    rig.controller
        .handle(audio(&["not base64!".to_string(), "AAAA".to_string(), speech(0.1)]))
        .await;
    assert_eq!(rig.controller.status(), SessionStatus::Connected);
    assert_eq!(rig.controller.pending_playback(), 1);
    assert!(rig.controller.is_speaking());
    assert_eq!(rig.controller.diagnostics().snapshot().malformed_frames, 2);
}

#[tokio::test]
async fn audio_before_connected_is_ignored() {
    let mut rig = quiet_rig();
    rig.controller.start().await.unwrap();
    rig.controller.handle(audio(&[speech(0.1)])).await;
    assert_eq!(rig.controller.pending_playback(), 0);
    assert!(!rig.controller.is_speaking());
}

// ── Capture ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn captured_frames_are_sent_and_drive_activity() {
    let mut rig = rig(Arc::new(ToneInput {
        amplitude: 0.5,
        frames: 2,
    }));
    let mut activity_rx = rig.controller.subscribe_activity();
    connected(&mut rig).await;

    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(2), rig.controller.next_event())
            .await
            .expect("capture frame");
        assert!(matches!(event, ControllerEvent::Frame(_)));
        rig.controller.handle(event).await;
    }

    assert_eq!(rig.remote.sent(), 2);
    let first = rig.remote.sent.lock()[0].clone();
    assert_eq!(first.mime_type(), "audio/pcm;rate=16000");
    assert_eq!(first.sample_count(), 4096);

    assert!(rig.controller.is_listening());
    assert!((rig.controller.volume() - 1.0).abs() < 1e-6);

    let event = activity_rx.try_recv().expect("activity event");
    assert!(event.is_listening);
    assert!((event.rms - 0.5).abs() < 1e-3);
    assert_eq!(rig.controller.diagnostics().snapshot().frames_sent, 2);
}

#[tokio::test]
async fn interruption_drops_frames_not_yet_sent() {
    let mut rig = rig(Arc::new(ToneInput {
        amplitude: 0.3,
        frames: 3,
    }));
    connected(&mut rig).await;

    // Let the framing thread deliver everything before the interrupt lands.
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.controller.handle(flags(true, false, &[])).await;

    let diag = rig.controller.diagnostics().snapshot();
    assert_eq!(diag.frames_dropped, 3);
    assert_eq!(diag.frames_sent, 0);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rig.controller.next_event())
            .await
            .is_err()
    );
    assert_eq!(rig.remote.sent(), 0);
}

// ── Engine handle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn engine_handle_runs_a_full_session() {
    let Rig {
        controller,
        remote,
        output,
    } = rig(Arc::new(ToneInput {
        amplitude: 0.4,
        frames: 1,
    }));
    let engine = VoiceEngine::spawn(controller);
    let mut status_rx = engine.subscribe_status();
    let mut activity_rx = engine.subscribe_activity();

    engine.start().await.unwrap();
    assert_eq!(engine.status(), SessionStatus::Connecting);
    assert!(matches!(engine.start().await, Err(CounselError::AlreadyActive)));

    remote.inject(SessionEvent::Open);
    wait_for_status(&mut status_rx, SessionStatus::Connected).await;

    remote.inject(SessionEvent::Message(InboundMessage {
        audio: vec![speech(0.2)],
        ..Default::default()
    }));
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(event) = activity_rx.recv().await {
                if event.is_speaking {
                    break;
                }
            }
        }
    })
    .await
    .expect("speaking activity");
    assert!(engine.snapshot().is_speaking);

    tokio::time::timeout(Duration::from_secs(2), async {
        while remote.sent() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("captured frame forwarded");

    engine.end().await;
    let ended = wait_for_status(&mut status_rx, SessionStatus::Idle).await;
    assert!(ended.ended);
    assert_eq!(engine.status(), SessionStatus::Idle);
    assert!(remote.is_closed());
    assert!(output.lock().closed);
    assert_eq!(engine.diagnostics().units_scheduled, 1);
}

#[tokio::test]
async fn engine_reports_remote_close_as_disconnected() {
    let Rig {
        controller, remote, ..
    } = quiet_rig();
    let engine = VoiceEngine::spawn(controller);
    let mut status_rx = engine.subscribe_status();

    engine.start().await.unwrap();
    remote.inject(SessionEvent::Open);
    wait_for_status(&mut status_rx, SessionStatus::Connected).await;

    remote.inject(SessionEvent::Closed);
    let event = wait_for_status(&mut status_rx, SessionStatus::Disconnected).await;
    assert!(!event.ended);

    // Retry after a remote close is allowed.
    engine.start().await.unwrap();
    assert_eq!(remote.connects.load(Ordering::SeqCst), 2);
    engine.end().await;
}
