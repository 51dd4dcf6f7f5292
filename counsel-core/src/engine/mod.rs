//! `VoiceEngine`: runs a [`VoiceSessionController`] as a single tokio task.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceEngine::spawn(controller) ─► VoiceEngineHandle
//!     └─► start()   → output opened, transport connecting, status = Connecting
//!         └─► (remote Open) → microphone streaming, status = Connected
//!             └─► end()     → teardown, status = Idle, ended notification
//! ```
//!
//! ## Threading
//!
//! The task multiplexes host commands, inbound session events and capture
//! frames with `tokio::select!`, so controller state is only ever touched
//! from that one task. The handle is cheap to clone; status, snapshot and
//! diagnostics are read without going through the task.

pub mod controller;
pub mod diagnostics;

pub use controller::{ControllerConfig, ControllerEvent, VoiceSessionController};
pub use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::{
    error::{CounselError, Result},
    ipc::events::{ActivityEvent, SessionSnapshot, SessionStatus, SessionStatusEvent},
};

enum Command {
    Start { reply: oneshot::Sender<Result<()>> },
    End { reply: oneshot::Sender<()> },
}

enum Step {
    Command(Option<Command>),
    Event(ControllerEvent),
}

enum StartOutcome {
    Finished(Result<()>),
    /// `end()` arrived while the transport was still connecting.
    Ended(oneshot::Sender<()>),
    Shutdown,
}

pub struct VoiceEngine;

impl VoiceEngine {
    /// Move `controller` onto its own task. Must be called inside a tokio runtime.
    ///
    /// The task ends, tearing the session down, once every handle is dropped.
    pub fn spawn(controller: VoiceSessionController) -> VoiceEngineHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = VoiceEngineHandle {
            commands: commands_tx,
            snapshot: controller.shared_snapshot(),
            status_tx: controller.status_sender(),
            activity_tx: controller.activity_sender(),
            diagnostics: controller.diagnostics(),
        };
        tokio::spawn(run(controller, commands_rx));
        handle
    }
}

async fn run(mut controller: VoiceSessionController, mut commands: mpsc::UnboundedReceiver<Command>) {
    info!("voice engine started");
    loop {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            event = controller.next_event() => Step::Event(event),
        };

        match step {
            Step::Command(None) => break,
            Step::Command(Some(Command::Start { reply })) => {
                match start_interruptible(&mut controller, &mut commands).await {
                    StartOutcome::Finished(result) => {
                        let _ = reply.send(result);
                    }
                    StartOutcome::Ended(end_reply) => {
                        controller.end();
                        let _ = reply.send(Err(CounselError::ConnectionFailed(
                            "session ended while connecting".into(),
                        )));
                        let _ = end_reply.send(());
                    }
                    StartOutcome::Shutdown => {
                        let _ = reply.send(Err(CounselError::ConnectionFailed(
                            "voice engine shut down".into(),
                        )));
                        break;
                    }
                }
            }
            Step::Command(Some(Command::End { reply })) => {
                controller.end();
                let _ = reply.send(());
            }
            Step::Event(event) => controller.handle(event).await,
        }
    }

    controller.end();
    debug!("voice engine stopped");
}

/// Drive `start()` while still answering commands, so `end()` can abandon
/// a connection attempt.
async fn start_interruptible(
    controller: &mut VoiceSessionController,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> StartOutcome {
    let start = controller.start();
    tokio::pin!(start);
    loop {
        tokio::select! {
            result = &mut start => return StartOutcome::Finished(result),
            command = commands.recv() => match command {
                Some(Command::Start { reply }) => {
                    let _ = reply.send(Err(CounselError::AlreadyActive));
                }
                Some(Command::End { reply }) => return StartOutcome::Ended(reply),
                None => return StartOutcome::Shutdown,
            },
        }
    }
}

/// Host-side handle to a running [`VoiceEngine`].
#[derive(Clone)]
pub struct VoiceEngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl VoiceEngineHandle {
    /// Start a session. Resolves once the transport is connected (status
    /// `connecting`); `connected` follows when the remote is ready.
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { reply })
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    /// End the session from any state. Resolves after teardown.
    pub async fn end(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::End { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.lock().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity_tx.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

fn engine_gone() -> CounselError {
    CounselError::Other(anyhow::anyhow!("voice engine task has stopped"))
}
