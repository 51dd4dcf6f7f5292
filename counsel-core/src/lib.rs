//! # counsel-core
//!
//! Real-time voice session engine for the counsel assistant, plus the text
//! chat controller.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → InputDevice → SPSC RingBuffer → framing thread
//!                                                   │ 4096-sample frames
//!                                          FrameLevel + PCM16/base64
//!                                                   │
//!                          VoiceSessionController (tokio task) ──► LiveSession
//!                                                   ▲                   │
//!                                       SessionEvent │ ◄─────────────────┘
//!                                                   ▼
//!                          PlaybackScheduler → AudioOutput (mixer thread) → Speaker
//! ```
//!
//! The audio callbacks never allocate or block; all heap work happens on the
//! framing thread and the controller task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod chat;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod meter;
pub mod playback;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{device::DeviceInfo, MicrophoneInput};
pub use capture::{CaptureConstraints, CapturePipeline, InputDevice};
pub use chat::{ChatBackend, ChatController, ChatMessage, ChatRole, GeminiChat};
pub use engine::{
    ControllerConfig, DiagnosticsSnapshot, VoiceEngine, VoiceEngineHandle, VoiceSessionController,
};
pub use error::CounselError;
pub use ipc::events::{ActivityEvent, SessionSnapshot, SessionStatus, SessionStatusEvent};
pub use playback::{AudioOutput, OutputFactory, PlaybackScheduler};
#[cfg(feature = "audio-cpal")]
pub use playback::SpeakerFactory;
pub use session::{GeminiLiveConnector, LiveConfig, LiveConnector, LiveSession, SessionEvent};
