//! Gemini Live (`BidiGenerateContent`) WebSocket adapter.
//!
//! ## Protocol
//!
//! 1. Connect and send the `setup` message (model, audio modality, voice,
//!    system instruction).
//! 2. Wait for `setupComplete`, then report [`SessionEvent::Open`].
//! 3. Stream microphone frames as `realtimeInput.mediaChunks`; receive
//!    `serverContent` carrying audio parts and turn/interrupt flags.
//! 4. Close with a WebSocket close frame.
//!
//! The server may deliver JSON control messages inside binary frames, so
//! binary payloads starting with `{` are parsed as JSON too.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::{tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{InboundMessage, LiveConfig, LiveConnector, LiveLink, LiveSession, SessionEvent};
use crate::codec::EncodedFrame;
use crate::error::{CounselError, Result};

pub const GEMINI_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Outbound wire types ────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupPayload {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: String,
    data: &'a str,
}

fn qualified_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

fn build_setup_message(config: &LiveConfig) -> SetupMessage {
    let instruction = config.system_instruction.trim();
    SetupMessage {
        setup: SetupPayload {
            model: qualified_model(&config.model),
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality.clone()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: (!instruction.is_empty()).then(|| Content {
                parts: vec![TextPart {
                    text: instruction.to_string(),
                }],
            }),
        },
    }
}

fn build_audio_message(frame: &EncodedFrame) -> RealtimeInputMessage<'_> {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: [MediaChunk {
                mime_type: frame.mime_type(),
                data: &frame.data,
            }],
        },
    }
}

// ── Inbound wire types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    error: Option<ServerError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct ServerError {
    message: Option<String>,
}

/// What one server message means to the session.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedServerMessage {
    pub setup_complete: bool,
    pub content: Option<InboundMessage>,
    pub error: Option<String>,
}

/// Parse one JSON server message.
///
/// # Errors
/// `MalformedInput` when the text is not a JSON object of the expected shape.
pub fn parse_server_message(json: &str) -> Result<ParsedServerMessage> {
    let msg: ServerMessage = serde_json::from_str(json)
        .map_err(|e| CounselError::MalformedInput(format!("server message: {e}")))?;

    let content = msg.server_content.map(|c| InboundMessage {
        audio: c
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.inline_data)
                    .map(|d| d.data)
                    .filter(|d| !d.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        interrupted: c.interrupted,
        turn_complete: c.turn_complete,
    });

    Ok(ParsedServerMessage {
        setup_complete: msg.setup_complete.is_some(),
        content: content.filter(|c| !c.is_empty()),
        error: msg
            .error
            .map(|e| e.message.unwrap_or_else(|| "unknown server error".into())),
    })
}

/// JSON text carried by a frame, whether it arrived as text or binary.
fn frame_json(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

// ── Connector ──────────────────────────────────────────────────────

/// Connects voice sessions to Gemini Live.
#[derive(Clone)]
pub struct GeminiLiveConnector {
    api_key: Option<String>,
    endpoint: String,
}

impl std::fmt::Debug for GeminiLiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveConnector")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl GeminiLiveConnector {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            endpoint: GEMINI_LIVE_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, config: &LiveConfig) -> Result<LiveLink> {
        let key = self.api_key.as_deref().ok_or(CounselError::CredentialMissing)?;
        let url = format!("{}?key={}", self.endpoint, key.trim());

        info!(model = %config.model, voice = %config.voice_name, "connecting to Gemini Live");

        let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| CounselError::ConnectionFailed(e.to_string()))?;

        let setup = serde_json::to_string(&build_setup_message(config))
            .map_err(|e| CounselError::Other(e.into()))?;
        debug!(bytes = setup.len(), "sending setup message");
        ws.send(WsMessage::Text(setup.into()))
            .await
            .map_err(|e| CounselError::ConnectionFailed(format!("failed to send setup: {e}")))?;

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(stream, event_tx));

        Ok(LiveLink {
            session: Box::new(GeminiLiveSession {
                outbound: outbound_tx,
                closed: false,
                frames_sent: 0,
            }),
            events: event_rx,
        })
    }
}

enum Outbound {
    Json(String),
    Close,
}

struct GeminiLiveSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: bool,
    frames_sent: u64,
}

impl LiveSession for GeminiLiveSession {
    fn send_realtime_input(&mut self, frame: &EncodedFrame) -> Result<()> {
        if self.closed {
            return Err(CounselError::ConnectionFailed("session is closed".into()));
        }
        let json = serde_json::to_string(&build_audio_message(frame))
            .map_err(|e| CounselError::Other(e.into()))?;
        self.outbound
            .send(Outbound::Json(json))
            .map_err(|_| CounselError::ConnectionFailed("session writer has stopped".into()))?;

        self.frames_sent += 1;
        if self.frames_sent == 1 || self.frames_sent % 50 == 0 {
            debug!(frames_sent = self.frames_sent, "audio frame queued");
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, WsMessage>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Json(json) => {
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    warn!("websocket send failed, stopping writer: {e}");
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
    debug!("session writer stopped");
}

/// Map a remote close onto a session event.
///
/// Closing before `setupComplete` is how the service rejects a bad key or
/// model, so it is an error. After setup only `Normal`/`Away` count as clean.
fn close_event(frame: Option<&CloseFrame>, opened: bool) -> SessionEvent {
    let reason = frame
        .map(|f| f.reason.as_str().trim())
        .filter(|r| !r.is_empty())
        .unwrap_or("no reason given");
    if !opened {
        return SessionEvent::Error(format!("connection closed before setupComplete: {reason}"));
    }
    match frame.map(|f| f.code) {
        None | Some(CloseCode::Normal) | Some(CloseCode::Away) => SessionEvent::Closed,
        Some(code) => SessionEvent::Error(format!(
            "session closed with code {}: {reason}",
            u16::from(code)
        )),
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::UnboundedSender<SessionEvent>) {
    let setup_deadline = tokio::time::Instant::now() + SETUP_TIMEOUT;
    let mut opened = false;
    let mut audio_parts: u64 = 0;

    loop {
        let next = if opened {
            stream.next().await
        } else {
            match tokio::time::timeout_at(setup_deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let _ = events.send(SessionEvent::Error(format!(
                        "no setupComplete within {}s",
                        SETUP_TIMEOUT.as_secs()
                    )));
                    return;
                }
            }
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                let _ = events.send(SessionEvent::Error(e.to_string()));
                return;
            }
            None => {
                let _ = events.send(close_event(None, opened));
                return;
            }
        };

        if let WsMessage::Close(frame) = &msg {
            info!(?frame, opened, "remote closed the session");
            let _ = events.send(close_event(frame.as_ref(), opened));
            return;
        }

        let Some(json) = frame_json(&msg) else {
            continue;
        };
        let parsed = match parse_server_message(json) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("ignoring unparseable server message: {e}");
                continue;
            }
        };

        if parsed.setup_complete && !opened {
            opened = true;
            info!("Gemini Live setup complete");
            if events.send(SessionEvent::Open).is_err() {
                return;
            }
        }
        if let Some(content) = parsed.content {
            audio_parts += content.audio.len() as u64;
            debug!(
                audio = content.audio.len(),
                total_audio = audio_parts,
                interrupted = content.interrupted,
                turn_complete = content.turn_complete,
                "server content"
            );
            if events.send(SessionEvent::Message(content)).is_err() {
                return;
            }
        }
        if let Some(message) = parsed.error {
            let _ = events.send(SessionEvent::Error(message));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_message_has_the_wire_shape() {
        let config = LiveConfig::audio("gemini-live-test", "Kore", "Be kind.");
        let json = serde_json::to_value(build_setup_message(&config)).unwrap();
        assert_eq!(json["setup"]["model"], "models/gemini-live-test");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "Be kind.");
    }

    #[test]
    fn blank_instruction_is_omitted() {
        let config = LiveConfig::audio("models/m", "Kore", "  ");
        let json = serde_json::to_value(build_setup_message(&config)).unwrap();
        assert_eq!(json["setup"]["model"], "models/m");
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn audio_message_uses_media_chunks() {
        let frame = EncodedFrame {
            data: "AAA=".into(),
            sample_rate: 16_000,
        };
        let json = serde_json::to_value(build_audio_message(&frame)).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAA=");
    }

    #[test]
    fn parses_audio_and_flags_from_one_message() {
        let parsed = parse_server_message(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}},
                {"text":"hi"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"BBBB"}}
            ]},"interrupted":true,"turnComplete":true}}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.content,
            Some(InboundMessage {
                audio: vec!["AAAA".into(), "BBBB".into()],
                interrupted: true,
                turn_complete: true,
            })
        );
        assert!(!parsed.setup_complete);
    }

    #[test]
    fn parses_setup_complete_and_errors() {
        let parsed = parse_server_message(r#"{"setupComplete":{}}"#).unwrap();
        assert!(parsed.setup_complete);
        assert_eq!(parsed.content, None);

        let parsed = parse_server_message(r#"{"error":{"message":"quota"}}"#).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("quota"));

        assert!(matches!(
            parse_server_message("not json"),
            Err(CounselError::MalformedInput(_))
        ));
    }

    #[test]
    fn binary_frames_carrying_json_are_read() {
        let msg = WsMessage::Binary(br#"{"setupComplete":{}}"#.to_vec().into());
        assert_eq!(frame_json(&msg), Some(r#"{"setupComplete":{}}"#));
        let raw = WsMessage::Binary(vec![0u8, 1, 2].into());
        assert_eq!(frame_json(&raw), None);
    }

    #[tokio::test]
    async fn connect_without_key_is_credential_missing() {
        let connector = GeminiLiveConnector::new(Some("   ".into()));
        let config = LiveConfig::audio("m", "v", "");
        assert!(matches!(
            connector.connect(&config).await,
            Err(CounselError::CredentialMissing)
        ));
    }

    fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame {
        CloseFrame {
            code,
            reason: reason.into(),
        }
    }

    #[test]
    fn close_before_setup_is_an_error() {
        let frame = close_frame(CloseCode::Policy, "API key not valid");
        assert_eq!(
            close_event(Some(&frame), false),
            SessionEvent::Error("connection closed before setupComplete: API key not valid".into())
        );
        assert!(matches!(close_event(None, false), SessionEvent::Error(_)));
        let normal = close_frame(CloseCode::Normal, "");
        assert!(matches!(close_event(Some(&normal), false), SessionEvent::Error(_)));
    }

    #[test]
    fn close_codes_after_setup() {
        assert_eq!(close_event(None, true), SessionEvent::Closed);
        assert_eq!(
            close_event(Some(&close_frame(CloseCode::Normal, "bye")), true),
            SessionEvent::Closed
        );
        assert_eq!(
            close_event(Some(&close_frame(CloseCode::Away, "")), true),
            SessionEvent::Closed
        );
        assert_eq!(
            close_event(Some(&close_frame(CloseCode::Error, "internal")), true),
            SessionEvent::Error("session closed with code 1011: internal".into())
        );
        assert_eq!(
            close_event(Some(&close_frame(CloseCode::Policy, "")), true),
            SessionEvent::Error("session closed with code 1008: no reason given".into())
        );
    }

    /// One-connection WebSocket server: reads the setup message, optionally
    /// acknowledges it, then closes with `frame`.
    async fn closing_server(ack_setup: bool, frame: CloseFrame) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let setup = ws.next().await.unwrap().unwrap();
            assert!(setup.to_text().unwrap().contains("\"setup\""));
            if ack_setup {
                ws.send(WsMessage::Text(r#"{"setupComplete":{}}"#.into()))
                    .await
                    .unwrap();
            }
            ws.close(Some(frame)).await.unwrap();
            while ws.next().await.is_some() {}
        });
        format!("ws://{addr}/live")
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("event stream open")
    }

    #[tokio::test]
    async fn rejected_setup_surfaces_as_error() {
        let endpoint =
            closing_server(false, close_frame(CloseCode::Policy, "API key not valid")).await;
        let connector = GeminiLiveConnector::new(Some("bad-key".into())).with_endpoint(endpoint);
        let mut link = connector
            .connect(&LiveConfig::audio("m", "Kore", ""))
            .await
            .unwrap();

        match next_event(&mut link.events).await {
            SessionEvent::Error(detail) => assert!(detail.contains("API key not valid"), "{detail}"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn normal_close_after_setup_is_clean() {
        let endpoint = closing_server(true, close_frame(CloseCode::Normal, "done")).await;
        let connector = GeminiLiveConnector::new(Some("k".into())).with_endpoint(endpoint);
        let mut link = connector
            .connect(&LiveConfig::audio("m", "Kore", ""))
            .await
            .unwrap();

        assert_eq!(next_event(&mut link.events).await, SessionEvent::Open);
        assert_eq!(next_event(&mut link.events).await, SessionEvent::Closed);
    }
}
