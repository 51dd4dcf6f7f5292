mod cli;
mod settings;

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use counsel_core::{
    audio::device::list_input_devices,
    capture::CaptureConstraints,
    chat::{ChatController, GeminiChat},
    engine::{ControllerConfig, VoiceEngine, VoiceSessionController},
    ipc::events::{ActivityEvent, SessionStatus},
    session::{GeminiLiveConnector, LiveConfig},
    MicrophoneInput, SpeakerFactory,
};

use cli::{Cli, Commands};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let app_settings = load_settings(&settings_path);
    info!(
        settings_path = %settings_path.display(),
        live_model = %app_settings.live_model,
        chat_model = %app_settings.chat_model,
        voice = %app_settings.voice_name,
        "settings loaded"
    );

    match cli.command {
        Commands::Voice { device, voice } => run_voice(app_settings, device, voice).await,
        Commands::Chat => run_chat(app_settings).await,
        Commands::Devices { json } => list_devices(json),
        Commands::Config { write } => show_config(&settings_path, &app_settings, write),
    }
}

// ── voice ─────────────────────────────────────────────────────────────────

fn build_controller(
    settings: &AppSettings,
    device: Option<String>,
    voice: Option<String>,
) -> VoiceSessionController {
    let api_key = settings.resolve_api_key().map(|(key, _)| key);
    let live = LiveConfig::audio(
        settings.live_model.clone(),
        voice.unwrap_or_else(|| settings.voice_name.clone()),
        settings.persona.clone(),
    );
    let config = ControllerConfig {
        live,
        capture: CaptureConstraints {
            activity_threshold: settings.activity_threshold,
            volume_gain: settings.volume_gain,
            ..CaptureConstraints::default()
        },
        playback_lead_secs: f64::from(settings.playback_lead_ms) / 1000.0,
    };

    VoiceSessionController::new(
        config,
        Arc::new(GeminiLiveConnector::new(api_key)),
        Arc::new(MicrophoneInput::new(
            device.or_else(|| settings.preferred_input_device.clone()),
        )),
        Arc::new(SpeakerFactory::default()),
    )
}

async fn run_voice(
    settings: AppSettings,
    device: Option<String>,
    voice: Option<String>,
) -> anyhow::Result<()> {
    let engine = VoiceEngine::spawn(build_controller(&settings, device, voice));
    let mut status_rx = engine.subscribe_status();
    let mut activity_rx = engine.subscribe_activity();

    if let Err(e) = engine.start().await {
        engine.end().await;
        bail!("could not start voice session: {e}");
    }
    println!("Connecting... press Ctrl-C to end the session.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut indicator = ActivityLine::default();
    let mut failure = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                info!("ending session on Ctrl-C");
                break;
            }
            status = status_rx.recv() => match status {
                Ok(event) => {
                    match &event.detail {
                        Some(detail) => println!("[{}] {detail}", event.status),
                        None => println!("[{}]", event.status),
                    }
                    match event.status {
                        SessionStatus::Connected => println!("Listening. Speak whenever you are ready."),
                        SessionStatus::Error => {
                            failure = event.detail.clone();
                            break;
                        }
                        SessionStatus::Disconnected => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "status events lagged"),
                Err(RecvError::Closed) => break,
            },
            activity = activity_rx.recv() => match activity {
                Ok(event) => indicator.update(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.end().await;
    let diag = engine.diagnostics();
    info!(
        frames_sent = diag.frames_sent,
        frames_dropped = diag.frames_dropped,
        units_scheduled = diag.units_scheduled,
        units_cancelled = diag.units_cancelled,
        malformed_frames = diag.malformed_frames,
        "session summary"
    );

    match failure {
        Some(detail) => bail!("voice session failed: {detail}"),
        None => Ok(()),
    }
}

/// Prints a line whenever listening/speaking flips, with a level bar.
#[derive(Default)]
struct ActivityLine {
    last: Option<(bool, bool)>,
}

impl ActivityLine {
    fn update(&mut self, event: &ActivityEvent) {
        let state = (event.is_listening, event.is_speaking);
        if self.last == Some(state) {
            return;
        }
        self.last = Some(state);

        let label = match state {
            (_, true) => "assistant speaking",
            (true, false) => "hearing you",
            (false, false) => "quiet",
        };
        let filled = (event.volume.clamp(0.0, 1.0) * 10.0).round() as usize;
        println!("  {label:<18} [{}{}]", "#".repeat(filled), ".".repeat(10 - filled));
    }
}

// ── chat ──────────────────────────────────────────────────────────────────

async fn run_chat(settings: AppSettings) -> anyhow::Result<()> {
    let api_key = settings.resolve_api_key().map(|(key, _)| key);
    if api_key.is_none() {
        warn!("no API key configured; set GEMINI_API_KEY or apiKey in the settings file");
    }
    let backend = GeminiChat::new(api_key, settings.chat_model.clone(), settings.persona.clone())?;
    let mut chat = ChatController::new(Arc::new(backend));

    if let Some(greeting) = chat.history().first() {
        println!("counsel> {}", greeting.text);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush().context("flush stdout")?;

        let Some(line) = lines.next_line().await.context("read stdin")? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                chat.clear();
                if let Some(greeting) = chat.history().first() {
                    println!("counsel> {}", greeting.text);
                }
            }
            text => match chat.send(text).await {
                Ok(reply) => println!("counsel> {reply}"),
                Err(e) => eprintln!("error: {e} (your message was kept; try again)"),
            },
        }
    }
    Ok(())
}

// ── devices / config ──────────────────────────────────────────────────────

fn list_devices(json: bool) -> anyhow::Result<()> {
    let devices = list_input_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No input devices found.");
        return Ok(());
    }
    for device in &devices {
        let mut flags = Vec::new();
        if device.is_recommended {
            flags.push("recommended");
        }
        if device.is_default {
            flags.push("default");
        }
        if device.is_loopback_like {
            flags.push("loopback");
        }
        if flags.is_empty() {
            println!("  {}", device.name);
        } else {
            println!("  {} ({})", device.name, flags.join(", "));
        }
    }
    Ok(())
}

fn show_config(
    path: &std::path::Path,
    settings: &AppSettings,
    write: bool,
) -> anyhow::Result<()> {
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&settings.runtime_settings())?);
    if write {
        save_settings(path, settings)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("# settings written");
    }
    Ok(())
}
