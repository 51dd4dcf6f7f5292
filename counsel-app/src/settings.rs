//! `settings.json`: models, voice, persona and capture tuning.
//!
//! Unknown or missing keys fall back to defaults; [`AppSettings::normalize`]
//! clamps whatever the user wrote into workable ranges.

use std::fs;
use std::path::{Path, PathBuf};

use counsel_core::chat::DEFAULT_PERSONA;
use counsel_core::meter::{DEFAULT_ACTIVITY_THRESHOLD, DEFAULT_VOLUME_GAIN};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Environment variables checked for the API key, in priority order.
pub const API_KEY_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "COUNSEL_API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub live_model: String,
    pub chat_model: String,
    pub voice_name: String,
    pub persona: String,
    pub preferred_input_device: Option<String>,
    pub activity_threshold: f32,
    pub volume_gain: f32,
    pub playback_lead_ms: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            live_model: "gemini-2.5-flash-native-audio-preview-12-2025".into(),
            chat_model: "gemini-2.5-flash".into(),
            voice_name: "Aoede".into(),
            persona: DEFAULT_PERSONA.into(),
            preferred_input_device: None,
            activity_threshold: DEFAULT_ACTIVITY_THRESHOLD,
            volume_gain: DEFAULT_VOLUME_GAIN,
            playback_lead_ms: 50,
        }
    }
}

/// What `counsel config` prints: everything except the key itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub live_model: String,
    pub chat_model: String,
    pub voice_name: String,
    pub persona: String,
    pub preferred_input_device: Option<String>,
    pub activity_threshold: f32,
    pub volume_gain: f32,
    pub playback_lead_ms: u32,
    pub has_api_key: bool,
    /// `env:<NAME>`, `settings`, or `none`.
    pub api_key_source: String,
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = AppSettings::default();
        self.api_key = trimmed(self.api_key.take());
        self.live_model = non_empty_or(&self.live_model, &defaults.live_model);
        self.chat_model = non_empty_or(&self.chat_model, &defaults.chat_model);
        self.voice_name = non_empty_or(&self.voice_name, &defaults.voice_name);
        self.persona = non_empty_or(&self.persona, &defaults.persona);
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.activity_threshold = finite_or(self.activity_threshold, defaults.activity_threshold)
            .clamp(0.0005, 0.5);
        self.volume_gain = finite_or(self.volume_gain, defaults.volume_gain).clamp(0.5, 50.0);
        self.playback_lead_ms = self.playback_lead_ms.clamp(10, 500);
    }

    /// The key to use and where it came from. Environment variables win.
    pub fn resolve_api_key(&self) -> Option<(String, String)> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_api_key_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<(String, String)> {
        API_KEY_ENV_VARS
            .iter()
            .find_map(|name| {
                trimmed(lookup(name)).map(|key| (key, format!("env:{name}")))
            })
            .or_else(|| self.api_key.clone().map(|key| (key, "settings".to_string())))
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        let source = self.resolve_api_key().map(|(_, source)| source);
        RuntimeSettings {
            live_model: self.live_model.clone(),
            chat_model: self.chat_model.clone(),
            voice_name: self.voice_name.clone(),
            persona: self.persona.clone(),
            preferred_input_device: self.preferred_input_device.clone(),
            activity_threshold: self.activity_threshold,
            volume_gain: self.volume_gain,
            playback_lead_ms: self.playback_lead_ms,
            has_api_key: source.is_some(),
            api_key_source: source.unwrap_or_else(|| "none".into()),
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Per-user data directory: `%APPDATA%` on Windows, XDG elsewhere.
fn data_dir() -> PathBuf {
    let from_env = |var: &str| std::env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from);
    if cfg!(target_os = "windows") {
        return from_env("APPDATA").unwrap_or_else(|| PathBuf::from("."));
    }
    from_env("XDG_DATA_HOME")
        .or_else(|| from_env("HOME").map(|home| home.join(".local").join("share")))
        .unwrap_or_else(std::env::temp_dir)
}

pub fn default_settings_path() -> PathBuf {
    let app_dir = if cfg!(target_os = "windows") { "Counsel" } else { "counsel" };
    data_dir().join(app_dir).join("settings.json")
}

/// Read and normalize settings. A missing or invalid file yields defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), "settings file is not valid, using defaults: {e}");
            AppSettings::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            AppSettings::default()
        }
        Err(e) => {
            warn!(path = %path.display(), "cannot read settings file, using defaults: {e}");
            AppSettings::default()
        }
    };
    settings.normalize();
    settings
}

/// Write through a sibling temp file so a crash never leaves half a file.
pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_vec_pretty(settings).map_err(std::io::Error::other)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, body)?;
    fs::rename(&staging, path)
}
