//! PCM16 / base64 wire codec.
//!
//! ```text
//! f32 [-1, 1] ──float_to_pcm16──► i16 LE bytes ──to_transport_text──► base64
//! f32 [-1, 1] ◄─pcm16_to_float─── i16 LE bytes ◄─from_transport_text── base64
//! ```
//!
//! Negative samples scale by 32768 and non-negative by 32767 so that both
//! -1.0 and 1.0 map onto the full i16 range without overflow.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{CounselError, Result};

/// Rate of outbound (microphone) audio on the wire.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of inbound (synthesized) audio on the wire.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Convert f32 samples into 16-bit little-endian PCM. Out-of-range input is clamped.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let value = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(value as i16).to_le_bytes());
    }
    out
}

/// Convert 16-bit little-endian PCM back into f32 samples.
///
/// # Errors
/// `MalformedInput` when `bytes` has an odd length.
pub fn pcm16_to_float(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(CounselError::MalformedInput(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| {
            let v = i16::from_le_bytes([pair[0], pair[1]]);
            if v < 0 {
                v as f32 / 32768.0
            } else {
                v as f32 / 32767.0
            }
        })
        .collect())
}

pub fn to_transport_text(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// # Errors
/// `MalformedInput` on characters outside the standard base64 alphabet or bad padding.
pub fn from_transport_text(text: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| CounselError::MalformedInput(format!("invalid base64: {e}")))
}

/// A frame of PCM16 audio in its text-safe wire form.
///
/// The sample rate travels out-of-band as part of the MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFrame {
    /// Base64 of PCM16 LE samples.
    pub data: String,
    pub sample_rate: u32,
}

impl EncodedFrame {
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Number of samples carried by this frame.
    pub fn sample_count(&self) -> usize {
        // base64 expands 3 bytes into 4 chars; trailing '=' pads the last group.
        let padding = self.data.bytes().rev().take_while(|b| *b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding) / 2
    }
}

/// Encode capture samples into a wire frame at `sample_rate`.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    EncodedFrame {
        data: to_transport_text(&float_to_pcm16(samples)),
        sample_rate,
    }
}

/// Decode a base64 PCM16 payload into f32 samples.
pub fn decode_frame(text: &str) -> Result<Vec<f32>> {
    pcm16_to_float(&from_transport_text(text)?)
}
