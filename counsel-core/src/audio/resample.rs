//! Sample-rate conversion with rubato.
//!
//! Two directions use it:
//! - capture: device rate (commonly 44.1/48 kHz) → 16 kHz wire rate, fed
//!   incrementally through [`RateConverter::process`] on the framing thread;
//! - playback: 24 kHz wire rate → device rate, one whole unit at a time via
//!   [`resample_all`] before the unit is handed to the mixer.
//!
//! Equal rates never build a rubato session.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{CounselError, Result};

/// Streaming mono converter between two fixed rates.
pub struct RateConverter {
    inner: Option<Stage>,
}

/// A live rubato session plus its block buffers.
struct Stage {
    rubato: FastFixedIn<f32>,
    block_len: usize,
    /// Input carried over until a full block is available.
    carry: Vec<f32>,
    /// `[channel][frame]` output scratch.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `CounselError::Output` if rubato rejects the ratio or block length.
    pub fn new(from_rate: u32, to_rate: u32, block_len: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self { inner: None });
        }

        let rubato = FastFixedIn::<f32>::new(
            f64::from(to_rate) / f64::from(from_rate),
            1.0,
            PolynomialDegree::Cubic,
            block_len,
            1,
        )
        .map_err(|e| CounselError::Output(format!("resampler {from_rate}->{to_rate}: {e}")))?;
        let scratch = rubato.output_buffer_allocate(true);

        debug!(from_rate, to_rate, block_len, "rate converter ready");
        Ok(Self {
            inner: Some(Stage {
                rubato,
                block_len,
                carry: Vec::with_capacity(block_len * 2),
                scratch,
            }),
        })
    }

    /// Convert as many whole blocks as `samples` completes.
    ///
    /// Leftover input waits for the next call, so the output may be empty.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(stage) = self.inner.as_mut() else {
            return samples.to_vec();
        };

        stage.carry.extend_from_slice(samples);
        let mut converted = Vec::new();
        let mut offset = 0;
        while stage.carry.len() - offset >= stage.block_len {
            let block = &stage.carry[offset..offset + stage.block_len];
            match stage
                .rubato
                .process_into_buffer(&[block], &mut stage.scratch, None)
            {
                Ok((_, written)) => converted.extend_from_slice(&stage.scratch[0][..written]),
                Err(e) => error!("resampling block dropped: {e}"),
            }
            offset += stage.block_len;
        }
        stage.carry.drain(..offset);
        converted
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}

/// Block length for one-shot conversion of playback units.
const UNIT_BLOCK: usize = 1024;

/// Convert a complete buffer, returning exactly `len * to / from` samples.
///
/// The tail is flushed with silence so the last real samples make it out of
/// the filter.
pub fn resample_all(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let target = ((samples.len() as u64 * u64::from(to_rate)) / u64::from(from_rate)).max(1);
    let target = target as usize;
    let mut converter = RateConverter::new(from_rate, to_rate, UNIT_BLOCK)?;

    let mut out = converter.process(samples);
    let silence = [0.0f32; UNIT_BLOCK];
    while out.len() < target {
        let tail = converter.process(&silence);
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }
    out.truncate(target);
    Ok(out)
}
