//! Lock-free SPSC ring buffers.
//!
//! `ringbuf::HeapRb` gives a wait-free `push_slice`/`try_push`, which is what
//! the real-time audio callbacks need: the capture callback pushes samples,
//! and the playback side pushes mixer commands into the output callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half held by the capture callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half held by the framing thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^20 f32 samples ≈ 21.8 s at 48 kHz; the framer drains every few ms.
pub const RING_CAPACITY: usize = 1 << 20;

pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
