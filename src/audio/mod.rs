//! Audio playout subsystem
//!
//! Jitter buffering, adaptive target control, the playout loop, and the
//! output sink.

mod adaptive;
mod device;
mod error;
mod jitter_buffer;
pub(crate) mod player;
mod sink;

pub use adaptive::{AdaptiveController, AdjustReason, WindowDeltas};
pub use device::{list_output_devices, AudioDevice};
pub use error::AudioError;
pub use jitter_buffer::{
    JitterBuffer, JitterBufferConfig, JitterBufferMode, JitterBufferSnapshot,
};
pub use sink::{AudioSink, CpalSink, StreamParams};
