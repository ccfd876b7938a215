//! Wire protocol for the audio stream

mod packet;

pub use packet::{AudioFrame, CODEC_PCM16, HEADER_SIZE, MAGIC, PROTOCOL_VERSION};
