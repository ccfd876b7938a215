//! Audio packet wire format
//!
//! Packet format (28-byte header, little-endian):
//! - magic: 4 bytes "AUD0"
//! - version: 1 byte (must be 1)
//! - codec: 1 byte (must be 0 = PCM16LE)
//! - channels: 1 byte (1 or 2)
//! - reserved: 1 byte
//! - sample_rate: 4 bytes
//! - seq: 4 bytes (wrapping)
//! - send_time_us: 8 bytes (sender unix microseconds)
//! - samples_per_channel: 2 bytes
//! - payload_len: 2 bytes
//! - payload: payload_len bytes of interleaved PCM16LE samples

/// Magic bytes at the start of every packet
pub const MAGIC: [u8; 4] = *b"AUD0";

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Codec id for raw little-endian PCM16
pub const CODEC_PCM16: u8 = 0;

/// Header size in bytes
pub const HEADER_SIZE: usize = 28;

/// One successfully parsed packet's worth of audio.
///
/// The sample vec is owned by the frame and always satisfies
/// `samples.len() == samples_per_channel as usize * channels as usize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u8,
    pub seq: u32,
    pub send_time_us: u64,
    pub samples_per_channel: u16,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Parse a received buffer into a frame.
    ///
    /// Returns `None` for anything that is not a well-formed audio packet:
    /// short buffers, wrong magic/version/codec, channel counts other than
    /// 1 or 2, empty or odd payload lengths, truncated payloads, and
    /// payloads whose length disagrees with the declared frame geometry.
    /// Trailing bytes beyond the declared payload are tolerated.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        if data[0..4] != MAGIC {
            return None;
        }
        if data[4] != PROTOCOL_VERSION || data[5] != CODEC_PCM16 {
            return None;
        }
        let channels = data[6];
        if channels != 1 && channels != 2 {
            return None;
        }

        let sample_rate = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        if sample_rate == 0 {
            return None;
        }
        let seq = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        let send_time_us = u64::from_le_bytes([
            data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
        ]);
        let samples_per_channel = u16::from_le_bytes([data[24], data[25]]);
        let payload_len = u16::from_le_bytes([data[26], data[27]]) as usize;

        if payload_len == 0 || payload_len % 2 != 0 {
            return None;
        }
        if HEADER_SIZE + payload_len > data.len() {
            return None;
        }
        if payload_len != samples_per_channel as usize * channels as usize * 2 {
            return None;
        }

        let samples = data[HEADER_SIZE..HEADER_SIZE + payload_len]
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Some(Self {
            sample_rate,
            channels,
            seq,
            send_time_us,
            samples_per_channel,
            samples,
        })
    }

    /// Serialize the frame back into wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_len = self.samples.len() * 2;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload_len);

        buf.extend_from_slice(&MAGIC);
        buf.push(PROTOCOL_VERSION);
        buf.push(CODEC_PCM16);
        buf.push(self.channels);
        buf.push(0);
        buf.extend_from_slice(&self.sample_rate.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.send_time_us.to_le_bytes());
        buf.extend_from_slice(&self.samples_per_channel.to_le_bytes());
        buf.extend_from_slice(&(payload_len as u16).to_le_bytes());
        for sample in &self.samples {
            buf.extend_from_slice(&sample.to_le_bytes());
        }

        buf
    }
}
