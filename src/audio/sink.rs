//! Audio output sink
//!
//! The playout thread only needs one thing from the platform: a blocking
//! write of one interleaved PCM16 frame. [`AudioSink`] captures that
//! contract; [`CpalSink`] implements it on top of a cpal output stream fed
//! from a ring buffer. The ring is sized from the jitter-buffer capacity,
//! so a full ring blocks the producer and paces the playout loop at the
//! device's real consumption rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error};

use crate::protocol::AudioFrame;

use super::error::AudioError;

/// How long to wait for the output thread to report stream creation
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while the ring buffer is full
const WRITE_BACKOFF: Duration = Duration::from_micros(500);

/// Poll interval of the thread keeping the cpal stream alive
const KEEPALIVE_POLL: Duration = Duration::from_millis(200);

/// Audio format learned from the first packet of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u8,
    pub samples_per_channel: u16,
}

impl StreamParams {
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
            samples_per_channel: frame.samples_per_channel,
        }
    }

    /// Frame cadence in milliseconds, never below 1.
    pub fn frame_ms(&self) -> u64 {
        (self.samples_per_channel as u64 * 1000 / self.sample_rate as u64).max(1)
    }

    /// Interleaved samples per packet across all channels.
    pub fn samples_per_packet(&self) -> usize {
        self.samples_per_channel as usize * self.channels as usize
    }

    /// Bytes of PCM16 per packet.
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_packet() * 2
    }
}

/// Blocking PCM16 frame writer.
pub trait AudioSink: Send {
    /// Write one interleaved frame, blocking until the sink has taken all
    /// of it. The block is the playout loop's pacing mechanism.
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;
}

/// cpal-backed sink.
///
/// The cpal stream is created and kept alive on a dedicated thread because
/// stream handles are not `Send` on every backend; the sink half that the
/// player owns is just the ring-buffer producer plus a stop flag.
pub struct CpalSink {
    producer: HeapProd<i16>,
    stop: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open the default output device for the given format, with at least
    /// `min_buffer_bytes` of buffer between the player and the device.
    pub fn open(params: StreamParams, min_buffer_bytes: usize) -> Result<Self, AudioError> {
        let capacity = (min_buffer_bytes / 2).max(params.samples_per_packet() * 4);
        let ring = HeapRb::<i16>::new(capacity);
        let (producer, consumer) = ring.split();

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);

        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || output_stream_thread(params, consumer, thread_stop, ready_tx))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                producer,
                stop,
                stream_thread: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                Err(AudioError::StreamError(
                    "audio output thread did not start in time".to_string(),
                ))
            }
        }
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        let mut written = 0;
        while written < samples.len() {
            written += self.producer.push_slice(&samples[written..]);
            if written < samples.len() {
                if self.stop.load(Ordering::Relaxed) {
                    return Err(AudioError::StreamError("output stream closed".to_string()));
                }
                thread::sleep(WRITE_BACKOFF);
            }
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }
}

fn output_stream_thread(
    params: StreamParams,
    mut consumer: HeapCons<i16>,
    stop: Arc<AtomicBool>,
    ready_tx: mpsc::SyncSender<Result<(), AudioError>>,
) {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(device) => device,
        None => {
            let _ = ready_tx.send(Err(AudioError::NoOutputDevice));
            return;
        }
    };

    let config = StreamConfig {
        channels: params.channels as u16,
        sample_rate: cpal::SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for sample in data.iter_mut() {
                *sample = consumer
                    .try_pop()
                    .map(|s| s as f32 / 32768.0)
                    .unwrap_or(0.0);
            }
        },
        |err| error!("audio output stream error: {err}"),
        None,
    ) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(AudioError::DeviceOpenFailed(err.to_string())));
            return;
        }
    };

    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamError(err.to_string())));
        return;
    }

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    debug!(
        "output stream running on '{}': {} Hz, {} ch",
        device_name, params.sample_rate, params.channels
    );
    let _ = ready_tx.send(Ok(()));

    // The stream handle must stay alive until the sink is dropped.
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(KEEPALIVE_POLL);
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_ms_floors_at_one() {
        let params = StreamParams {
            sample_rate: 48_000,
            channels: 2,
            samples_per_channel: 16,
        };
        assert_eq!(params.frame_ms(), 1);

        let params = StreamParams {
            sample_rate: 48_000,
            channels: 1,
            samples_per_channel: 240,
        };
        assert_eq!(params.frame_ms(), 5);
    }

    #[test]
    fn test_packet_geometry() {
        let params = StreamParams {
            sample_rate: 48_000,
            channels: 2,
            samples_per_channel: 240,
        };
        assert_eq!(params.samples_per_packet(), 480);
        assert_eq!(params.frame_bytes(), 960);
    }
}
