//! Shared helpers for the integration tests: a recording sink factory and
//! a packet builder matching the sender's wire format.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use audiopipe::audio::{AudioError, AudioSink, StreamParams};
use audiopipe::network::SinkFactory;
use audiopipe::protocol::AudioFrame;

/// Observations recorded by the test sink factory.
#[derive(Clone, Default)]
pub struct SinkProbe {
    opened: Arc<AtomicUsize>,
    frames_written: Arc<AtomicUsize>,
    params: Arc<std::sync::Mutex<Option<(StreamParams, usize)>>>,
}

impl SinkProbe {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written.load(Ordering::SeqCst)
    }

    /// Stream params and minimum buffer bytes the session opened the sink
    /// with.
    pub fn open_request(&self) -> Option<(StreamParams, usize)> {
        *self.params.lock().unwrap()
    }
}

struct CountingSink {
    frames_written: Arc<AtomicUsize>,
}

impl AudioSink for CountingSink {
    fn write(&mut self, _samples: &[i16]) -> Result<(), AudioError> {
        self.frames_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A sink factory that records open requests and counts written frames
/// instead of touching any audio device.
pub fn probe_factory() -> (SinkFactory, SinkProbe) {
    let probe = SinkProbe::default();
    let factory_probe = probe.clone();
    let factory: SinkFactory = Box::new(move |params, min_buffer_bytes| {
        factory_probe.opened.fetch_add(1, Ordering::SeqCst);
        *factory_probe.params.lock().unwrap() = Some((params, min_buffer_bytes));
        Ok(Box::new(CountingSink {
            frames_written: Arc::clone(&factory_probe.frames_written),
        }) as Box<dyn AudioSink>)
    });
    (factory, probe)
}

/// Build a wire packet the way the sender does: current wall clock in the
/// timestamp field, constant-filled payload.
pub fn packet(seq: u32, sample_rate: u32, channels: u8, samples_per_channel: u16, fill: i16) -> Vec<u8> {
    let send_time_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_micros() as u64;
    AudioFrame {
        sample_rate,
        channels,
        seq,
        send_time_us,
        samples_per_channel,
        samples: vec![fill; samples_per_channel as usize * channels as usize],
    }
    .to_bytes()
}

/// Default test stream: mono 48 kHz, 5 ms frames.
pub fn mono_packet(seq: u32) -> Vec<u8> {
    packet(seq, 48_000, 1, 240, 7)
}
