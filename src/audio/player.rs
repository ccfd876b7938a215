//! Playout loop
//!
//! Pulls frames from the jitter buffer and writes them to the audio sink.
//! The sink write is blocking and paces the loop; the jitter buffer's pop
//! deadline bounds how long the loop stalls when the network goes quiet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::network::SessionStats;

use super::jitter_buffer::JitterBuffer;
use super::sink::{AudioSink, StreamParams};

/// Start the playout thread. Any frame slot the buffer cannot fill in time
/// becomes silence; a frame with unexpected geometry is replaced by
/// silence and counted as a payload error.
pub(crate) fn spawn(
    params: StreamParams,
    jitter: Arc<JitterBuffer>,
    mut sink: Box<dyn AudioSink>,
    stats: Arc<SessionStats>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("audio-player".to_string())
        .spawn(move || {
            let expected = params.samples_per_packet();
            let silence = vec![0i16; expected];
            let pop_timeout = Duration::from_millis((params.frame_ms() * 2).max(10));
            debug!(
                "player running: {} samples/frame, pop timeout {} ms",
                expected,
                pop_timeout.as_millis()
            );

            while running.load(Ordering::Relaxed) {
                let frame = jitter.pop(pop_timeout);
                let samples: &[i16] = match &frame {
                    None => {
                        stats.add_underrun();
                        &silence
                    }
                    Some(frame) if frame.samples.len() != expected => {
                        stats.add_payload_error();
                        &silence
                    }
                    Some(frame) => &frame.samples,
                };
                if let Err(err) = sink.write(samples) {
                    warn!("audio sink write failed: {err}");
                }
            }

            debug!("player stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::jitter_buffer::{JitterBufferConfig, JitterBufferMode};
    use crate::protocol::AudioFrame;
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<i16>>>>,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, samples: &[i16]) -> Result<(), crate::audio::AudioError> {
            self.frames.lock().unwrap().push(samples.to_vec());
            Ok(())
        }
    }

    fn frame(seq: u32, fill: i16) -> AudioFrame {
        AudioFrame {
            sample_rate: 48_000,
            channels: 1,
            seq,
            send_time_us: 0,
            samples_per_channel: 4,
            samples: vec![fill; 4],
        }
    }

    #[test]
    fn test_player_drains_buffer_then_substitutes_silence() {
        let params = StreamParams {
            sample_rate: 48_000,
            channels: 1,
            samples_per_channel: 4,
        };
        let jitter = Arc::new(JitterBuffer::new(JitterBufferConfig {
            target_frames: 2,
            max_frames: 8,
            mode: JitterBufferMode::Fifo,
        }));
        let stats = Arc::new(SessionStats::new());
        let running = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(Mutex::new(Vec::new()));

        jitter.push(frame(0, 11));
        jitter.push(frame(1, 22));

        let sink = Box::new(RecordingSink {
            frames: Arc::clone(&frames),
        });
        let handle = spawn(
            params,
            Arc::clone(&jitter),
            sink,
            Arc::clone(&stats),
            Arc::clone(&running),
        )
        .unwrap();

        // Let the player drain both frames and hit at least one timeout.
        thread::sleep(Duration::from_millis(150));
        running.store(false, Ordering::Relaxed);
        jitter.wake();
        handle.join().unwrap();

        let written = frames.lock().unwrap();
        assert!(written.len() >= 3);
        assert_eq!(written[0], vec![11; 4]);
        assert_eq!(written[1], vec![22; 4]);
        assert!(written[2..].iter().all(|f| f.iter().all(|&s| s == 0)));
        assert!(stats.totals().underruns >= 1);
    }

    #[test]
    fn test_wrong_geometry_becomes_silence_and_payload_error() {
        let params = StreamParams {
            sample_rate: 48_000,
            channels: 1,
            samples_per_channel: 4,
        };
        let jitter = Arc::new(JitterBuffer::new(JitterBufferConfig {
            target_frames: 2,
            max_frames: 8,
            mode: JitterBufferMode::Fifo,
        }));
        let stats = Arc::new(SessionStats::new());
        let running = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(Mutex::new(Vec::new()));

        let mut oversized = frame(0, 99);
        oversized.samples = vec![99; 8];
        jitter.push(oversized);
        jitter.push(frame(1, 33));

        let sink = Box::new(RecordingSink {
            frames: Arc::clone(&frames),
        });
        let handle = spawn(
            params,
            Arc::clone(&jitter),
            sink,
            Arc::clone(&stats),
            Arc::clone(&running),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        running.store(false, Ordering::Relaxed);
        jitter.wake();
        handle.join().unwrap();

        let written = frames.lock().unwrap();
        assert_eq!(written[0], vec![0; 4], "oversized frame replaced by silence");
        assert_eq!(written[1], vec![33; 4]);
        assert_eq!(stats.totals().payload_errors, 1);
    }
}
