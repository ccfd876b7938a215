//! Receive session lifecycle
//!
//! A session owns one socket, the jitter buffer, and the three worker
//! threads (net receiver, stats sampler, audio player). The audio half of
//! the pipeline is created lazily by the receiver when the first valid
//! frame reveals the stream format; until then only the socket loop and
//! the sampler run.
//!
//! Teardown is single-sided: worker threads never join each other. A
//! fatal error inside a worker only clears the running flag; `stop` (or
//! dropping the session) joins everything and releases the sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::audio::{
    player, AdaptiveController, AudioError, AudioSink, CpalSink, JitterBuffer, JitterBufferConfig,
    JitterBufferMode, JitterBufferSnapshot, StreamParams, WindowDeltas,
};
use crate::protocol::AudioFrame;

use super::error::NetworkError;
use super::receiver;
use super::stats::{CounterTotals, SessionStats};

/// Stats window length
const STATS_WINDOW: Duration = Duration::from_secs(1);

/// Transport carrying the audio packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl Transport {
    /// Case-insensitive name lookup; anything unrecognized means UDP.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("tcp") {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// Immutable per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: u16,
    /// Requested buffering in milliseconds; the base jitter-buffer target
    /// is derived from this once the frame cadence is known.
    pub jitter_ms: u32,
    pub transport: Transport,
    /// Opt into the sequence-reordering jitter buffer with gap
    /// concealment. Useful on lossy UDP paths that reorder.
    pub reorder: bool,
}

impl SessionConfig {
    pub fn new(port: u16, jitter_ms: u32, transport: Transport) -> Self {
        Self {
            port,
            jitter_ms: jitter_ms.max(1),
            transport,
            reorder: false,
        }
    }
}

/// Builds the audio sink once the stream format is known. The second
/// argument is the minimum buffer the sink must hold between the player
/// and the device, in bytes.
pub type SinkFactory =
    Box<dyn Fn(StreamParams, usize) -> Result<Box<dyn AudioSink>, AudioError> + Send + Sync>;

fn cpal_sink_factory() -> SinkFactory {
    Box::new(|params, min_buffer_bytes| {
        let sink = CpalSink::open(params, min_buffer_bytes)?;
        Ok(Box::new(sink) as Box<dyn AudioSink>)
    })
}

/// The audio half of the pipeline, created on the first valid frame.
pub(crate) struct Pipeline {
    pub(crate) jitter: Arc<JitterBuffer>,
    pub(crate) params: StreamParams,
    pub(crate) base_target: usize,
    pub(crate) controller: Mutex<AdaptiveController>,
}

/// State shared by every thread of a session.
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) stats: Arc<SessionStats>,
    running: Arc<AtomicBool>,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
    player_handle: Mutex<Option<JoinHandle<()>>>,
    sink_factory: SinkFactory,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
}

impl SessionShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Flip the session to stopped and wake anything that might be
    /// waiting: the sampler's window sleep and the player's pop. Safe to
    /// call from any thread; joining is left to the supervisor.
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        // try_lock: the receiver may be inside lazy init holding this
        // lock; its loop checks the running flag right after.
        if let Ok(slot) = self.pipeline.try_lock() {
            if let Some(pipeline) = slot.as_ref() {
                pipeline.jitter.wake();
            }
        }
        let mut stopped = self.stopped.lock().unwrap();
        *stopped = true;
        self.stopped_cv.notify_all();
    }

    fn current_pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.lock().unwrap().clone()
    }

    /// Interruptible sleep for the sampler. Returns false once the
    /// session is stopping.
    fn sleep_window(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self
                .stopped_cv
                .wait_timeout(stopped, deadline - now)
                .unwrap();
            stopped = guard;
        }
        false
    }
}

/// Lazy audio initialization, called by the receiver on every valid frame
/// and a no-op after the first. Derives the frame cadence and target range
/// from the first frame, builds the jitter buffer, opens the sink, and
/// starts the player.
pub(crate) fn ensure_pipeline(
    shared: &Arc<SessionShared>,
    frame: &AudioFrame,
) -> Result<Arc<Pipeline>, AudioError> {
    let mut slot = shared.pipeline.lock().unwrap();
    if let Some(pipeline) = slot.as_ref() {
        return Ok(Arc::clone(pipeline));
    }

    let params = StreamParams::from_frame(frame);
    let frame_ms = params.frame_ms();
    let base_target = ((shared.config.jitter_ms as u64 / frame_ms) as usize).max(2);
    let controller = AdaptiveController::new(base_target);
    let max_frames = (base_target + 16).max(controller.max_target() + 4);

    let jitter = Arc::new(JitterBuffer::new(JitterBufferConfig {
        target_frames: base_target,
        max_frames,
        mode: if shared.config.reorder {
            JitterBufferMode::Reorder
        } else {
            JitterBufferMode::Fifo
        },
    }));

    let min_buffer_bytes = params.frame_bytes() * (max_frames + 2);
    let sink = (shared.sink_factory)(params, min_buffer_bytes)?;

    let handle = player::spawn(
        params,
        Arc::clone(&jitter),
        sink,
        Arc::clone(&shared.stats),
        Arc::clone(&shared.running),
    )?;
    *shared.player_handle.lock().unwrap() = Some(handle);

    info!(
        "audio ready: {} Hz, {} ch, {} samples/frame ({} ms), target {} frames, cap {} frames",
        params.sample_rate,
        params.channels,
        params.samples_per_channel,
        frame_ms,
        base_target,
        max_frames
    );

    let pipeline = Arc::new(Pipeline {
        jitter,
        params,
        base_target,
        controller: Mutex::new(controller),
    });
    *slot = Some(Arc::clone(&pipeline));
    Ok(pipeline)
}

/// Point-in-time view of a session for embedders and tests.
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    pub counters: CounterTotals,
    pub buffer: Option<JitterBufferSnapshot>,
    pub stream: Option<StreamParams>,
}

/// One receive session: socket, worker threads, and the lazily created
/// audio pipeline.
pub struct Session {
    shared: Arc<SessionShared>,
    local_addr: SocketAddr,
    receiver_handle: Option<JoinHandle<()>>,
    sampler_handle: Option<JoinHandle<()>>,
}

impl Session {
    /// Start a session playing to the default audio output device.
    pub fn start(config: SessionConfig) -> Result<Self, NetworkError> {
        Self::start_with_sink(config, cpal_sink_factory())
    }

    /// Start a session with a caller-provided sink. Binding happens here,
    /// synchronously, so a bind failure is an error instead of a dead
    /// session; everything after the bind runs on the worker threads.
    pub fn start_with_sink(
        config: SessionConfig,
        sink_factory: SinkFactory,
    ) -> Result<Self, NetworkError> {
        let shared = Arc::new(SessionShared {
            config: config.clone(),
            stats: Arc::new(SessionStats::new()),
            running: Arc::new(AtomicBool::new(true)),
            pipeline: Mutex::new(None),
            player_handle: Mutex::new(None),
            sink_factory,
            stopped: Mutex::new(false),
            stopped_cv: Condvar::new(),
        });

        let (receiver_handle, local_addr) = match config.transport {
            Transport::Udp => {
                let socket = receiver::bind_udp(config.port).map_err(|source| {
                    NetworkError::BindUdp {
                        port: config.port,
                        source,
                    }
                })?;
                let local_addr = socket.local_addr()?;
                let worker = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("net-receiver".to_string())
                    .spawn(move || receiver::run_udp(worker, socket))?;
                (handle, local_addr)
            }
            Transport::Tcp => {
                let listener = receiver::bind_tcp(config.port).map_err(|source| {
                    NetworkError::BindTcp {
                        port: config.port,
                        source,
                    }
                })?;
                let local_addr = listener.local_addr()?;
                let worker = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name("net-receiver".to_string())
                    .spawn(move || receiver::run_tcp(worker, listener))?;
                (handle, local_addr)
            }
        };

        let sampler = Arc::clone(&shared);
        let sampler_handle = match thread::Builder::new()
            .name("stats-sampler".to_string())
            .spawn(move || run_sampler(sampler))
        {
            Ok(handle) => handle,
            Err(err) => {
                shared.shutdown();
                let _ = receiver_handle.join();
                return Err(err.into());
            }
        };

        info!(
            "session listening on {} ({}, jitter {} ms)",
            local_addr,
            config.transport.as_str(),
            config.jitter_ms
        );

        Ok(Self {
            shared,
            local_addr,
            receiver_handle: Some(receiver_handle),
            sampler_handle: Some(sampler_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once the session stopped, including after a fatal error in a
    /// worker thread.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let pipeline = self.shared.current_pipeline();
        TelemetrySnapshot {
            counters: self.shared.stats.totals(),
            buffer: pipeline.as_ref().map(|p| p.jitter.snapshot()),
            stream: pipeline.as_ref().map(|p| p.params),
        }
    }

    /// Stop the session and release the socket, threads, and audio sink.
    /// Idempotent; also invoked on drop.
    pub fn stop(&mut self) {
        self.shared.shutdown();
        if let Some(handle) = self.receiver_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sampler_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.shared.player_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        // Dropping the pipeline releases the buffered frames; the sink
        // died with the player thread.
        self.shared.pipeline.lock().unwrap().take();
        debug!("session stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Embedder-facing control surface with idempotent start/stop semantics:
/// a start while a session is running is ignored, a stop without one is a
/// no-op.
#[derive(Default)]
pub struct Supervisor {
    active: Mutex<Option<Session>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session unless one is already running. A session that died
    /// on a fatal error is cleaned up and replaced.
    pub fn start(&self, port: u16, jitter_ms: u32, transport: &str) -> Result<(), NetworkError> {
        self.start_session(SessionConfig::new(
            port,
            jitter_ms,
            Transport::from_name(transport),
        ))
    }

    pub fn start_session(&self, config: SessionConfig) -> Result<(), NetworkError> {
        let mut active = self.active.lock().unwrap();
        if let Some(session) = active.as_ref() {
            if session.is_running() {
                info!("start ignored: session already running");
                return Ok(());
            }
        }
        if let Some(mut dead) = active.take() {
            dead.stop();
        }
        *active = Some(Session::start(config)?);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(mut session) = self.active.lock().unwrap().take() {
            session.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|session| session.is_running())
            .unwrap_or(false)
    }
}

/// Once-per-second window: counter deltas, controller invocation, and the
/// telemetry record.
fn run_sampler(shared: Arc<SessionShared>) {
    let mut last_totals = CounterTotals::default();
    let mut last_buffer: Option<JitterBufferSnapshot> = None;

    while shared.sleep_window(STATS_WINDOW) {
        let totals = shared.stats.totals();
        let delta = totals.delta_since(&last_totals);
        last_totals = totals;
        let averages = shared.stats.take_window_averages();
        let kbps = delta.bytes as f64 * 8.0 / 1000.0;

        let Some(pipeline) = shared.current_pipeline() else {
            info!(
                "stats rx={} {:.1} kbps delay={} ms buffer=0 loss=0 late=0 over=0 underrun={} parseErr={} payloadErr={}",
                delta.packets,
                kbps,
                fmt_opt_ms(averages.net_age_ms),
                delta.underruns,
                delta.parse_errors,
                delta.payload_errors
            );
            continue;
        };

        let buffer = pipeline.jitter.snapshot();
        let prev = last_buffer.replace(buffer).unwrap_or_default();
        let missing = buffer.missing.saturating_sub(prev.missing);
        let late = buffer.late.saturating_sub(prev.late);
        let overflow = buffer.overflow_dropped.saturating_sub(prev.overflow_dropped);

        let mut controller = pipeline.controller.lock().unwrap();
        let window = WindowDeltas {
            underruns: delta.underruns,
            missing,
            overflow,
            parse_errors: delta.parse_errors,
            payload_errors: delta.payload_errors,
        };
        let mut target = buffer.target_frames;
        if let Some(new_target) = controller.observe(&window, buffer.buffered, target) {
            info!(
                "jitter target {} -> {} frames ({})",
                target,
                new_target,
                controller.last_reason().as_str()
            );
            pipeline.jitter.set_target_frames(new_target);
            target = new_target;
        }

        let frame_ms = pipeline.params.frame_ms();
        let buffered_ms = buffer.buffered as u64 * frame_ms;

        info!(
            "stats rx={} {:.1} kbps delay={} ms buffer={} loss={} late={} over={} underrun={} parseErr={} payloadErr={}",
            delta.packets,
            kbps,
            fmt_opt_ms(averages.net_age_ms),
            buffered_ms,
            missing,
            late,
            overflow,
            delta.underruns,
            delta.parse_errors,
            delta.payload_errors
        );
        info!(
            "autojitter target={} ({}ms) base={} ({}ms) score={:.1} win={} reason={}",
            target,
            target as u64 * frame_ms,
            pipeline.base_target,
            pipeline.base_target as u64 * frame_ms,
            controller.score_ema(),
            controller.last_window_score(),
            controller.last_reason().as_str()
        );

        let decode_ms = averages.decode_ms.unwrap_or(0.0);
        let e2e_ms = averages
            .net_path_ms
            .or(averages.net_age_ms)
            .unwrap_or(0.0)
            + decode_ms
            + buffered_ms as f64;
        info!(
            "perf netAge={} netPath={} netJit={} decode={:.3} playout={:.1} e2e={:.1}",
            fmt_opt_ms(averages.net_age_ms),
            fmt_opt_ms(averages.net_path_ms),
            fmt_opt_ms(averages.net_jitter_ms),
            decode_ms,
            buffered_ms as f64,
            e2e_ms
        );
    }
    debug!("stats sampler exiting");
}

fn fmt_opt_ms(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{ms:.1}"),
        None => "n/a".to_string(),
    }
}
