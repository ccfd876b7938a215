//! Jitter buffer between the network thread and the playout thread
//!
//! Absorbs inter-arrival jitter and hands frames to the player at a steady
//! cadence. Playout is gated until the buffer has been primed with
//! `target_frames` frames once; afterwards a low-water pre-wait smooths
//! bursty arrival. The buffer is bounded: a push into a full buffer evicts
//! the oldest frame.
//!
//! Two modes exist and are never mixed within a session:
//! - [`JitterBufferMode::Fifo`] (default): frames play in arrival order.
//!   Lowest latency; suited to LAN paths that do not reorder.
//! - [`JitterBufferMode::Reorder`]: frames are keyed by sequence number,
//!   late arrivals are dropped and counted, and a gap at the playout head
//!   is concealed with a fade-to-zero copy of the previous frame.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::AudioFrame;

/// Gain applied per consecutive concealed frame in reorder mode
const CONCEAL_FADE: f32 = 0.92;

/// Playout ordering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterBufferMode {
    /// Arrival order, no reordering
    #[default]
    Fifo,
    /// Sequence order with gap concealment
    Reorder,
}

/// Configuration for the jitter buffer
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Desired steady-state occupancy in frames
    pub target_frames: usize,
    /// Hard cap on buffered frames
    pub max_frames: usize,
    /// Playout ordering strategy
    pub mode: JitterBufferMode,
}

impl JitterBufferConfig {
    /// Validate and normalize: `target_frames >= 2` and
    /// `max_frames >= target_frames + 1`.
    pub fn validated(self) -> Self {
        let target_frames = self.target_frames.max(2);
        let max_frames = self.max_frames.max(target_frames + 1);
        Self {
            target_frames,
            max_frames,
            mode: self.mode,
        }
    }
}

/// Counter and occupancy snapshot, taken atomically with respect to pushes
/// and pops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JitterBufferSnapshot {
    pub pushed: u64,
    pub played: u64,
    pub missing: u64,
    pub late: u64,
    pub overflow_dropped: u64,
    pub buffered: usize,
    pub target_frames: usize,
    pub primed: bool,
}

struct State {
    backend: Backend,
    target_frames: usize,
    primed: bool,
}

enum Backend {
    Fifo(VecDeque<AudioFrame>),
    Reorder(ReorderState),
}

impl Backend {
    fn len(&self) -> usize {
        match self {
            Backend::Fifo(queue) => queue.len(),
            Backend::Reorder(state) => state.frames.len(),
        }
    }
}

/// Sequence-ordered backend state. Wire sequence numbers wrap at u32; they
/// are extended to a monotonically increasing u64 keyspace on insert.
struct ReorderState {
    frames: BTreeMap<u64, AudioFrame>,
    next_play: Option<u64>,
    highest_ext: Option<u64>,
    conceal: Option<AudioFrame>,
}

impl ReorderState {
    fn extend_seq(&mut self, seq: u32) -> u64 {
        match self.highest_ext {
            None => {
                self.highest_ext = Some(seq as u64);
                seq as u64
            }
            Some(highest) => {
                let diff = seq.wrapping_sub(highest as u32) as i32 as i64;
                let ext = (highest as i64).saturating_add(diff).max(0) as u64;
                if ext > highest {
                    self.highest_ext = Some(ext);
                }
                ext
            }
        }
    }
}

/// Bounded, thread-safe frame buffer with prime gate and adaptive target.
pub struct JitterBuffer {
    state: Mutex<State>,
    available: Condvar,
    max_frames: usize,
    mode: JitterBufferMode,
    pushed: AtomicU64,
    played: AtomicU64,
    missing: AtomicU64,
    late: AtomicU64,
    overflow_dropped: AtomicU64,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        let config = config.validated();
        let backend = match config.mode {
            JitterBufferMode::Fifo => Backend::Fifo(VecDeque::with_capacity(config.max_frames)),
            JitterBufferMode::Reorder => Backend::Reorder(ReorderState {
                frames: BTreeMap::new(),
                next_play: None,
                highest_ext: None,
                conceal: None,
            }),
        };
        Self {
            state: Mutex::new(State {
                backend,
                target_frames: config.target_frames,
                primed: false,
            }),
            available: Condvar::new(),
            max_frames: config.max_frames,
            mode: config.mode,
            pushed: AtomicU64::new(0),
            played: AtomicU64::new(0),
            missing: AtomicU64::new(0),
            late: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> JitterBufferMode {
        self.mode
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Insert a received frame and wake any waiting consumer.
    ///
    /// A full buffer evicts its oldest frame (lowest sequence in reorder
    /// mode). In reorder mode a frame older than the playout cursor is
    /// dropped and counted as late instead of being enqueued.
    pub fn push(&self, frame: AudioFrame) {
        let mut state = self.state.lock().unwrap();
        self.pushed.fetch_add(1, Ordering::Relaxed);

        match &mut state.backend {
            Backend::Fifo(queue) => {
                if queue.len() == self.max_frames {
                    queue.pop_front();
                    self.overflow_dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(frame);
            }
            Backend::Reorder(reorder) => {
                let ext = reorder.extend_seq(frame.seq);
                if let Some(next_play) = reorder.next_play {
                    if ext < next_play {
                        self.late.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
                if !reorder.frames.contains_key(&ext) && reorder.frames.len() == self.max_frames {
                    // Keep the most recent window: evict the lowest sequence.
                    if let Some((&lowest, _)) = reorder.frames.first_key_value() {
                        reorder.frames.remove(&lowest);
                        self.overflow_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                reorder.frames.insert(ext, frame);
            }
        }

        if !state.primed && state.backend.len() >= state.target_frames {
            state.primed = true;
        }
        self.available.notify_all();
    }

    /// Take the next frame for playout, waiting up to `timeout`.
    ///
    /// Before priming this returns `None` without touching counters once
    /// the deadline passes. After priming, an occupancy at or below
    /// `max(1, target/2)` first waits out the remaining deadline for more
    /// frames; a buffer still empty at the deadline counts the playout
    /// slot as missing. In reorder mode a gap at the head yields a
    /// concealment frame instead of the lost one.
    pub fn pop(&self, timeout: Duration) -> Option<AudioFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();

        while !state.primed {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }

        let low_water = (state.target_frames / 2).max(1);
        while state.backend.len() <= low_water {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }

        while state.backend.len() == 0 {
            let now = Instant::now();
            if now >= deadline {
                self.missing.fetch_add(1, Ordering::Relaxed);
                self.played.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }

        self.played.fetch_add(1, Ordering::Relaxed);
        Some(self.take_head(&mut state))
    }

    fn take_head(&self, state: &mut State) -> AudioFrame {
        match &mut state.backend {
            Backend::Fifo(queue) => queue.pop_front().expect("checked non-empty"),
            Backend::Reorder(reorder) => {
                let next_play = match reorder.next_play {
                    Some(seq) => seq,
                    None => *reorder.frames.keys().next().expect("checked non-empty"),
                };
                reorder.next_play = Some(next_play + 1);
                match reorder.frames.remove(&next_play) {
                    Some(frame) => {
                        reorder.conceal = Some(frame.clone());
                        frame
                    }
                    None => {
                        self.missing.fetch_add(1, Ordering::Relaxed);
                        self.synthesize_gap_frame(reorder, next_play)
                    }
                }
            }
        }
    }

    /// Fade the previous frame towards zero for a lost sequence. Falls
    /// back to the next buffered frame's geometry (with zeroed samples)
    /// when no frame has played yet.
    fn synthesize_gap_frame(&self, reorder: &mut ReorderState, seq: u64) -> AudioFrame {
        match &mut reorder.conceal {
            Some(prev) => {
                for sample in &mut prev.samples {
                    *sample = (*sample as f32 * CONCEAL_FADE) as i16;
                }
                let mut frame = prev.clone();
                frame.seq = seq as u32;
                frame
            }
            None => {
                let template = reorder
                    .frames
                    .values()
                    .next()
                    .expect("gap implies a later frame is buffered");
                let mut frame = template.clone();
                frame.seq = seq as u32;
                frame.samples.iter_mut().for_each(|s| *s = 0);
                frame
            }
        }
    }

    /// Retune the steady-state occupancy, clamped to
    /// `[2, max_frames - 1]`. May prime the buffer if the new target is
    /// already met.
    pub fn set_target_frames(&self, target: usize) {
        let target = target.clamp(2, self.max_frames - 1);
        let mut state = self.state.lock().unwrap();
        state.target_frames = target;
        if !state.primed && state.backend.len() >= target {
            state.primed = true;
        }
        self.available.notify_all();
    }

    /// Wake every waiting consumer so shutdown is observed promptly.
    pub fn wake(&self) {
        let _state = self.state.lock().unwrap();
        self.available.notify_all();
    }

    pub fn snapshot(&self) -> JitterBufferSnapshot {
        let state = self.state.lock().unwrap();
        JitterBufferSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            played: self.played.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            buffered: state.backend.len(),
            target_frames: state.target_frames,
            primed: state.primed,
        }
    }
}
