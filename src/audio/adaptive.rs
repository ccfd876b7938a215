//! Adaptive retuning of the jitter-buffer target
//!
//! Pure decision logic fed once per one-second stats window. Takes the
//! window's counter deltas plus the current buffer occupancy and produces
//! the next target occupancy. No side effects and no locking here; the
//! caller commits accepted changes to the jitter buffer.
//!
//! The controller scores each window, tracks an EMA of the score, and
//! reacts to streaks rather than single windows: consecutive bad windows
//! (or a persistently empty buffer) raise the target, a long run of clean
//! windows lowers it back towards the configured baseline. Every change is
//! followed by a two-window cooldown so the controller cannot oscillate.

/// Weight of a playout underrun in the window score
const SCORE_UNDERRUN: i64 = 25;
/// Weight of a missing (timed-out) frame
const SCORE_MISSING: i64 = 18;
/// Weight of a packet parse failure
const SCORE_PARSE_ERR: i64 = 50;
/// Weight of a payload size mismatch
const SCORE_PAYLOAD_ERR: i64 = 40;
/// Weight of an overflow drop
const SCORE_OVERFLOW: i64 = 2;
/// Weight of each frame the buffer sits below half target
const SCORE_STARVED_FRAME: i64 = 3;

/// EMA smoothing: ema = 0.85 * ema + 0.15 * score
const EMA_KEEP: f64 = 0.85;
const EMA_BLEND: f64 = 0.15;

/// Windows to hold after any target change
const COOLDOWN_WINDOWS: u32 = 2;
/// Clean windows required before lowering the target
const GOOD_STREAK_TO_LOWER: u32 = 8;
/// Hard ceiling on the target range
const TARGET_CEILING: usize = 32;

/// Counter deltas for one stats window.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowDeltas {
    pub underruns: u64,
    pub missing: u64,
    pub overflow: u64,
    pub parse_errors: u64,
    pub payload_errors: u64,
}

/// Why the controller last moved the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdjustReason {
    /// No change yet this session
    #[default]
    None,
    /// Raised after a bad window or starved buffer
    Raise,
    /// Raised hard after severe loss or corruption
    RaiseSevere,
    /// Lowered after a sustained clean stream
    LowerStable,
}

impl AdjustReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustReason::None => "none",
            AdjustReason::Raise => "raise",
            AdjustReason::RaiseSevere => "raise-severe",
            AdjustReason::LowerStable => "lower-stable",
        }
    }
}

/// Per-session controller state.
#[derive(Debug)]
pub struct AdaptiveController {
    base_target: usize,
    min_target: usize,
    max_target: usize,
    score_ema: f64,
    last_window_score: i64,
    bad_streak: u32,
    good_streak: u32,
    zero_buffer_streak: u32,
    cooldown_sec: u32,
    last_reason: AdjustReason,
}

impl AdaptiveController {
    /// Create a controller around the target chosen at audio init.
    ///
    /// The adjustable range is `[max(2, base - 1), max(min + 2, min(32, base + 8))]`.
    pub fn new(base_target: usize) -> Self {
        let base_target = base_target.max(2);
        let min_target = (base_target - 1).max(2);
        let max_target = (base_target + 8).min(TARGET_CEILING).max(min_target + 2);
        Self {
            base_target,
            min_target,
            max_target,
            score_ema: 100.0,
            last_window_score: 100,
            bad_streak: 0,
            good_streak: 0,
            zero_buffer_streak: 0,
            cooldown_sec: 0,
            last_reason: AdjustReason::None,
        }
    }

    pub fn base_target(&self) -> usize {
        self.base_target
    }

    pub fn min_target(&self) -> usize {
        self.min_target
    }

    pub fn max_target(&self) -> usize {
        self.max_target
    }

    pub fn score_ema(&self) -> f64 {
        self.score_ema
    }

    pub fn last_window_score(&self) -> i64 {
        self.last_window_score
    }

    pub fn last_reason(&self) -> AdjustReason {
        self.last_reason
    }

    /// Feed one window of observations. Returns the new target when the
    /// controller decides to move it; the caller commits the change.
    pub fn observe(
        &mut self,
        deltas: &WindowDeltas,
        buffered: usize,
        target_frames: usize,
    ) -> Option<usize> {
        let half_target = (target_frames / 2).max(1);

        let mut score = 100
            - SCORE_UNDERRUN * deltas.underruns as i64
            - SCORE_MISSING * deltas.missing as i64
            - SCORE_PARSE_ERR * deltas.parse_errors as i64
            - SCORE_PAYLOAD_ERR * deltas.payload_errors as i64
            - SCORE_OVERFLOW * deltas.overflow as i64
            - (half_target as i64 - buffered as i64).max(0) * SCORE_STARVED_FRAME;
        score = score.clamp(0, 100);
        self.last_window_score = score;
        self.score_ema = EMA_KEEP * self.score_ema + EMA_BLEND * score as f64;

        let had_loss = deltas.underruns > 0
            || deltas.missing > 0
            || deltas.parse_errors > 0
            || deltas.payload_errors > 0;
        let bad_now = had_loss || self.score_ema < 90.0;
        let good_now = !bad_now
            && deltas.overflow == 0
            && self.score_ema > 97.0
            && buffered >= half_target
            && buffered > 0;

        if buffered == 0 {
            self.zero_buffer_streak += 1;
        } else {
            self.zero_buffer_streak = 0;
        }
        if bad_now {
            self.bad_streak += 1;
        } else {
            self.bad_streak = self.bad_streak.saturating_sub(1);
        }
        if good_now {
            self.good_streak += 1;
        } else {
            self.good_streak = 0;
        }

        if self.cooldown_sec > 0 {
            self.cooldown_sec -= 1;
            return None;
        }

        let severe = deltas.underruns >= 2
            || deltas.missing >= 2
            || deltas.parse_errors > 0
            || deltas.payload_errors > 0;
        let raise_by_buffer = self.zero_buffer_streak >= 2;

        let decision = if (self.bad_streak >= 1 || raise_by_buffer) && target_frames < self.max_target
        {
            let step = if severe || self.zero_buffer_streak >= 3 {
                2
            } else {
                1
            };
            let reason = if severe {
                AdjustReason::RaiseSevere
            } else {
                AdjustReason::Raise
            };
            Some((target_frames + step, reason))
        } else if self.good_streak >= GOOD_STREAK_TO_LOWER && target_frames > self.min_target {
            let step = if target_frames > self.base_target + 3 {
                2
            } else {
                1
            };
            Some((target_frames.saturating_sub(step), AdjustReason::LowerStable))
        } else {
            None
        };

        let (new_target, reason) = decision?;
        let new_target = new_target.clamp(self.min_target, self.max_target);
        self.last_reason = reason;
        self.bad_streak = 0;
        self.good_streak = 0;
        self.zero_buffer_streak = 0;
        self.cooldown_sec = COOLDOWN_WINDOWS;
        Some(new_target)
    }
}
