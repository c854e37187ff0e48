//! Voice activity detection for speech/silence endpointing.
//!
//! A Mealy-style state machine re-evaluated once per audio frame: the frame's
//! average absolute level is compared against a threshold, and cumulative
//! "opposite of current state" time drives the `Start -> Speaking` and
//! `Speaking -> Silent` transitions with hysteresis.

use tracing::trace;

/// Telephony audio is 8 kHz, so one millisecond is eight samples.
pub const SAMPLES_PER_MS: usize = 8;

/// Endpointer phase within one recognition cycle.
///
/// `Silent` is terminal: multi-utterance turns are expressed as repeated
/// recognition starts, each of which resets the tracker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VadState {
    Start,
    Speaking,
    Silent,
}

/// Transition reported for the frame that crossed a hysteresis boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VadTransition {
    StartOfSpeech,
    EndOfSpeech,
}

impl VadTransition {
    pub fn event_name(self) -> &'static str {
        match self {
            VadTransition::StartOfSpeech => "start_of_speech",
            VadTransition::EndOfSpeech => "end_of_speech",
        }
    }
}

/// Tunable endpointing parameters, copied from configuration at session
/// creation and individually overridable per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadTuning {
    /// Average absolute sample level at or above which a frame counts as loud.
    pub voice_threshold: i32,
    /// Cumulative loud audio required to leave `Start` (milliseconds).
    pub voice_min_ms: i32,
    /// Cumulative quiet audio required to leave `Speaking` (milliseconds).
    pub silence_min_ms: i32,
}

impl Default for VadTuning {
    fn default() -> Self {
        Self {
            voice_threshold: 512,
            voice_min_ms: 40,
            silence_min_ms: 500,
        }
    }
}

/// Per-session endpointer state: current phase plus the two duration counters.
#[derive(Debug, Clone, Copy)]
pub struct VadTracker {
    state: VadState,
    /// Time spent in the current state (diagnostic only).
    state_duration_ms: i32,
    /// Cumulative time of audio classified opposite to the current state.
    change_duration_ms: i32,
}

impl Default for VadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl VadTracker {
    pub fn new() -> Self {
        Self {
            state: VadState::Start,
            state_duration_ms: 0,
            change_duration_ms: 0,
        }
    }

    /// Reset to `Start` with zeroed counters, ready for a new recognition.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn state_duration_ms(&self) -> i32 {
        self.state_duration_ms
    }

    pub fn change_duration_ms(&self) -> i32 {
        self.change_duration_ms
    }

    /// Classify one frame and fire at most one transition.
    ///
    /// Loud frames accumulate `change_duration` toward `Speaking` while not
    /// in `Speaking` and reset it otherwise; quiet frames do the reverse. A
    /// transition zeroes both counters, so silence must be contiguous
    /// (modulo the reset rule) to end an utterance. Empty frames are a no-op.
    pub fn observe(&mut self, frame: &[i16], tuning: &VadTuning) -> Option<VadTransition> {
        if frame.is_empty() {
            return None;
        }
        let frame_ms = (frame.len() / SAMPLES_PER_MS) as i32;
        let level = average_level(frame);

        self.state_duration_ms = self.state_duration_ms.saturating_add(frame_ms);

        let loud = level >= tuning.voice_threshold;
        let speaking = self.state == VadState::Speaking;
        if loud != speaking {
            self.change_duration_ms = self.change_duration_ms.saturating_add(frame_ms);
        } else {
            self.change_duration_ms = 0;
        }

        let transition = match self.state {
            VadState::Start if self.change_duration_ms >= tuning.voice_min_ms => {
                self.state = VadState::Speaking;
                Some(VadTransition::StartOfSpeech)
            }
            VadState::Speaking if self.change_duration_ms >= tuning.silence_min_ms => {
                self.state = VadState::Silent;
                Some(VadTransition::EndOfSpeech)
            }
            _ => None,
        };
        if transition.is_some() {
            self.state_duration_ms = 0;
            self.change_duration_ms = 0;
        }

        trace!(
            level,
            threshold = tuning.voice_threshold,
            state = ?self.state,
            change_ms = self.change_duration_ms,
            "vad frame"
        );

        transition
    }
}

/// Truncating integer mean of absolute sample magnitudes.
pub fn average_level(frame: &[i16]) -> i32 {
    if frame.is_empty() {
        return 0;
    }
    let sum: i64 = frame.iter().map(|&s| i64::from(s).abs()).sum();
    (sum / frame.len() as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(level: i16, ms: usize) -> Vec<i16> {
        vec![level; ms * SAMPLES_PER_MS]
    }

    fn tuning() -> VadTuning {
        VadTuning {
            voice_threshold: 500,
            voice_min_ms: 40,
            silence_min_ms: 500,
        }
    }

    #[test]
    fn average_level_truncates() {
        assert_eq!(average_level(&[1, 2]), 1);
        assert_eq!(average_level(&[-4, 4, 5]), 4);
        assert_eq!(average_level(&[]), 0);
    }

    #[test]
    fn speech_starts_once_voice_minimum_accumulates() {
        let mut vad = VadTracker::new();
        let t = tuning();
        // 20 ms loud frames: 40 ms is reached exactly at the end of frame 2.
        assert_eq!(vad.observe(&frame(900, 20), &t), None);
        assert_eq!(
            vad.observe(&frame(900, 20), &t),
            Some(VadTransition::StartOfSpeech)
        );
        assert_eq!(vad.state(), VadState::Speaking);
        assert_eq!(vad.change_duration_ms(), 0);
        assert_eq!(vad.state_duration_ms(), 0);
    }

    #[test]
    fn quiet_frame_resets_voice_accumulation() {
        let mut vad = VadTracker::new();
        let t = tuning();
        assert_eq!(vad.observe(&frame(900, 20), &t), None);
        assert_eq!(vad.observe(&frame(10, 20), &t), None);
        assert_eq!(vad.change_duration_ms(), 0);
        // No partial credit carries over: two more loud frames are needed.
        assert_eq!(vad.observe(&frame(900, 20), &t), None);
        assert_eq!(
            vad.observe(&frame(900, 20), &t),
            Some(VadTransition::StartOfSpeech)
        );
    }

    #[test]
    fn loud_frame_resets_silence_accumulation_while_speaking() {
        let mut vad = VadTracker::new();
        let t = tuning();
        vad.observe(&frame(900, 40), &t);
        assert_eq!(vad.state(), VadState::Speaking);
        for _ in 0..24 {
            assert_eq!(vad.observe(&frame(10, 20), &t), None);
        }
        // One loud frame wipes 480 ms of accumulated silence.
        assert_eq!(vad.observe(&frame(900, 20), &t), None);
        assert_eq!(vad.change_duration_ms(), 0);
        for _ in 0..24 {
            assert_eq!(vad.observe(&frame(10, 20), &t), None);
        }
        assert_eq!(
            vad.observe(&frame(10, 20), &t),
            Some(VadTransition::EndOfSpeech)
        );
        assert_eq!(vad.state(), VadState::Silent);
    }

    #[test]
    fn end_to_end_scenario_two_loud_then_25_quiet_frames() {
        // threshold=500, voice_min=40ms, silence_min=500ms, 20ms frames of
        // 160 samples at 8kHz.
        let mut vad = VadTracker::new();
        let t = tuning();
        assert_eq!(vad.observe(&frame(900, 20), &t), None);
        assert_eq!(vad.state(), VadState::Start);
        assert_eq!(
            vad.observe(&frame(900, 20), &t),
            Some(VadTransition::StartOfSpeech)
        );
        for i in 0..24 {
            assert_eq!(vad.observe(&frame(0, 20), &t), None, "frame {i}");
        }
        // end_of_speech fires after frame 25, not frame 24.
        assert_eq!(
            vad.observe(&frame(0, 20), &t),
            Some(VadTransition::EndOfSpeech)
        );
    }

    #[test]
    fn silent_state_is_terminal() {
        let mut vad = VadTracker::new();
        let t = tuning();
        vad.observe(&frame(900, 40), &t);
        vad.observe(&frame(0, 500), &t);
        assert_eq!(vad.state(), VadState::Silent);
        assert_eq!(vad.observe(&frame(900, 500), &t), None);
        assert_eq!(vad.state(), VadState::Silent);
    }

    #[test]
    fn empty_frame_is_a_no_op() {
        let mut vad = VadTracker::new();
        let t = tuning();
        assert_eq!(vad.observe(&[], &t), None);
        assert_eq!(vad.state_duration_ms(), 0);
    }

    #[test]
    fn reset_restores_start() {
        let mut vad = VadTracker::new();
        let t = tuning();
        vad.observe(&frame(900, 40), &t);
        assert_eq!(vad.state(), VadState::Speaking);
        vad.reset();
        assert_eq!(vad.state(), VadState::Start);
        assert_eq!(vad.change_duration_ms(), 0);
    }
}
