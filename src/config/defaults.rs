//! Documented defaults applied when configuration is missing or partial.

pub const DEFAULT_VAD_VOICE_THRESHOLD: i32 = 512;
pub const DEFAULT_VAD_VOICE_MIN_MS: i32 = 40;
pub const DEFAULT_VAD_SILENCE_MIN_MS: i32 = 500;

pub const DEFAULT_ENABLE_CALL_LOGS: bool = true;
pub const DEFAULT_ENABLE_PREENDPOINTER_RECORDINGS: bool = false;
pub const DEFAULT_ENABLE_POSTENDPOINTER_RECORDINGS: bool = false;

/// `${APPLICATION}` is substituted per call; `%` tokens render as local time.
pub const DEFAULT_CALL_LOG_LOCATION: &str = "/var/log/dialogflow/${APPLICATION}/%Y/%m/%d/%H/";
