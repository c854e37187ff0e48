//! Session core for a telephony speech-recognition adapter.
//!
//! Turns a continuous stream of linear audio frames into start/stop-of-speech
//! decisions, forwards live audio to a remote recognizer, optionally records
//! the raw audio for diagnostics, and writes a structured per-call event log.
//! The recognizer and the text-to-speech fallback are reached through the
//! [`backend::RecognitionBackend`] and [`synth::SynthesisClient`] traits.

pub mod backend;
pub mod call_log;
pub mod config;
mod lock;
pub mod recording;
pub mod session;
pub mod synth;
pub mod telemetry;
pub mod ulaw;
pub mod vad;

pub(crate) use lock::lock_or_recover;

pub use backend::{AudioWriteState, BackendResult, CallEventSink, RecognitionBackend};
pub use call_log::{CallLog, CallLogKind};
pub use config::{AgentCredentials, ConfigSnapshot, ConfigStore};
pub use session::{Session, SpeechResult, SpeechState};
pub use synth::SynthesisClient;
pub use vad::{VadState, VadTracker, VadTransition, VadTuning};
