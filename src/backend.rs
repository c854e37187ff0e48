//! Client abstraction over the remote streaming recognizer.
//!
//! The session drives one backend handle per call: credentials are pushed at
//! activation, recognition starts when the endpointer detects speech, and the
//! µ-law stream is fed frame by frame until the backend finishes or errors.
//! Implementations own their interior mutability; every method takes `&self`
//! so the session never holds its state lock across a backend call.

use anyhow::Result;
use std::sync::Arc;

/// Outcome of feeding one frame to the recognizer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AudioWriteState {
    /// Keep streaming audio.
    Continuing,
    /// The backend has a final result; stop feeding.
    Finished,
    /// The stream is dead; stop feeding.
    Errored,
}

/// One recognition slot as enumerated by the backend.
///
/// `audio` carries binary fulfillment audio (the `output_audio` slot);
/// ordinary slots put their payload in `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResult {
    pub slot: String,
    pub value: String,
    pub audio: Option<Vec<u8>>,
    pub score: i32,
}

/// Sink for call-scoped events the backend raises on its own threads
/// (routed into the per-call event log as backend-type entries).
pub type CallEventSink = Arc<dyn Fn(&str, &[(String, String)]) + Send + Sync>;

/// Remote streaming speech-recognition client.
pub trait RecognitionBackend: Send + Sync {
    fn set_auth_key(&self, key: &str);
    fn set_endpoint(&self, endpoint: &str);
    fn set_project_id(&self, project_id: &str);
    fn set_session_id(&self, session_id: &str);

    fn session_id(&self) -> String;
    fn project_id(&self) -> String;

    /// Begin a streaming recognition for the given language.
    fn start_recognition(&self, language: &str) -> Result<()>;

    /// Prime the backend with a named event (e.g. a greeting) instead of audio.
    fn recognize_event(&self, event: &str, language: &str) -> Result<()>;

    /// Feed one µ-law frame to an active recognition.
    fn write_audio(&self, ulaw: &[u8]) -> AudioWriteState;

    /// Drain the accumulated recognition results.
    fn results(&self) -> Vec<BackendResult>;

    fn stop_recognition(&self);

    fn close(&self);
}
