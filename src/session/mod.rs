//! The per-call session: aggregate root owning VAD state, recording streams,
//! the call log, and the backend client reference.
//!
//! One media thread drives `write_audio` serially; an administrative thread
//! may concurrently get/set properties or tear the session down. All shared
//! fields live behind the state mutex, held only for field access. The
//! recording streams have their own lock (single writer, the audio thread),
//! and call-log appends serialize inside [`CallLog`]; no lock is ever held
//! across a backend call.


use crate::backend::{AudioWriteState, CallEventSink, RecognitionBackend};
use crate::call_log::{CallLog, CallLogKind};
use crate::config::ConfigSnapshot;
use crate::lock_or_recover;
use crate::recording::RecordingStreams;
use crate::synth::SynthesisClient;
use crate::ulaw;
use crate::vad::{VadState, VadTracker, VadTuning};
use anyhow::{bail, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

const PROP_SESSION_ID: &str = "session_id";
const PROP_ALTERNATE_SESSION_ID: &str = "name";
const PROP_PROJECT_ID: &str = "project_id";
const PROP_LANGUAGE: &str = "language";
const PROP_LOG_CONTEXT: &str = "log_context";
const PROP_ALTERNATE_LOG_CONTEXT: &str = "logContext";
const PROP_APPLICATION: &str = "application";
const PROP_VOICE_THRESHOLD: &str = "voice_threshold";
const PROP_VOICE_DURATION: &str = "voice_duration";
const PROP_SILENCE_DURATION: &str = "silence_duration";

const EVENT_PREFIX: &str = "event:";
const BUILTIN_GRAMMAR_PREFIX: &str = "builtin:grammar/";

/// Host-visible recognition state of the session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpeechState {
    /// Created or activated, not yet started.
    NotReady,
    /// Recognition started, accepting audio.
    Ready,
    /// Recognition finished; results may be collected.
    Done,
}

/// One recognition result handed back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechResult {
    pub text: String,
    pub score: i32,
    /// Slot name for ordinary results; `fulfillment_audio` for the
    /// synthesized/binary audio result.
    pub grammar: String,
}

struct SessionState {
    speech_state: SpeechState,
    session_id: String,
    logical_agent_name: String,
    project_id: String,
    service_key: String,
    endpoint: String,
    /// Event queued by `activate`, consumed by the next `start`.
    event: String,
    language: String,
    call_logging_application_name: String,
    call_logging_context: String,
    last_audio_response: String,
    vad: VadTracker,
    tuning: VadTuning,
    utterance_counter: u32,
}

/// One recognition conversation. Created when a call requests speech
/// recognition, destroyed when the call releases it.
pub struct Session {
    config: Arc<ConfigSnapshot>,
    backend: Arc<dyn RecognitionBackend>,
    synth: Arc<dyn SynthesisClient>,
    call_log: Arc<CallLog>,
    state: Mutex<SessionState>,
    streams: Mutex<RecordingStreams>,
}

impl Session {
    /// Allocate a session against the given configuration snapshot.
    ///
    /// The snapshot is cached for the session's lifetime: a configuration
    /// reload never affects an active call.
    pub fn new(
        config: Arc<ConfigSnapshot>,
        backend: Arc<dyn RecognitionBackend>,
        synth: Arc<dyn SynthesisClient>,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        backend.set_auth_key(&config.service_key);
        backend.set_endpoint(&config.endpoint);
        backend.set_session_id(&session_id);

        let state = SessionState {
            speech_state: SpeechState::NotReady,
            session_id,
            logical_agent_name: String::new(),
            project_id: String::new(),
            service_key: config.service_key.clone(),
            endpoint: config.endpoint.clone(),
            event: String::new(),
            language: String::new(),
            call_logging_application_name: "unknown".to_string(),
            call_logging_context: String::new(),
            last_audio_response: String::new(),
            vad: VadTracker::new(),
            tuning: config.vad,
            utterance_counter: 0,
        };

        Self {
            config,
            backend,
            synth,
            call_log: Arc::new(CallLog::new()),
            state: Mutex::new(state),
            streams: Mutex::new(RecordingStreams::new()),
        }
    }

    pub fn speech_state(&self) -> SpeechState {
        lock_or_recover(&self.state, "session state read").speech_state
    }

    pub fn session_id(&self) -> String {
        lock_or_recover(&self.state, "session id read")
            .session_id
            .clone()
    }

    /// Sink the host registers with the backend so backend-originated call
    /// events land in this session's log. Safe to invoke from any thread.
    pub fn call_event_sink(&self) -> CallEventSink {
        let call_log = Arc::clone(&self.call_log);
        Arc::new(move |event, data| {
            call_log.log_event(CallLogKind::Dialogflow, event, data);
        })
    }

    /// Apply a grammar directive: either the `event:<name>` shorthand that
    /// primes the next `start` with a named event, or
    /// `builtin:grammar/<agent>[?<event>]` which resolves the agent against
    /// the logical agent directory (falling back to the raw name as project
    /// id) and reconfigures the backend client.
    pub fn activate(&self, directive: &str) -> Result<()> {
        if let Some(event) = strip_prefix_ignore_case(directive, EVENT_PREFIX) {
            let mut state = lock_or_recover(&self.state, "activate event");
            debug!("Activating event {event} on {}", state.session_id);
            state.event = event.to_string();
            return Ok(());
        }

        if let Some(target) = strip_prefix_ignore_case(directive, BUILTIN_GRAMMAR_PREFIX) {
            let (name, event) = match target.split_once('?') {
                Some((name, event)) => (name, event),
                None => (target, ""),
            };
            self.activate_agent(name, event);
            return Ok(());
        }

        let session_id = self.session_id();
        warn!("Do not understand grammar name {directive} on {session_id}");
        bail!("unrecognized grammar directive '{directive}'");
    }

    fn activate_agent(&self, name: &str, event: &str) {
        let agent = self.config.agent(name);
        let (project_id, service_key, endpoint) = {
            let mut state = lock_or_recover(&self.state, "activate agent");
            state.logical_agent_name = name.to_string();
            state.project_id = agent
                .as_ref()
                .map(|agent| agent.project_id.clone())
                .unwrap_or_else(|| name.to_string());
            state.service_key = agent
                .as_ref()
                .and_then(|agent| agent.service_key.clone())
                .unwrap_or_else(|| self.config.service_key.clone());
            state.endpoint = agent
                .as_ref()
                .and_then(|agent| agent.endpoint.clone())
                .unwrap_or_else(|| self.config.endpoint.clone());
            state.event = event.to_string();
            (
                state.project_id.clone(),
                state.service_key.clone(),
                state.endpoint.clone(),
            )
        };

        self.backend.set_project_id(&project_id);
        self.backend.set_endpoint(&endpoint);
        self.backend.set_auth_key(&service_key);

        if event.is_empty() {
            debug!("Activating project {project_id} ('{name}') on {}", self.session_id());
        } else {
            debug!(
                "Activating project {project_id} ('{name}'), event {event} on {}",
                self.session_id()
            );
        }
    }

    /// Set a string-keyed session property. Empty values where one is
    /// required, non-numeric VAD values, and unknown names are rejected
    /// without touching state.
    pub fn change(&self, name: &str, value: &str) -> Result<()> {
        if matches_prop(name, PROP_SESSION_ID) || matches_prop(name, PROP_ALTERNATE_SESSION_ID) {
            if value.is_empty() {
                warn!(
                    "Session ID must have a value, refusing to set to nothing (remains {})",
                    self.backend.session_id()
                );
                bail!("session id must not be empty");
            }
            self.backend.set_session_id(value);
            lock_or_recover(&self.state, "change session id").session_id = value.to_string();
        } else if matches_prop(name, PROP_PROJECT_ID) {
            if value.is_empty() {
                warn!(
                    "Project ID must have a value, refusing to set to nothing (remains {})",
                    self.backend.project_id()
                );
                bail!("project id must not be empty");
            }
            lock_or_recover(&self.state, "change project id").project_id = value.to_string();
            self.backend.set_project_id(value);
        } else if matches_prop(name, PROP_LANGUAGE) {
            lock_or_recover(&self.state, "change language").language = value.to_string();
        } else if matches_prop(name, PROP_LOG_CONTEXT) || matches_prop(name, PROP_ALTERNATE_LOG_CONTEXT)
        {
            lock_or_recover(&self.state, "change log context").call_logging_context =
                value.to_string();
        } else if matches_prop(name, PROP_APPLICATION) {
            lock_or_recover(&self.state, "change application").call_logging_application_name =
                value.to_string();
        } else if matches_prop(name, PROP_VOICE_THRESHOLD) {
            let parsed = parse_vad_value(PROP_VOICE_THRESHOLD, value)?;
            lock_or_recover(&self.state, "change voice threshold")
                .tuning
                .voice_threshold = parsed;
        } else if matches_prop(name, PROP_VOICE_DURATION) {
            let parsed = parse_vad_value(PROP_VOICE_DURATION, value)?;
            lock_or_recover(&self.state, "change voice duration")
                .tuning
                .voice_min_ms = parsed;
        } else if matches_prop(name, PROP_SILENCE_DURATION) {
            let parsed = parse_vad_value(PROP_SILENCE_DURATION, value)?;
            lock_or_recover(&self.state, "change silence duration")
                .tuning
                .silence_min_ms = parsed;
        } else {
            warn!("Unknown property '{name}'");
            bail!("unknown property '{name}'");
        }
        Ok(())
    }

    /// Read a string-keyed session property.
    pub fn get(&self, name: &str) -> Result<String> {
        if matches_prop(name, PROP_SESSION_ID) || matches_prop(name, PROP_ALTERNATE_SESSION_ID) {
            return Ok(self.backend.session_id());
        }
        if matches_prop(name, PROP_PROJECT_ID) {
            return Ok(self.backend.project_id());
        }
        let state = lock_or_recover(&self.state, "property read");
        if matches_prop(name, PROP_LANGUAGE) {
            Ok(state.language.clone())
        } else if matches_prop(name, PROP_LOG_CONTEXT) || matches_prop(name, PROP_ALTERNATE_LOG_CONTEXT)
        {
            Ok(state.call_logging_context.clone())
        } else if matches_prop(name, PROP_APPLICATION) {
            Ok(state.call_logging_application_name.clone())
        } else if matches_prop(name, PROP_VOICE_THRESHOLD) {
            Ok(state.tuning.voice_threshold.to_string())
        } else if matches_prop(name, PROP_VOICE_DURATION) {
            Ok(state.tuning.voice_min_ms.to_string())
        } else if matches_prop(name, PROP_SILENCE_DURATION) {
            Ok(state.tuning.silence_min_ms.to_string())
        } else {
            warn!("Unknown property '{name}'");
            bail!("unknown property '{name}'")
        }
    }

    /// Begin one recognition attempt.
    ///
    /// Resets the endpointer, bumps the utterance counter, opens the call
    /// log on the first attempt of the call, and either primes the backend
    /// with the pending event (success ends the attempt immediately) or
    /// enters `Ready` to receive audio.
    pub fn start(&self) {
        let (event, language, project_id, logical_agent_name, context, application, session_id);
        let (utterance, tuning);
        {
            let mut state = lock_or_recover(&self.state, "start");
            event = std::mem::take(&mut state.event);
            language = state.language.clone();
            project_id = state.project_id.clone();
            logical_agent_name = state.logical_agent_name.clone();
            context = state.call_logging_context.clone();
            application = state.call_logging_application_name.clone();
            session_id = state.session_id.clone();
            state.vad.reset();
            state.utterance_counter += 1;
            utterance = state.utterance_counter;
            tuning = state.tuning;
        }
        lock_or_recover(&self.streams, "start").reset_for_utterance();

        if self.config.enable_call_logs && !self.call_log.open_already_attempted() {
            self.call_log
                .open_once(&self.config.call_log_location, &application, &session_id);
        }

        self.call_log.log_event(
            CallLogKind::Session,
            "start",
            &[
                ("event".to_string(), event.clone()),
                ("language".to_string(), language.clone()),
                ("project_id".to_string(), project_id),
                ("logical_agent_name".to_string(), logical_agent_name),
                ("utterance".to_string(), utterance.to_string()),
                ("context".to_string(), context),
                ("application".to_string(), application),
            ],
        );
        self.call_log.log_event(
            CallLogKind::Endpointer,
            "start",
            &[
                (
                    PROP_VOICE_THRESHOLD.to_string(),
                    tuning.voice_threshold.to_string(),
                ),
                (
                    PROP_VOICE_DURATION.to_string(),
                    tuning.voice_min_ms.to_string(),
                ),
                (
                    PROP_SILENCE_DURATION.to_string(),
                    tuning.silence_min_ms.to_string(),
                ),
            ],
        );

        if !event.is_empty() {
            match self.backend.recognize_event(&event, &language) {
                Ok(()) => self.stop(),
                Err(err) => {
                    warn!("Error recognizing event on {session_id}: {err}");
                    lock_or_recover(&self.state, "start revert").speech_state =
                        SpeechState::NotReady;
                }
            }
        } else {
            lock_or_recover(&self.state, "start ready").speech_state = SpeechState::Ready;
        }
    }

    /// The hot path: classify one linear frame, drive the endpointer, and
    /// route live audio to the recordings and the backend.
    pub fn write_audio(&self, frame: &[i16]) {
        let (orig_state, new_state, transition, language, session_id, utterance);
        {
            let mut state = lock_or_recover(&self.state, "write audio");
            let tuning = state.tuning;
            orig_state = state.vad.state();
            transition = state.vad.observe(frame, &tuning);
            new_state = state.vad.state();
            language = state.language.clone();
            session_id = state.session_id.clone();
            utterance = state.utterance_counter;
        }

        if let Some(transition) = transition {
            self.call_log
                .log_event_only(CallLogKind::Endpointer, transition.event_name());
        }

        if new_state == VadState::Speaking && orig_state == VadState::Start {
            if let Err(err) = self.backend.start_recognition(&language) {
                warn!("Error starting recognition on {session_id}: {err}");
                self.stop();
                return;
            }
        }

        if new_state != VadState::Start {
            let mulaw = ulaw::encode_frame(frame);
            self.record_audio(&mulaw, new_state, utterance, &session_id);
            match self.backend.write_audio(&mulaw) {
                AudioWriteState::Continuing => {}
                AudioWriteState::Finished | AudioWriteState::Errored => {
                    self.backend.stop_recognition();
                    self.stop();
                }
            }
        } else if self.config.enable_preendpointer_recordings {
            // Still deciding: keep the lead-in on the pre-endpoint stream
            // without sending anything to the backend.
            let mulaw = ulaw::encode_frame(frame);
            self.record_audio(&mulaw, new_state, utterance, &session_id);
        }
    }

    fn record_audio(&self, mulaw: &[u8], vad_state: VadState, utterance: u32, session_id: &str) {
        let pre_enabled = self.config.enable_preendpointer_recordings;
        let post_enabled = self.config.enable_postendpointer_recordings;
        if !pre_enabled && !post_enabled {
            return;
        }
        let mut streams = lock_or_recover(&self.streams, "record audio");
        if pre_enabled {
            streams.pre.write(&self.call_log, session_id, utterance, mulaw);
        }
        if post_enabled && vad_state == VadState::Speaking {
            streams.post.write(&self.call_log, session_id, utterance, mulaw);
        }
    }

    /// End the current recognition attempt: close both recording streams,
    /// mark the session `Done`, and write the session-end event. Idempotent
    /// and always succeeds from the caller's perspective.
    pub fn stop(&self) {
        lock_or_recover(&self.streams, "stop").close_all(&self.call_log);
        lock_or_recover(&self.state, "stop").speech_state = SpeechState::Done;
        self.call_log.log_event_only(CallLogKind::Session, "end");
    }

    /// Drain the backend's results.
    ///
    /// Ordinary slots come back in backend order with their score and slot
    /// name as the grammar tag. Binary `output_audio` is written to a fresh
    /// temporary file; failing that, a non-empty `fulfillment_text` slot is
    /// synthesized. Either way the (at most one) audio result is appended
    /// last, tagged `fulfillment_audio`, and the previous call's temporary
    /// audio file is deleted.
    pub fn get_results(&self) -> Vec<SpeechResult> {
        let mut results = Vec::new();
        let mut output_audio: Option<Vec<u8>> = None;
        let mut fulfillment_text: Option<String> = None;

        for result in self.backend.results() {
            if result.slot.eq_ignore_ascii_case("output_audio") {
                output_audio =
                    Some(result.audio.unwrap_or_else(|| result.value.into_bytes()));
                continue;
            }
            if result.slot.eq_ignore_ascii_case("fulfillment_text") && !result.value.is_empty() {
                fulfillment_text = Some(result.value.clone());
            }
            results.push(SpeechResult {
                text: result.value,
                score: result.score,
                grammar: result.slot,
            });
        }

        let mut audio_file: Option<PathBuf> = None;
        if let Some(bytes) = output_audio {
            match create_fulfillment_file() {
                Ok(path) => {
                    if let Err(err) = fs::write(&path, &bytes) {
                        warn!("Short write to temporary file for fulfillment message: {err}");
                    }
                    results.push(SpeechResult {
                        text: path.display().to_string(),
                        score: 100,
                        grammar: "fulfillment_audio".to_string(),
                    });
                    audio_file = Some(path);
                }
                Err(err) => {
                    warn!("Unable to create temporary file for fulfillment message: {err}");
                }
            }
        } else if let Some(text) = fulfillment_text {
            let language = lock_or_recover(&self.state, "results language")
                .language
                .clone();
            match create_fulfillment_file() {
                Ok(path) => {
                    audio_file = Some(path.clone());
                    match self.synth.synthesize(
                        &self.config.service_key,
                        &text,
                        &language,
                        None,
                        &path,
                    ) {
                        Ok(()) => results.push(SpeechResult {
                            text: path.display().to_string(),
                            score: 100,
                            grammar: "fulfillment_audio".to_string(),
                        }),
                        Err(err) => {
                            warn!(
                                "Failed to synthesize fulfillment text to {}: {err}",
                                path.display()
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!("Unable to create temporary file for fulfillment message: {err}");
                }
            }
        }

        if let Some(path) = audio_file {
            let mut state = lock_or_recover(&self.state, "results audio file");
            if !state.last_audio_response.is_empty() {
                let _ = fs::remove_file(&state.last_audio_response);
            }
            state.last_audio_response = path.display().to_string();
        }

        results
    }

    /// Release the session. Safe to invoke at any point in the lifecycle,
    /// including before any audio was ever received.
    pub fn destroy(&self) {
        let (speech_state, last_audio) = {
            let mut state = lock_or_recover(&self.state, "destroy");
            (
                state.speech_state,
                std::mem::take(&mut state.last_audio_response),
            )
        };
        if speech_state == SpeechState::Ready {
            self.backend.stop_recognition();
        }
        if !last_audio.is_empty() {
            let _ = fs::remove_file(&last_audio);
        }
        self.backend.close();
        self.call_log.close();
    }
}

fn matches_prop(name: &str, prop: &str) -> bool {
    name.eq_ignore_ascii_case(prop)
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn parse_vad_value(prop: &str, value: &str) -> Result<i32> {
    if value.is_empty() {
        warn!("Cannot set {prop} to an empty value");
        bail!("cannot set {prop} to an empty value");
    }
    match value.parse::<i32>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            warn!("Invalid value for {prop} -- '{value}'");
            bail!("invalid value for {prop}: '{value}'")
        }
    }
}

fn create_fulfillment_file() -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("callpoint_fulfillment_")
        .suffix(".wav")
        .tempfile()?;
    let (_, path) = file.keep()?;
    Ok(path)
}
