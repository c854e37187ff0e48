//! Configuration model: an immutable, reference-counted snapshot behind an
//! atomically swappable store, plus the logical-agent directory.
//!
//! Sessions clone the current [`ConfigSnapshot`] `Arc` once and keep it for
//! their lifetime, so a reload never mutates state under an active call; a
//! superseded snapshot is reclaimed when its last session releases it.

mod defaults;

use crate::vad::VadTuning;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

pub use defaults::{
    DEFAULT_CALL_LOG_LOCATION, DEFAULT_ENABLE_CALL_LOGS,
    DEFAULT_ENABLE_POSTENDPOINTER_RECORDINGS, DEFAULT_ENABLE_PREENDPOINTER_RECORDINGS,
    DEFAULT_VAD_SILENCE_MIN_MS, DEFAULT_VAD_VOICE_MIN_MS, DEFAULT_VAD_VOICE_THRESHOLD,
};

/// Named bundle of recognition-backend credentials, selectable by name
/// instead of a raw project id. Absent key/endpoint inherit the globals at
/// activation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCredentials {
    pub name: String,
    pub project_id: String,
    pub service_key: Option<String>,
    pub endpoint: Option<String>,
}

/// Immutable point-in-time configuration value, safe to share across
/// concurrent readers.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub service_key: String,
    pub endpoint: String,
    pub vad: VadTuning,
    pub enable_call_logs: bool,
    pub enable_preendpointer_recordings: bool,
    pub enable_postendpointer_recordings: bool,
    pub call_log_location: String,
    agents: HashMap<String, Arc<AgentCredentials>>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            service_key: String::new(),
            endpoint: String::new(),
            vad: VadTuning {
                voice_threshold: DEFAULT_VAD_VOICE_THRESHOLD,
                voice_min_ms: DEFAULT_VAD_VOICE_MIN_MS,
                silence_min_ms: DEFAULT_VAD_SILENCE_MIN_MS,
            },
            enable_call_logs: DEFAULT_ENABLE_CALL_LOGS,
            enable_preendpointer_recordings: DEFAULT_ENABLE_PREENDPOINTER_RECORDINGS,
            enable_postendpointer_recordings: DEFAULT_ENABLE_POSTENDPOINTER_RECORDINGS,
            call_log_location: DEFAULT_CALL_LOG_LOCATION.to_string(),
            agents: HashMap::new(),
        }
    }
}

impl ConfigSnapshot {
    /// Case-insensitive lookup in the logical agent directory.
    pub fn agent(&self, name: &str) -> Option<Arc<AgentCredentials>> {
        self.agents.get(&name.to_lowercase()).cloned()
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<AgentCredentials>> {
        self.agents.values()
    }

    /// Parse a YAML document into a snapshot, applying defaults for every
    /// absent value and loading service keys from disk where referenced.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = if contents.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(contents).context("invalid configuration")?
        };
        let mut snapshot = ConfigSnapshot::default();

        if let Some(value) = raw.service_key {
            snapshot.service_key = load_service_key(&value);
        } else {
            info!("Service key not provided, will use default credentials");
        }
        if let Some(endpoint) = raw.endpoint {
            snapshot.endpoint = endpoint;
        }
        if let Some(threshold) = raw.vad_voice_threshold {
            snapshot.vad.voice_threshold = threshold;
        }
        if let Some(ms) = raw.vad_voice_minimum_duration {
            snapshot.vad.voice_min_ms = ms;
        }
        if let Some(ms) = raw.vad_silence_minimum_duration {
            snapshot.vad.silence_min_ms = ms;
        }
        if let Some(location) = raw.call_log_location {
            snapshot.call_log_location = location;
        }
        if let Some(enabled) = raw.enable_call_logs {
            snapshot.enable_call_logs = enabled;
        }
        if let Some(enabled) = raw.enable_preendpointer_recordings {
            snapshot.enable_preendpointer_recordings = enabled;
        }
        if let Some(enabled) = raw.enable_postendpointer_recordings {
            snapshot.enable_postendpointer_recordings = enabled;
        }

        for (name, agent) in raw.agents {
            let Some(project_id) = agent.project_id.filter(|id| !id.is_empty()) else {
                warn!("Mapped project_id is required for {name}");
                continue;
            };
            let service_key = agent
                .service_key
                .filter(|key| !key.is_empty())
                .map(|key| load_service_key(&key));
            let endpoint = agent.endpoint.filter(|endpoint| !endpoint.is_empty());
            snapshot.agents.insert(
                name.to_lowercase(),
                Arc::new(AgentCredentials {
                    name,
                    project_id,
                    service_key,
                    endpoint,
                }),
            );
        }

        Ok(snapshot)
    }

    /// Dump the snapshot in the administrative `show config` layout.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str("[general]\n");
        out.push_str(&format!("service_key = {}\n", self.service_key));
        out.push_str(&format!("endpoint = {}\n", self.endpoint));
        out.push_str(&format!("vad_voice_threshold = {}\n", self.vad.voice_threshold));
        out.push_str(&format!(
            "vad_voice_minimum_duration = {}\n",
            self.vad.voice_min_ms
        ));
        out.push_str(&format!(
            "vad_silence_minimum_duration = {}\n",
            self.vad.silence_min_ms
        ));
        out.push_str(&format!("call_log_location = {}\n", self.call_log_location));
        out.push_str(&format!(
            "enable_call_logs = {}\n",
            yes_no(self.enable_call_logs)
        ));
        out.push_str(&format!(
            "enable_preendpointer_recordings = {}\n",
            yes_no(self.enable_preendpointer_recordings)
        ));
        out.push_str(&format!(
            "enable_postendpointer_recordings = {}\n",
            yes_no(self.enable_postendpointer_recordings)
        ));

        let mut agents: Vec<_> = self.agents.values().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        for agent in agents {
            out.push_str(&format!("\n[{}]\n", agent.name));
            out.push_str(&format!("project_id = {}\n", agent.project_id));
            out.push_str(&format!(
                "endpoint = {}\n",
                agent.endpoint.as_deref().unwrap_or("")
            ));
            out.push_str(&format!(
                "service_key = {}\n",
                agent.service_key.as_deref().unwrap_or("")
            ));
        }
        out
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Service keys may be given inline (anything that looks like embedded JSON)
/// or as a path to the key material. A broken path degrades to an empty key
/// rather than failing configuration load.
fn load_service_key(value: &str) -> String {
    if value.contains('{') {
        return value.to_string();
    }
    debug!("Loading service key data from {value}");
    match fs::read_to_string(value) {
        Ok(contents) => contents,
        Err(err) => {
            error!("Unable to open service key file {value}: {err}");
            String::new()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    service_key: Option<String>,
    endpoint: Option<String>,
    vad_voice_threshold: Option<i32>,
    vad_voice_minimum_duration: Option<i32>,
    vad_silence_minimum_duration: Option<i32>,
    call_log_location: Option<String>,
    enable_call_logs: Option<bool>,
    enable_preendpointer_recordings: Option<bool>,
    enable_postendpointer_recordings: Option<bool>,
    #[serde(default)]
    agents: HashMap<String, RawAgent>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAgent {
    project_id: Option<String>,
    service_key: Option<String>,
    endpoint: Option<String>,
}

/// Process-wide holder of the current snapshot with atomic hot-swap.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    /// Load the file at `path`, falling back to documented defaults when it
    /// is missing or unparseable (startup must not fail on bad config).
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = match Self::parse_file(&path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    "Configuration {} not usable ({err:#}), using defaults",
                    path.display()
                );
                ConfigSnapshot::default()
            }
        };
        Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_snapshot(snapshot: ConfigSnapshot) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    fn parse_file(path: &Path) -> Result<ConfigSnapshot> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        ConfigSnapshot::from_yaml_str(&contents)
    }

    /// The snapshot new sessions should capture. Cheap `Arc` clone; the
    /// caller keeps its snapshot across any later reload.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-parse the file and atomically publish the new snapshot.
    ///
    /// A failed reload leaves the previous snapshot in effect.
    pub fn reload(&self) -> Result<()> {
        let snapshot = Self::parse_file(&self.path)?;
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(snapshot);
        debug!("Configuration reloaded from {}", self.path.display());
        Ok(())
    }

    /// Administrative dump of the current snapshot.
    pub fn describe(&self) -> String {
        self.current().describe()
    }
}
