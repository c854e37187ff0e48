//! Per-call structured event log.
//!
//! One append-only file per call, one JSON object per line. The file opens
//! lazily at most once (an attempted flag prevents retry storms) at a path
//! computed from a configured template plus call metadata; every event line
//! carries a timestamp, a type, an event name, and caller-supplied pairs.
//! Appends serialize on an internal lock so the session and the backend's
//! asynchronous event callback can share one writer without interleaving.

use crate::lock_or_recover;
use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Origin of a call-log entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallLogKind {
    Session,
    Endpointer,
    Dialogflow,
}

impl CallLogKind {
    pub fn label(self) -> &'static str {
        match self {
            CallLogKind::Session => "SESSION",
            CallLogKind::Endpointer => "ENDPOINTER",
            CallLogKind::Dialogflow => "DIALOGFLOW",
        }
    }
}

#[derive(Default)]
struct CallLogInner {
    open_already_attempted: bool,
    file: Option<File>,
    /// Directory (with trailing separator) the log and recordings live in.
    path: String,
    /// Timestamp-derived stem shared by the log and recording files.
    basename: String,
}

/// Shared per-call log writer. Clone the owning `Arc` to hand the backend
/// event callback a sink into the same file.
#[derive(Default)]
pub struct CallLog {
    inner: Mutex<CallLogInner>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_already_attempted(&self) -> bool {
        lock_or_recover(&self.inner, "call log attempted check").open_already_attempted
    }

    /// Compute the log location from `template` and open the log file.
    ///
    /// At most one attempt per call: a failed open leaves the log disabled.
    /// `${APPLICATION}` in the template is replaced with the session's
    /// application tag, then remaining `%` tokens render as local time.
    pub fn open_once(&self, template: &str, application: &str, session_id: &str) {
        {
            let mut inner = lock_or_recover(&self.inner, "call log open");
            if inner.open_already_attempted {
                return;
            }
            inner.open_already_attempted = true;
        }

        let path = compute_log_path(template, application);
        if path.is_empty() {
            warn!("Not starting call log for {session_id}, path is empty");
            return;
        }
        let now = Local::now();
        let basename = format!("{}_{session_id}", now.format("%M%S"));

        if let Err(err) = fs::create_dir_all(&path) {
            warn!("Unable to create call log directory {path} for {session_id}: {err}");
            return;
        }

        let mut file_path = PathBuf::from(&path);
        file_path.push(format!("{basename}_log.jsonl"));
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
        {
            Ok(file) => {
                debug!("Opened {} for call log for {session_id}", file_path.display());
                let mut inner = lock_or_recover(&self.inner, "call log open");
                inner.file = Some(file);
                inner.path = path;
                inner.basename = basename;
            }
            Err(err) => {
                warn!(
                    "Unable to open {} for writing call log for {session_id}: {err}",
                    file_path.display()
                );
            }
        }
    }

    /// Whether events will actually be written.
    pub fn is_open(&self) -> bool {
        lock_or_recover(&self.inner, "call log open check")
            .file
            .is_some()
    }

    /// Directory and basename for files related to this call's log, or
    /// `None` before a successful open. Recordings key their names off this.
    pub fn location(&self) -> Option<(String, String)> {
        let inner = lock_or_recover(&self.inner, "call log location");
        if inner.file.is_some() {
            Some((inner.path.clone(), inner.basename.clone()))
        } else {
            None
        }
    }

    /// Append one event line. No-op when the log never opened.
    pub fn log_event(&self, kind: CallLogKind, event: &str, data: &[(String, String)]) {
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string();

        let mut object = Map::new();
        object.insert("log_timestamp".into(), Value::String(timestamp));
        object.insert("log_type".into(), Value::String(kind.label().into()));
        object.insert("log_event".into(), Value::String(event.into()));
        for (key, value) in data {
            object.insert(key.clone(), Value::String(value.clone()));
        }
        let line = Value::Object(object).to_string();

        // Serialized under the lock on purpose: concurrent origins (session
        // operations, the backend callback) must not interleave lines.
        let mut inner = lock_or_recover(&self.inner, "call log append");
        if let Some(file) = inner.file.as_mut() {
            if let Err(err) = writeln!(file, "{line}") {
                warn!("Failed writing call log event '{event}': {err}");
            }
        }
    }

    /// Convenience for events with no payload.
    pub fn log_event_only(&self, kind: CallLogKind, event: &str) {
        self.log_event(kind, event, &[]);
    }

    pub fn close(&self) {
        let mut inner = lock_or_recover(&self.inner, "call log close");
        inner.file = None;
    }
}

/// Substitute `${APPLICATION}`, then render date tokens as local time.
fn compute_log_path(template: &str, application: &str) -> String {
    let substituted = template.replace("${APPLICATION}", application);
    if !substituted.contains('%') {
        return substituted;
    }
    let items: Vec<Item> = StrftimeItems::new(&substituted).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        warn!("Invalid date token in call log template '{template}'");
        return substituted;
    }
    Local::now().format_with_items(items.into_iter()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_lines(log: &CallLog) -> Vec<serde_json::Value> {
        let (path, basename) = log.location().expect("log should be open");
        let mut contents = String::new();
        File::open(PathBuf::from(path).join(format!("{basename}_log.jsonl")))
            .expect("log file should exist")
            .read_to_string(&mut contents)
            .unwrap();
        contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("each line is a JSON object"))
            .collect()
    }

    #[test]
    fn substitutes_application_and_date_tokens() {
        let path = compute_log_path("/var/log/calls/${APPLICATION}/%Y/", "ivr-main");
        assert!(path.starts_with("/var/log/calls/ivr-main/"));
        assert!(!path.contains('%'));
    }

    #[test]
    fn invalid_date_token_falls_back_to_literal_template() {
        let path = compute_log_path("/tmp/calls/%Q/", "app");
        assert_eq!(path, "/tmp/calls/%Q/");
    }

    #[test]
    fn events_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/${{APPLICATION}}/", dir.path().display());
        let log = CallLog::new();
        log.open_once(&template, "demo", "sess-1");
        assert!(log.is_open());

        log.log_event_only(CallLogKind::Session, "start");
        log.log_event(
            CallLogKind::Endpointer,
            "start_of_speech",
            &[("utterance".to_string(), "1".to_string())],
        );

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["log_type"], "SESSION");
        assert_eq!(lines[0]["log_event"], "start");
        assert_eq!(lines[1]["log_type"], "ENDPOINTER");
        assert_eq!(lines[1]["utterance"], "1");
        assert!(lines[0]["log_timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn open_is_attempted_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/a/", dir.path().display());
        let log = CallLog::new();
        log.open_once(&template, "app", "sess-2");
        let first = log.location();
        // A second attempt with a different template must not reopen.
        log.open_once("/nonexistent/${APPLICATION}/", "app", "sess-2");
        assert_eq!(log.location(), first);
    }

    #[test]
    fn events_without_a_file_are_dropped() {
        let log = CallLog::new();
        log.open_once("", "app", "sess-3");
        assert!(!log.is_open());
        log.log_event_only(CallLogKind::Session, "start");
        assert!(log.location().is_none());
    }
}
