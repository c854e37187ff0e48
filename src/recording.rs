//! Pre- and post-endpoint diagnostic recordings.
//!
//! Two independent append streams per session write the raw µ-law audio of
//! each utterance: the pre stream captures lead-in while the endpointer is
//! still deciding, the post stream only confirmed speech. Files live next to
//! the call log and embed the utterance counter so repeated recognitions in
//! one call never collide. Opens are lazy and attempted at most once per
//! utterance; a failed open or a short write degrades the stream, never the
//! session.

use crate::call_log::{CallLog, CallLogKind};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Which side of the endpoint a stream captures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamKind {
    PreEndpoint,
    PostEndpoint,
}

impl StreamKind {
    /// File-name tag, also the prefix of the stream's log events.
    fn tag(self) -> &'static str {
        match self {
            StreamKind::PreEndpoint => "pre",
            StreamKind::PostEndpoint => "post",
        }
    }
}

/// One lazily-opened µ-law append stream.
pub struct RecordingStream {
    kind: StreamKind,
    open_already_attempted: bool,
    file: Option<File>,
}

impl RecordingStream {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            open_already_attempted: false,
            file: None,
        }
    }

    /// Allow the next utterance to open a fresh file.
    pub fn reset_for_utterance(&mut self) {
        self.open_already_attempted = false;
        self.file = None;
    }

    pub fn is_recording(&self) -> bool {
        self.file.is_some()
    }

    /// Append one companded frame, opening the file on first use.
    ///
    /// The file name keys off the call log location, so nothing is written
    /// until the call log has computed one.
    pub fn write(&mut self, call_log: &CallLog, session_id: &str, utterance: u32, ulaw: &[u8]) {
        if self.file.is_none() {
            if self.open_already_attempted {
                return;
            }
            self.open_already_attempted = true;
            let Some((path, basename)) = call_log.location() else {
                return;
            };
            let tag = self.kind.tag();
            let mut file_path = PathBuf::from(path);
            file_path.push(format!("{basename}_{tag}_{utterance}.ul"));
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
            {
                Ok(file) => {
                    let filename = file_path.display().to_string();
                    debug!("Opened {filename} for {tag}endpointer recording for {session_id}");
                    call_log.log_event(
                        CallLogKind::Endpointer,
                        &format!("{tag}_recording_start"),
                        &[("filename".to_string(), filename)],
                    );
                    self.file = Some(file);
                }
                Err(err) => {
                    warn!(
                        "Unable to open {} for {tag}endpointer recording for {session_id}: {err}",
                        file_path.display()
                    );
                    return;
                }
            }
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file.write_all(ulaw) {
                let tag = self.kind.tag();
                warn!("Short write to {tag}-endpointed recording for {session_id}: {err}");
            }
        }
    }

    /// Flush and drop the file handle, emitting the stream's stop event.
    pub fn close(&mut self, call_log: &CallLog) {
        self.file = None;
        call_log.log_event_only(
            CallLogKind::Endpointer,
            &format!("{}_recording_stop", self.kind.tag()),
        );
    }
}

/// The per-session pair of streams, owned by the audio-write path.
pub struct RecordingStreams {
    pub pre: RecordingStream,
    pub post: RecordingStream,
}

impl Default for RecordingStreams {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingStreams {
    pub fn new() -> Self {
        Self {
            pre: RecordingStream::new(StreamKind::PreEndpoint),
            post: RecordingStream::new(StreamKind::PostEndpoint),
        }
    }

    pub fn reset_for_utterance(&mut self) {
        self.pre.reset_for_utterance();
        self.post.reset_for_utterance();
    }

    pub fn close_all(&mut self, call_log: &CallLog) {
        self.pre.close(call_log);
        self.post.close(call_log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn open_log(dir: &std::path::Path) -> CallLog {
        let log = CallLog::new();
        log.open_once(&format!("{}/", dir.display()), "app", "rec-test");
        assert!(log.is_open());
        log
    }

    #[test]
    fn lazily_opens_and_appends_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let mut stream = RecordingStream::new(StreamKind::PreEndpoint);

        stream.write(&log, "rec-test", 1, &[0xFF, 0x7F]);
        stream.write(&log, "rec-test", 1, &[0x00]);
        assert!(stream.is_recording());

        let (path, basename) = log.location().unwrap();
        let file = PathBuf::from(path).join(format!("{basename}_pre_1.ul"));
        assert_eq!(fs::read(&file).unwrap(), vec![0xFF, 0x7F, 0x00]);
    }

    #[test]
    fn no_file_without_call_log_location() {
        let log = CallLog::new();
        let mut stream = RecordingStream::new(StreamKind::PostEndpoint);
        stream.write(&log, "rec-test", 1, &[0xFF]);
        assert!(!stream.is_recording());
        // First attempt consumed the open budget for this utterance.
        assert!(stream.open_already_attempted);
    }

    #[test]
    fn reset_allows_a_fresh_file_per_utterance() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let mut stream = RecordingStream::new(StreamKind::PostEndpoint);

        stream.write(&log, "rec-test", 1, &[0x01]);
        stream.close(&log);
        stream.reset_for_utterance();
        stream.write(&log, "rec-test", 2, &[0x02]);

        let (path, basename) = log.location().unwrap();
        let base = PathBuf::from(path);
        assert_eq!(
            fs::read(base.join(format!("{basename}_post_1.ul"))).unwrap(),
            vec![0x01]
        );
        assert_eq!(
            fs::read(base.join(format!("{basename}_post_2.ul"))).unwrap(),
            vec![0x02]
        );
    }

    #[test]
    fn start_and_stop_events_reach_the_call_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        let mut streams = RecordingStreams::new();

        streams.pre.write(&log, "rec-test", 1, &[0xFF]);
        streams.close_all(&log);

        let (path, basename) = log.location().unwrap();
        let contents =
            fs::read_to_string(PathBuf::from(path).join(format!("{basename}_log.jsonl"))).unwrap();
        let events: Vec<String> = contents
            .lines()
            .map(|line| {
                serde_json::from_str::<serde_json::Value>(line).unwrap()["log_event"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(
            events,
            vec!["pre_recording_start", "pre_recording_stop", "post_recording_stop"]
        );
    }
}
