//! Log-tail producer: polls a gateway log file and turns matching lines
//! into error events.
//!
//! Tracks a byte offset and the file's inode; rotation (inode change) or
//! truncation (size shrink) resets the offset to zero so no restart is
//! needed when logrotate swaps the file out underneath us.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::ingest::{truncate_bytes, Enqueuer, ErrorPayload, Event, EventPayload};
use crate::tasks::TickTask;

const DEFAULT_POLL: Duration = Duration::from_millis(500);
const MAX_MESSAGE_BYTES: usize = 500;

pub struct LogTail {
    path: PathBuf,
    poll: Duration,
    enqueuer: Arc<dyn Enqueuer>,
    offset: u64,
    last_inode: u64,
}

impl LogTail {
    pub fn new(path: PathBuf, enqueuer: Arc<dyn Enqueuer>) -> Self {
        Self::with_poll(path, DEFAULT_POLL, enqueuer)
    }

    pub fn with_poll(path: PathBuf, poll: Duration, enqueuer: Arc<dyn Enqueuer>) -> Self {
        let poll = if poll.is_zero() { DEFAULT_POLL } else { poll };
        Self {
            path,
            poll,
            enqueuer,
            offset: 0,
            last_inode: 0,
        }
    }

    /// One poll: detect rotation/shrink, then consume new lines.
    pub fn poll_once(&mut self) {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return;
        };
        let inode = meta.ino();
        if self.last_inode == 0 {
            self.last_inode = inode;
        }
        if inode != self.last_inode {
            self.last_inode = inode;
            self.offset = 0;
        }
        if meta.len() < self.offset {
            self.offset = 0;
        }
        if let Ok(new_offset) = self.read_from_offset(self.offset) {
            self.offset = new_offset;
        }
    }

    fn read_from_offset(&self, offset: u64) -> std::io::Result<u64> {
        let file = std::fs::File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some(error_type) = classify_line(trimmed) else {
                continue;
            };
            let metadata = serde_json::json!({
                "source": "log_parser",
                "raw_line": trimmed,
            });
            self.enqueuer.enqueue(Event {
                created_at: Utc::now().timestamp_millis(),
                payload: EventPayload::Error(ErrorPayload {
                    error_type: error_type.to_string(),
                    message: truncate_bytes(trimmed, MAX_MESSAGE_BYTES).to_string(),
                    stack_trace: String::new(),
                    severity: "info".to_string(),
                    metadata: metadata.to_string(),
                }),
            });
        }
        reader.stream_position()
    }
}

#[async_trait]
impl TickTask for LogTail {
    fn name(&self) -> &'static str {
        "log_parser"
    }

    fn period(&self) -> Duration {
        self.poll
    }

    async fn tick(&mut self) -> Result<()> {
        self.poll_once();
        Ok(())
    }
}

/// Classify a log line by substring (case-insensitive). Unmatched lines
/// are skipped entirely.
fn classify_line(line: &str) -> Option<&'static str> {
    let l = line.to_lowercase();
    if l.contains("channel") {
        return Some("channel_event");
    }
    if l.contains("config") || l.contains("reload") {
        return Some("config_change");
    }
    if l.contains("error") || l.contains("exception") || l.contains("timeout") || l.contains("failed")
    {
        return Some("gateway_error");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    struct Capture {
        events: Mutex<Vec<Event>>,
    }

    impl Capture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match &e.payload {
                    EventPayload::Error(err) => Some(err.message.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Enqueuer for Capture {
        fn enqueue(&self, event: Event) -> bool {
            self.events.lock().unwrap().push(event);
            true
        }
    }

    #[test]
    fn classifies_by_substring() {
        assert_eq!(classify_line("Channel opened"), Some("channel_event"));
        assert_eq!(classify_line("config reloaded"), Some("config_change"));
        assert_eq!(classify_line("hot RELOAD done"), Some("config_change"));
        assert_eq!(classify_line("request TIMEOUT after 30s"), Some("gateway_error"));
        assert_eq!(classify_line("upstream failed"), Some("gateway_error"));
        assert_eq!(classify_line("Exception in handler"), Some("gateway_error"));
        assert_eq!(classify_line("plain chatter"), None);
    }

    #[test]
    fn emits_events_for_new_lines_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        std::fs::write(&path, "error: one\nskipped line\n").unwrap();

        let capture = Capture::new();
        let mut tail = LogTail::new(path.clone(), capture.clone());
        tail.poll_once();
        assert_eq!(capture.messages(), vec!["error: one"]);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "error: two").unwrap();
        drop(f);
        tail.poll_once();
        assert_eq!(capture.messages(), vec!["error: one", "error: two"]);
    }

    #[test]
    fn rotation_resets_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        std::fs::write(&path, "error: before rotation\n").unwrap();

        let capture = Capture::new();
        let mut tail = LogTail::new(path.clone(), capture.clone());
        tail.poll_once();

        // Rotate: move the file aside and start a fresh one (new inode).
        std::fs::rename(&path, dir.path().join("gateway.log.1")).unwrap();
        std::fs::write(&path, "error: after rotation\n").unwrap();
        tail.poll_once();

        assert_eq!(
            capture.messages(),
            vec!["error: before rotation", "error: after rotation"]
        );
    }

    #[test]
    fn shrink_resets_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        std::fs::write(&path, "error: a long first line to move the offset\n").unwrap();

        let capture = Capture::new();
        let mut tail = LogTail::new(path.clone(), capture.clone());
        tail.poll_once();

        std::fs::write(&path, "error: shrunk\n").unwrap();
        tail.poll_once();

        assert_eq!(
            capture.messages(),
            vec!["error: a long first line to move the offset", "error: shrunk"]
        );
    }

    #[test]
    fn long_lines_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        std::fs::write(&path, format!("error: {}\n", "x".repeat(600))).unwrap();

        let capture = Capture::new();
        let mut tail = LogTail::new(path, capture.clone());
        tail.poll_once();

        let messages = capture.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len(), 500);
    }
}
