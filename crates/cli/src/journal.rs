// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed append-only event journal.
//!
//! Instrument events (command results, state transitions, write audits)
//! are appended as JSONL to rotating segment files in a journal directory.
//! Submission is non-blocking through a bounded queue: a full queue drops
//! the event and bumps a counter rather than stalling a controller call.
//! A background writer thread drains the queue and rotates files after a
//! fixed number of events.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::{BridgeError, Result};
use crate::instrument::EventSink;

/// One journalled event line.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEvent {
    pub event_id: String,
    pub timestamp_utc: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Writer-side counters, readable while the journal runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalStats {
    pub submitted: u64,
    pub written: u64,
    pub dropped: u64,
    pub last_error: Option<String>,
    pub active_file: Option<String>,
    pub segment_index: u64,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    dropped: u64,
}

struct WriterShared {
    written: u64,
    last_error: Option<String>,
    active_file: Option<PathBuf>,
    segment_index: u64,
}

pub struct Journal {
    directory: PathBuf,
    run_tag: String,
    tx: SyncSender<JournalEvent>,
    counters: Mutex<Counters>,
    writer: Mutex<Option<JoinHandle<()>>>,
    writer_shared: Arc<Mutex<WriterShared>>,
    stop: Arc<AtomicBool>,
}

impl Journal {
    /// Create the journal directory and start the writer thread.
    pub fn start(
        directory: impl AsRef<Path>,
        queue_size: usize,
        max_events_per_file: u64,
    ) -> Result<Self> {
        if queue_size == 0 {
            return Err(BridgeError::invalid_argument("journal queue_size must be positive"));
        }
        if max_events_per_file == 0 {
            return Err(BridgeError::invalid_argument(
                "journal max_events_per_file must be positive",
            ));
        }
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory).map_err(|e| {
            BridgeError::store(format!("cannot create {}: {e}", directory.display()))
        })?;

        let (tx, rx) = sync_channel(queue_size);
        let stop = Arc::new(AtomicBool::new(false));
        let writer_shared = Arc::new(Mutex::new(WriterShared {
            written: 0,
            last_error: None,
            active_file: None,
            segment_index: 0,
        }));
        let run_tag = chrono::Utc::now().timestamp_millis().to_string();

        let handle = spawn_writer(
            rx,
            directory.clone(),
            run_tag.clone(),
            max_events_per_file,
            Arc::clone(&stop),
            Arc::clone(&writer_shared),
        );

        let journal = Self {
            directory,
            run_tag,
            tx,
            counters: Mutex::new(Counters::default()),
            writer: Mutex::new(Some(handle)),
            writer_shared,
            stop,
        };
        journal.emit("journal_started", serde_json::json!({}));
        Ok(journal)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Submit an event. Returns false when the queue is full and the event
    /// was dropped.
    pub fn emit(&self, event_type: &str, payload: serde_json::Value) -> bool {
        let event = JournalEvent {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp_utc: now_utc_iso(),
            event_type: event_type.to_owned(),
            payload,
        };
        let mut counters = self.counters.lock();
        counters.submitted += 1;
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                counters.dropped += 1;
                false
            }
        }
    }

    pub fn stats(&self) -> JournalStats {
        let counters = self.counters.lock();
        let shared = self.writer_shared.lock();
        JournalStats {
            submitted: counters.submitted,
            written: shared.written,
            dropped: counters.dropped,
            last_error: shared.last_error.clone(),
            active_file: shared.active_file.as_ref().map(|p| p.display().to_string()),
            segment_index: shared.segment_index,
        }
    }

    /// Stop the writer after draining the queue. Idempotent.
    pub fn close(&self) {
        self.emit("journal_stopping", serde_json::json!({}));
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                warn!(directory = %self.directory.display(), "journal writer panicked");
            }
        }
    }

    pub fn run_tag(&self) -> &str {
        &self.run_tag
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.close();
    }
}

impl EventSink for Journal {
    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let _ = Journal::emit(self, event_type, payload);
    }
}

fn spawn_writer(
    rx: Receiver<JournalEvent>,
    directory: PathBuf,
    run_tag: String,
    max_events_per_file: u64,
    stop: Arc<AtomicBool>,
    shared: Arc<Mutex<WriterShared>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("journal-writer".to_owned())
        .spawn(move || {
            let mut segment = SegmentWriter::new(directory, run_tag, max_events_per_file);
            loop {
                match rx.recv_timeout(std::time::Duration::from_millis(100)) {
                    Ok(event) => {
                        let mut shared = shared.lock();
                        match segment.write_event(&event) {
                            Ok(()) => {
                                shared.written += 1;
                                shared.segment_index = segment.segment_index;
                                shared.active_file = segment.active_path.clone();
                            }
                            Err(e) => shared.last_error = Some(e),
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .unwrap_or_else(|e| {
            // Thread spawn failing means the process is in deep trouble;
            // degrade to a writer that exits immediately.
            warn!(err = %e, "failed to spawn journal writer");
            std::thread::spawn(|| {})
        })
}

struct SegmentWriter {
    directory: PathBuf,
    run_tag: String,
    max_events_per_file: u64,
    segment_index: u64,
    segment_count: u64,
    active_path: Option<PathBuf>,
    active_file: Option<std::fs::File>,
}

impl SegmentWriter {
    fn new(directory: PathBuf, run_tag: String, max_events_per_file: u64) -> Self {
        Self {
            directory,
            run_tag,
            max_events_per_file,
            segment_index: 0,
            segment_count: 0,
            active_path: None,
            active_file: None,
        }
    }

    fn write_event(&mut self, event: &JournalEvent) -> std::result::Result<(), String> {
        if self.active_file.is_none() || self.segment_count >= self.max_events_per_file {
            self.rotate()?;
        }
        let Some(file) = self.active_file.as_mut() else {
            return Err("journal has no active file after rotation".to_owned());
        };
        let line = serde_json::to_string(event).map_err(|e| e.to_string())?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .map_err(|e| e.to_string())?;
        self.segment_count += 1;
        Ok(())
    }

    fn rotate(&mut self) -> std::result::Result<(), String> {
        self.active_file = None;
        self.segment_index += 1;
        self.segment_count = 0;
        let file_name =
            format!("trajectory-{}-{:05}.jsonl", self.run_tag, self.segment_index);
        let path = self.directory.join(file_name);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
        self.active_path = Some(path);
        self.active_file = Some(file);
        Ok(())
    }
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
