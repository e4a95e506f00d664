//! JSONL persistence for enriched mutation events.
//!
//! One event per line in `<dir>/events.jsonl`, in the events' wire
//! format. Three shapes, all external to the capture core:
//!
//! - [`JsonlWriter`] — synchronous buffered appender with explicit
//!   `flush`, for hosts that drain the core themselves.
//! - [`PushJsonlSink`] — an [`EventSink`] adapter, for hosts that install
//!   it with `WatchCore::set_sink` and let the enrichment thread write.
//! - [`BatchJsonlWriter`] — a background thread that pull-drains a
//!   [`WatchCore`] in batches, for hosts that want persistence fully off
//!   their own threads.
//!
//! Write failures never reach the core; they are counted in the writer's
//! `events_lost` and (for the push sink) in the core's `callbacks_failed`.

use log::{debug, info, warn};
use pagewatch_core::{EventSink, WatchCore};
use pagewatch_events::EnrichedEvent;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default number of events buffered before an implicit flush.
pub const DEFAULT_BUFFER_EVENTS: usize = 100;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writer statistics: lines appended, events lost to write failures,
/// lines buffered since the last flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub events_written: u64,
    pub events_lost: u64,
    pub buffered: usize,
}

// ═══════════════════════════════════════════════════════════════════════
//  Synchronous writer
// ═══════════════════════════════════════════════════════════════════════

/// Buffered appender for `<dir>/events.jsonl`.
pub struct JsonlWriter {
    file: BufWriter<File>,
    path: PathBuf,
    max_buffer_events: usize,
    stats: WriterStats,
}

impl JsonlWriter {
    /// Create (or append to) `events.jsonl` under `dir`, creating the
    /// directory if needed.
    pub fn create(dir: &Path) -> Result<Self, SinkError> {
        Self::with_buffer(dir, DEFAULT_BUFFER_EVENTS)
    }

    /// As [`create`](Self::create), flushing after `max_buffer_events`
    /// buffered lines.
    pub fn with_buffer(dir: &Path, max_buffer_events: usize) -> Result<Self, SinkError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("jsonl sink writing to {}", path.display());
        Ok(Self {
            file: BufWriter::new(file),
            path,
            max_buffer_events: max_buffer_events.max(1),
            stats: WriterStats::default(),
        })
    }

    /// Append one event as a JSON line.
    pub fn write_event(&mut self, event: &EnrichedEvent) -> Result<(), SinkError> {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                self.stats.events_lost += 1;
                return Err(e.into());
            }
        };
        if let Err(e) = writeln!(self.file, "{line}") {
            self.stats.events_lost += 1;
            return Err(e.into());
        }
        self.stats.events_written += 1;
        self.stats.buffered += 1;
        if self.stats.buffered >= self.max_buffer_events {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.file.flush()?;
        self.stats.buffered = 0;
        Ok(())
    }

    /// Flush and drop the writer.
    pub fn close(mut self) -> Result<(), SinkError> {
        self.flush()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Push sink adapter
// ═══════════════════════════════════════════════════════════════════════

/// [`EventSink`] adapter over a [`JsonlWriter`], for
/// `WatchCore::set_sink`. Every event is flushed through to the file as
/// the enrichment thread emits it.
pub struct PushJsonlSink {
    writer: Mutex<JsonlWriter>,
}

impl PushJsonlSink {
    pub fn create(dir: &Path) -> Result<Self, SinkError> {
        Ok(Self {
            writer: Mutex::new(JsonlWriter::with_buffer(dir, 1)?),
        })
    }

    pub fn stats(&self) -> WriterStats {
        self.writer.lock().unwrap().stats()
    }
}

impl EventSink for PushJsonlSink {
    fn emit(&self, event: EnrichedEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_event(&event)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Background batch writer
// ═══════════════════════════════════════════════════════════════════════

/// Background thread that pull-drains a core's enriched events into
/// `events.jsonl`, flushing once per batch.
pub struct BatchJsonlWriter {
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    writer: Arc<Mutex<JsonlWriter>>,
}

impl BatchJsonlWriter {
    /// Spawn the drain thread. `batch_size` bounds how many events are
    /// written between flushes; `poll_interval` is the idle sleep.
    pub fn start(
        core: Arc<WatchCore>,
        dir: &Path,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Result<Self, SinkError> {
        let writer = Arc::new(Mutex::new(JsonlWriter::with_buffer(dir, batch_size.max(1))?));
        let running = Arc::new(AtomicBool::new(true));

        let thread = std::thread::Builder::new()
            .name("pagewatch-sink".to_string())
            .spawn({
                let writer = Arc::clone(&writer);
                let running = Arc::clone(&running);
                let batch_size = batch_size.max(1);
                move || drain_loop(core, writer, running, batch_size, poll_interval)
            })?;

        Ok(Self {
            thread: Some(thread),
            running,
            writer,
        })
    }

    /// Signal the drain thread, wait up to `timeout` for it to finish its
    /// final drain, and return the closing stats. A thread that overruns
    /// the timeout is left to finish on its own.
    pub fn stop(mut self, timeout: Duration) -> WriterStats {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let deadline = Instant::now() + timeout;
            while !thread.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                warn!("batch writer did not stop within {timeout:?}");
            }
        }
        let mut writer = self.writer.lock().unwrap();
        let _ = writer.flush();
        writer.stats()
    }

    pub fn stats(&self) -> WriterStats {
        self.writer.lock().unwrap().stats()
    }
}

fn drain_loop(
    core: Arc<WatchCore>,
    writer: Arc<Mutex<JsonlWriter>>,
    running: Arc<AtomicBool>,
    batch_size: usize,
    poll_interval: Duration,
) {
    info!("batch jsonl writer running");
    loop {
        let mut wrote = 0;
        while wrote < batch_size {
            let Some(event) = core.dequeue_enriched_event() else {
                break;
            };
            let mut writer = writer.lock().unwrap();
            if let Err(e) = writer.write_event(&event) {
                warn!("failed to persist event: {e}");
            }
            wrote += 1;
        }

        if wrote > 0 {
            let _ = writer.lock().unwrap().flush();
        } else {
            // Empty pass: exit once stopped, otherwise idle.
            if !running.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(poll_interval);
        }
    }
    info!("batch jsonl writer exiting");
}
