//! Append-only traffic event log
//!
//! Every admitted packet is written as one JSON object per line. The file is
//! rotated once it would grow past a size ceiling, keeping a bounded number
//! of prior files next to it (`<file>.1` is the most recent).
//!
//! [`QueuedSink`] moves the actual writes onto a dedicated thread so capture
//! tasks never block on disk I/O.

use crate::{NetlogError, Result};
use netlog_common::{PacketRecord, TrafficEvent};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Default rotation ceiling (1 GiB)
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024 * 1024;

/// Default number of rotated files kept
pub const DEFAULT_BACKUPS: usize = 1;

/// Default number of events a [`QueuedSink`] holds before dropping
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

/// Destination for admitted packets
pub trait EventSink: Send + Sync {
    fn append(&self, record: &PacketRecord) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct LogFile {
    file: BufWriter<File>,
    written: u64,
}

/// JSON-lines file with size-based rotation
pub struct RotatingFileSink {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    inner: Mutex<LogFile>,
}

impl RotatingFileSink {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> Result<Self> {
        let path = path.into();

        if max_bytes == 0 {
            return Err(NetlogError::Config(
                "event log size ceiling must be greater than zero".to_string(),
            ));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = open_append(&path)?;
        let written = file.metadata()?.len();

        info!(
            "Writing traffic events to {} (rotate at {} bytes, keep {})",
            path.display(),
            max_bytes,
            backups
        );

        Ok(Self {
            path,
            max_bytes,
            backups,
            inner: Mutex::new(LogFile {
                file: BufWriter::new(file),
                written,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the n-th rotated file
    pub fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&self, log: &mut LogFile) -> Result<()> {
        log.file.flush()?;

        if self.backups > 0 {
            for n in (1..self.backups).rev() {
                let from = self.backup_path(n);
                if from.exists() {
                    fs::rename(&from, self.backup_path(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
            log.file = BufWriter::new(open_append(&self.path)?);
        } else {
            log.file = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&self.path)?,
            );
        }

        log.written = 0;
        debug!("Rotated event log {}", self.path.display());
        Ok(())
    }
}

impl EventSink for RotatingFileSink {
    fn append(&self, record: &PacketRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&TrafficEvent::from(record))
            .map_err(|e| NetlogError::Sink(format!("failed to encode event: {}", e)))?;
        line.push(b'\n');

        let mut log = self
            .inner
            .lock()
            .map_err(|_| NetlogError::Sink("event log lock poisoned".to_string()))?;

        if log.written > 0 && log.written + line.len() as u64 > self.max_bytes {
            self.rotate(&mut log)?;
        }

        log.file.write_all(&line)?;
        log.written += line.len() as u64;

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut log = self
            .inner
            .lock()
            .map_err(|_| NetlogError::Sink("event log lock poisoned".to_string()))?;
        log.file.flush()?;
        Ok(())
    }
}

enum Command {
    Append(PacketRecord),
    Flush(SyncSender<Result<()>>),
}

/// Hands events to a writer thread over a bounded queue
///
/// `append` never blocks: when the queue is full the event is dropped and
/// counted, and an error is returned. `flush` blocks until every event queued
/// before it has been written and the inner sink flushed, so call it from a
/// blocking context.
pub struct QueuedSink {
    commands: SyncSender<Command>,
    dropped: Arc<AtomicU64>,
}

impl QueuedSink {
    pub fn spawn(inner: Arc<dyn EventSink>, capacity: usize) -> Result<Self> {
        let (commands, queue) = mpsc::sync_channel(capacity.max(1));

        thread::Builder::new()
            .name("event-writer".to_string())
            .spawn(move || write_events(inner, queue))?;

        Ok(Self {
            commands,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for QueuedSink {
    fn append(&self, record: &PacketRecord) -> Result<()> {
        match self.commands.try_send(Command::Append(record.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(NetlogError::Sink("event queue full, event dropped".to_string()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(NetlogError::Sink("event writer stopped".to_string()))
            }
        }
    }

    fn flush(&self) -> Result<()> {
        let (reply, done) = mpsc::sync_channel(1);
        self.commands
            .send(Command::Flush(reply))
            .map_err(|_| NetlogError::Sink("event writer stopped".to_string()))?;
        done.recv()
            .map_err(|_| NetlogError::Sink("event writer stopped".to_string()))?
    }
}

fn write_events(inner: Arc<dyn EventSink>, queue: mpsc::Receiver<Command>) {
    let mut failing = false;

    for command in queue {
        match command {
            Command::Append(record) => match inner.append(&record) {
                Ok(()) => failing = false,
                Err(e) => {
                    if !failing {
                        warn!("Failed to write traffic event: {}", e);
                    }
                    failing = true;
                }
            },
            Command::Flush(reply) => {
                let _ = reply.send(inner.flush());
            }
        }
    }

    if let Err(e) = inner.flush() {
        warn!("Failed to flush event log on exit: {}", e);
    }
    debug!("Event writer exiting");
}

/// In-memory sink, used where no event log is wanted and in tests
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TrafficEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrafficEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn append(&self, record: &PacketRecord) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| NetlogError::Sink("memory sink lock poisoned".to_string()))?
            .push(TrafficEvent::from(record));
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
