//! Execution log sink.
//!
//! A single writer task owns the destination and is fed through a bounded
//! mpsc channel, so concurrent pollers never write to the file directly.
//! Records from one producer are written in the order they were
//! submitted; the writer flushes after each batch it drains.
//!
//! # Panic-Free Guarantees
//!
//! - Serialization and write failures are logged and counted, never fatal
//! - A record torn by a failed write is terminated before the next one, so
//!   later records always start on a fresh line
//! - A closed sink is reported to producers as `SinkError::Closed`

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nblog_core::LogRecord;

/// Default number of records buffered between producers and the writer.
pub const DEFAULT_BUFFER: usize = 1024;

/// Default number of records written between flushes.
pub const DEFAULT_BATCH: usize = 64;

/// Errors from the log sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open execution log {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The writer task has stopped accepting records.
    #[error("log sink closed")]
    Closed,
}

/// Sink tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOptions {
    pub buffer: usize,
    pub batch: usize,
    /// Emit a one-line summary of each record at info level.
    pub echo: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
            batch: DEFAULT_BATCH,
            echo: false,
        }
    }
}

/// Totals reported when the sink shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub records_written: u64,
    /// Number of `cell_input` records written.
    pub cells_executed: u64,
    pub write_failures: u64,
}

/// Counters shared between the writer task and its owner.
#[derive(Debug, Default)]
struct SinkCounters {
    records_written: AtomicU64,
    cells_executed: AtomicU64,
    write_failures: AtomicU64,
}

impl SinkCounters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            records_written: self.records_written.load(Ordering::Relaxed),
            cells_executed: self.cells_executed.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    fn write_failed(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cheap-to-clone producer handle.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    sender: mpsc::Sender<LogRecord>,
}

impl SinkHandle {
    /// Wraps a raw sender. Records go wherever the receiver is drained.
    pub fn from_sender(sender: mpsc::Sender<LogRecord>) -> Self {
        Self { sender }
    }

    /// Hands a record to the writer, waiting for buffer space.
    pub async fn submit(&self, record: LogRecord) -> Result<(), SinkError> {
        self.sender
            .send(record)
            .await
            .map_err(|_| SinkError::Closed)
    }

    /// Returns true if the writer has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Owner side of the sink: controls shutdown and collects stats.
pub struct LogSink {
    task: JoinHandle<SinkStats>,
    stop: CancellationToken,
    counters: Arc<SinkCounters>,
}

impl LogSink {
    /// Opens (creating or appending to) the log file and starts the writer.
    pub async fn open(path: &Path, options: SinkOptions) -> Result<(Self, SinkHandle), SinkError> {
        let open_error = |source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_error)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(open_error)?;

        info!(path = %path.display(), "Execution log opened");
        Ok(Self::spawn(file, options))
    }

    /// Starts a writer over any async destination.
    pub fn spawn<W>(writer: W, options: SinkOptions) -> (Self, SinkHandle)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(options.buffer.max(1));
        let stop = CancellationToken::new();
        let counters = Arc::new(SinkCounters::default());
        let writer = RecordWriter {
            receiver,
            writer,
            batch: options.batch.max(1),
            echo: options.echo,
            counters: counters.clone(),
            torn: false,
        };
        let task = tokio::spawn(writer.run(stop.clone()));
        (
            Self {
                task,
                stop,
                counters,
            },
            SinkHandle::from_sender(sender),
        )
    }

    /// Stops accepting new records, writes what is already buffered, and
    /// returns the totals. Gives up after `grace`, returning the totals
    /// counted so far.
    pub async fn close(self, grace: Duration) -> SinkStats {
        self.stop.cancel();
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                let stats = self.counters.snapshot();
                warn!(error = %e, records = stats.records_written, "Log sink task failed");
                stats
            }
            Err(_) => {
                let stats = self.counters.snapshot();
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    records = stats.records_written,
                    "Log sink did not drain in time; totals are partial"
                );
                stats
            }
        }
    }
}

struct RecordWriter<W> {
    receiver: mpsc::Receiver<LogRecord>,
    writer: W,
    batch: usize,
    echo: bool,
    counters: Arc<SinkCounters>,
    /// The last failed write left part of a line in the destination.
    torn: bool,
}

impl<W> RecordWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, stop: CancellationToken) -> SinkStats {
        let mut closing = false;

        loop {
            let record = tokio::select! {
                record = self.receiver.recv() => record,
                _ = stop.cancelled(), if !closing => {
                    // Refuse new records but keep draining the buffer.
                    closing = true;
                    self.receiver.close();
                    continue;
                }
            };
            let Some(record) = record else {
                break;
            };

            self.write(&record).await;
            for _ in 1..self.batch {
                match self.receiver.try_recv() {
                    Ok(record) => self.write(&record).await,
                    Err(_) => break,
                }
            }
            self.flush().await;
        }

        self.flush().await;
        let stats = self.counters.snapshot();
        info!(
            records = stats.records_written,
            cells_executed = stats.cells_executed,
            write_failures = stats.write_failures,
            "Execution log closed"
        );
        stats
    }

    async fn write(&mut self, record: &LogRecord) {
        let mut line = match record.to_json_line() {
            Ok(line) => line,
            Err(e) => {
                self.counters.write_failed();
                warn!(
                    session_id = %record.session_id,
                    kind = record.kind.name(),
                    error = %e,
                    "Failed to serialize log record"
                );
                return;
            }
        };
        line.push('\n');
        if self.torn {
            line.insert(0, '\n');
        }

        if let Err(e) = self.write_line(line.as_bytes()).await {
            self.counters.write_failed();
            warn!(
                session_id = %record.session_id,
                kind = record.kind.name(),
                error = %e,
                "Failed to write log record"
            );
            return;
        }

        self.counters.records_written.fetch_add(1, Ordering::Relaxed);
        if record.kind.is_cell_input() {
            self.counters.cells_executed.fetch_add(1, Ordering::Relaxed);
        }
        if self.echo {
            info!("{}", record.summary());
        } else {
            debug!(session_id = %record.session_id, kind = record.kind.name(), "Record written");
        }
    }

    /// Writes `bytes` in full, tracking whether a failure left a partial
    /// line behind. A leading newline only repairs an earlier tear.
    async fn write_line(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let repair = usize::from(self.torn);
        let mut written = 0;
        while written < bytes.len() {
            let result = match self.writer.write(&bytes[written..]).await {
                Ok(0) => Err(std::io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
            if written > 0 {
                self.torn = written > repair;
            }
            return result;
        }
        self.torn = false;
        Ok(())
    }

    async fn flush(&mut self) {
        if let Err(e) = self.writer.flush().await {
            self.counters.write_failed();
            warn!(error = %e, "Failed to flush execution log");
        }
    }
}
