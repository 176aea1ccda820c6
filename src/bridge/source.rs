//! Transcript polling sources.
//!
//! A [`TranscriptSource`] is the transcript-watching collaborator the update
//! bridge polls. Each `receive()` returns the events observed since the last
//! call, `Ok(None)` once the session's transcript has ended, or an
//! [`AppError::Parse`] for a single malformed unit that the bridge skips.

use std::collections::VecDeque;
use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::transcript::{TranscriptBatch, TranscriptEvent};
use crate::{AppError, Result};

/// Boxed future returned by source methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Polling interface over one session's transcript.
pub trait TranscriptSource: Send {
    /// Return events observed since the previous call.
    ///
    /// `Ok(None)` is the end marker: the transcript will not grow further.
    /// An empty batch means nothing new yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Parse` for a malformed unit (already consumed, so
    /// the next call proceeds past it) or `AppError::Io` on read failures.
    fn receive(&mut self) -> SourceFuture<'_, Result<Option<TranscriptBatch>>>;

    /// Release the underlying resource. Further `receive()` calls return the
    /// end marker.
    fn close(&mut self) -> SourceFuture<'_, ()>;
}

// ── JSONL file source ────────────────────────────────────────────────────────

/// Byte offset where one writer's output ends in a shared transcript file.
///
/// Set by the writer before it signals completion; readers never consume
/// past it, so a later writer appending to the same file stays invisible.
#[derive(Debug, Clone, Default)]
pub struct TranscriptEnd(Arc<AtomicU64>);

impl TranscriptEnd {
    const UNSET: u64 = u64::MAX;

    /// An end that is not known yet.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(Self::UNSET)))
    }

    /// Record the final length.
    pub fn set(&self, len: u64) {
        self.0.store(len, Ordering::SeqCst);
    }

    /// The final length, once recorded.
    #[must_use]
    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::SeqCst) {
            Self::UNSET => None,
            len => Some(len),
        }
    }
}

/// Tails a newline-delimited JSON transcript file.
///
/// The writer signals completion through `finished`; once it fires and every
/// byte written before it has been consumed, `receive()` returns `Ok(None)`.
#[derive(Debug)]
pub struct JsonlFileSource {
    path: PathBuf,
    offset: u64,
    end: Option<TranscriptEnd>,
    carry: Vec<u8>,
    lines: VecDeque<String>,
    finished: CancellationToken,
    closed: bool,
}

impl JsonlFileSource {
    /// Tail `path` from its beginning until `finished` is cancelled.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, finished: CancellationToken) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            end: None,
            carry: Vec::new(),
            lines: VecDeque::new(),
            finished,
            closed: false,
        }
    }

    /// Skip the first `offset` bytes, e.g. a previous run's output.
    #[must_use]
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Never read past `end` once it is set.
    #[must_use]
    pub fn bounded_by(mut self, end: TranscriptEnd) -> Self {
        self.end = Some(end);
        self
    }

    async fn read_new_bytes(&mut self) -> Result<()> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        // Checked after reading: bytes past the end belong to a later writer.
        if let Some(end) = self.end.as_ref().and_then(TranscriptEnd::get) {
            let allowed = usize::try_from(end.saturating_sub(self.offset)).unwrap_or(usize::MAX);
            buf.truncate(allowed);
        }
        self.offset += buf.len() as u64;
        self.carry.extend_from_slice(&buf);

        while let Some(pos) = self.carry.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            self.lines
                .push_back(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<TranscriptBatch>> {
        if self.closed {
            return Ok(None);
        }

        // Sampled before reading so bytes written ahead of the signal are seen.
        let done = self.finished.is_cancelled();
        self.read_new_bytes().await?;
        if done && !self.carry.is_empty() {
            let tail = std::mem::take(&mut self.carry);
            self.lines
                .push_back(String::from_utf8_lossy(&tail).into_owned());
        }

        let mut events = Vec::new();
        while let Some(line) = self.lines.pop_front() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) if events.is_empty() => {
                    return Err(AppError::Parse(format!(
                        "malformed transcript line in {}: {err}",
                        self.path.display()
                    )));
                }
                Err(_) => {
                    // Reported on the next call, after the good events go out.
                    self.lines.push_front(line);
                    break;
                }
            }
        }

        if events.is_empty() && self.lines.is_empty() && done {
            return Ok(None);
        }
        Ok(Some(TranscriptBatch::new(events)))
    }
}

impl TranscriptSource for JsonlFileSource {
    fn receive(&mut self) -> SourceFuture<'_, Result<Option<TranscriptBatch>>> {
        Box::pin(self.next_batch())
    }

    fn close(&mut self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.closed = true;
            self.lines.clear();
            self.carry.clear();
        })
    }
}

// ── Channel source ───────────────────────────────────────────────────────────

/// Source fed by an in-process channel.
///
/// Each `receive()` drains every queued item: consecutive batches merge into
/// one, and a queued error is returned on its own. A closed, drained channel
/// is the end marker.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<TranscriptBatch>>,
    held_error: Option<AppError>,
    closed: bool,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it.
    #[must_use]
    pub fn new() -> (mpsc::UnboundedSender<Result<TranscriptBatch>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx,
                held_error: None,
                closed: false,
            },
        )
    }

    fn drain(&mut self) -> Result<Option<TranscriptBatch>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(err) = self.held_error.take() {
            return Err(err);
        }

        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(Ok(batch)) => events.extend(batch.events),
                Ok(Err(err)) if events.is_empty() => return Err(err),
                Ok(Err(err)) => {
                    self.held_error = Some(err);
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if events.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
            }
        }
        Ok(Some(TranscriptBatch::new(events)))
    }
}

impl TranscriptSource for ChannelSource {
    fn receive(&mut self) -> SourceFuture<'_, Result<Option<TranscriptBatch>>> {
        let result = self.drain();
        Box::pin(async move { result })
    }

    fn close(&mut self) -> SourceFuture<'_, ()> {
        self.closed = true;
        self.rx.close();
        Box::pin(async {})
    }
}
