//! Ordered, whole-record writer for a single named pipe.
//!
//! One `PipeWriter` exists per target. Concurrent callers are serialized by
//! an internal mutex held for exactly one record, so records never interleave
//! in the stream.

use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::PipeTarget;

/// Delay between attempts while waiting for a reader under a deadline
const READER_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors from opening or writing a named pipe
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("Named pipe unavailable at {path}: {reason}")]
    PipeUnavailable { path: PathBuf, reason: String },

    #[error("No reader attached to {0}")]
    NoReader(PathBuf),

    #[error("Reader disconnected from {0}")]
    BrokenPipe(PathBuf),

    #[error("Another writer holds the lock for {0}")]
    TargetLocked(PathBuf),

    #[error("Writer for {0} has not been opened")]
    NotOpen(PathBuf),

    #[error("Writer for {0} is closed")]
    Closed(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipeError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What `connect` does when no reader is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    /// Wait until a reader attaches
    #[default]
    Blocking,

    /// Fail immediately with `NoReader`
    NonBlocking,
}

impl std::str::FromStr for OpenMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(Self::Blocking),
            "nonblocking" | "non-blocking" => Ok(Self::NonBlocking),
            other => Err(format!("Unknown open mode: {}", other)),
        }
    }
}

/// Options controlling how a writer acquires its pipe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterOptions {
    pub mode: OpenMode,

    /// Upper bound on waiting for a reader in blocking mode
    pub open_timeout: Option<Duration>,

    /// Hold an exclusive lock on the pipe while open
    pub exclusive: bool,
}

impl WriterOptions {
    pub fn blocking() -> Self {
        Self::default()
    }

    pub fn nonblocking() -> Self {
        Self {
            mode: OpenMode::NonBlocking,
            ..Self::default()
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Lifecycle state of a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Unopened,
    Open,
    Closed,
}

/// The exclusive lock, if any, is released with the descriptor
struct OpenPipe {
    file: File,
}

enum Slot {
    Unopened,
    Open(OpenPipe),
    Closed,
}

impl Slot {
    fn state(&self) -> WriterState {
        match self {
            Self::Unopened => WriterState::Unopened,
            Self::Open(_) => WriterState::Open,
            Self::Closed => WriterState::Closed,
        }
    }
}

/// Writer owning one named pipe target
pub struct PipeWriter {
    target: PipeTarget,
    options: WriterOptions,
    slot: Mutex<Slot>,
}

impl PipeWriter {
    /// Create an unopened writer
    pub fn new(target: PipeTarget, options: WriterOptions) -> Self {
        Self {
            target,
            options,
            slot: Mutex::new(Slot::Unopened),
        }
    }

    /// Create a writer and connect it in one step
    pub async fn open(target: PipeTarget, options: WriterOptions) -> Result<Self, PipeError> {
        let writer = Self::new(target, options);
        writer.connect().await?;
        Ok(writer)
    }

    pub fn target(&self) -> &PipeTarget {
        &self.target
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub async fn state(&self) -> WriterState {
        self.slot.lock().await.state()
    }

    /// Acquire the pipe descriptor.
    ///
    /// The internal lock is not held while waiting for a reader. On failure,
    /// or when the future is dropped under an external timeout, the writer
    /// stays unopened and may be connected again.
    pub async fn connect(&self) -> Result<(), PipeError> {
        match self.state().await {
            WriterState::Open => return Ok(()),
            WriterState::Closed => return Err(PipeError::Closed(self.path().to_path_buf())),
            WriterState::Unopened => {}
        }

        let pipe = self.acquire().await?;

        let mut slot = self.slot.lock().await;
        match slot.state() {
            WriterState::Unopened => {
                *slot = Slot::Open(pipe);
                debug!(pipe = %self.target, mode = ?self.options.mode, "Opened named pipe");
                Ok(())
            }
            // A concurrent connect won; ours is dropped
            WriterState::Open => Ok(()),
            WriterState::Closed => Err(PipeError::Closed(self.path().to_path_buf())),
        }
    }

    /// Append one whole record to the pipe.
    ///
    /// Any write failure closes the writer. A vanished reader surfaces as
    /// `BrokenPipe`; the writer never retries.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), PipeError> {
        let mut slot = self.slot.lock().await;

        let pipe = match &mut *slot {
            Slot::Open(pipe) => pipe,
            Slot::Unopened => return Err(PipeError::NotOpen(self.path().to_path_buf())),
            Slot::Closed => return Err(PipeError::Closed(self.path().to_path_buf())),
        };

        let result = match pipe.file.write_all(bytes).await {
            Ok(()) => pipe.file.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                *slot = Slot::Closed;
                if e.kind() == io::ErrorKind::BrokenPipe {
                    warn!(pipe = %self.target, "Reader disconnected, writer closed");
                    Err(PipeError::BrokenPipe(self.path().to_path_buf()))
                } else {
                    warn!(pipe = %self.target, error = %e, "Write failed, writer closed");
                    Err(PipeError::io(self.path(), e))
                }
            }
        }
    }

    /// Flush and release the pipe. Safe to call more than once.
    pub async fn close(&self) -> Result<(), PipeError> {
        let mut slot = self.slot.lock().await;
        let previous = std::mem::replace(&mut *slot, Slot::Closed);

        if let Slot::Open(mut pipe) = previous {
            let flushed = pipe.file.flush().await;
            drop(pipe);
            debug!(pipe = %self.target, "Closed named pipe");
            flushed.map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe => PipeError::BrokenPipe(self.path().to_path_buf()),
                _ => PipeError::io(self.path(), e),
            })?;
        }

        Ok(())
    }

    fn path(&self) -> &Path {
        self.target.path()
    }

    async fn acquire(&self) -> Result<OpenPipe, PipeError> {
        let path = self.path();

        if !path.exists() {
            return Err(PipeError::PipeUnavailable {
                path: path.to_path_buf(),
                reason: "path does not exist".to_string(),
            });
        }
        if !self.target.is_fifo() {
            return Err(PipeError::PipeUnavailable {
                path: path.to_path_buf(),
                reason: "not a named pipe".to_string(),
            });
        }

        let file = match self.options.mode {
            OpenMode::NonBlocking => open_fifo(path)?,
            OpenMode::Blocking => {
                let deadline = self.options.open_timeout.map(|limit| Instant::now() + limit);
                wait_for_reader(path, deadline).await?
            }
        };

        if self.options.exclusive {
            lock_fifo(&file, path)?;
        }

        Ok(OpenPipe {
            file: File::from_std(file),
        })
    }
}

/// Take the cross-process writer lock on the FIFO's own descriptor.
///
/// The lock lives as long as the descriptor, so no file is left behind.
fn lock_fifo(file: &std::fs::File, path: &Path) -> Result<(), PipeError> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(()),
        Err(e) if is_contended(&e) => Err(PipeError::TargetLocked(path.to_path_buf())),
        Err(e) => Err(PipeError::io(path, e)),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Open the write end of a FIFO without waiting.
///
/// Fails with `NoReader` (ENXIO) when nothing has the read end open. Once
/// open, the descriptor is put back into blocking mode so a full pipe applies
/// backpressure instead of failing writes.
fn open_fifo(path: &Path) -> Result<std::fs::File, PipeError> {
    let opened = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path);

    match opened {
        Ok(file) => {
            clear_nonblocking(&file).map_err(|e| PipeError::io(path, e.into()))?;
            Ok(file)
        }
        Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
            Err(PipeError::NoReader(path.to_path_buf()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PipeError::PipeUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Err(e) => Err(PipeError::io(path, e)),
    }
}

/// Wait for a reader by polling non-blocking opens, until `deadline` if set.
///
/// A blocking open(2) cannot be abandoned once started and would complete
/// against the next reader after the caller gave up. Dropping this future
/// leaves nothing behind.
async fn wait_for_reader(
    path: &Path,
    deadline: Option<Instant>,
) -> Result<std::fs::File, PipeError> {
    loop {
        match open_fifo(path) {
            Err(PipeError::NoReader(_)) => {
                let pause = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(PipeError::NoReader(path.to_path_buf()));
                        }
                        READER_POLL_INTERVAL.min(deadline - now)
                    }
                    None => READER_POLL_INTERVAL,
                };
                tokio::time::sleep(pause).await;
            }
            other => return other,
        }
    }
}

fn clear_nonblocking(file: &std::fs::File) -> nix::Result<()> {
    let fd = file.as_raw_fd();
    let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.remove(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
