//! Incremental log file tailing.
//!
//! [`LogTail`] follows one append-only text file. Everything already in the
//! file when watching starts is consumed silently; afterwards every complete
//! line appended to the file is emitted once, in file order. An unterminated
//! trailing fragment is held until its newline arrives.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{EventSink, LogLine};

/// Errors that prevent a log tail from starting.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The directory holding the log file could not be created.
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The log file could not be created.
    #[error("failed to create log file {}: {source}", path.display())]
    CreateFile {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The log file could not be opened or read.
    #[error("failed to read log file {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Filesystem notifications could not be subscribed.
    #[error("failed to watch log file {}: {source}", path.display())]
    Watch {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: notify::Error,
    },
}

/// Splits newly appended bytes into complete lines.
struct LineReader {
    file: File,
    offset: u64,
    pending: Vec<u8>,
    /// The next completed line started before watching began.
    skip_next: bool,
}

impl LineReader {
    fn new(file: File) -> Self {
        Self {
            file,
            offset: 0,
            pending: Vec::new(),
            skip_next: false,
        }
    }

    /// Consume the current contents without producing lines.
    async fn catch_up(&mut self) -> io::Result<usize> {
        let skipped = self.drain().await?.len();
        self.skip_next = !self.pending.is_empty();
        self.pending.clear();
        Ok(skipped)
    }

    /// Read everything appended since the last drain and return complete lines.
    async fn drain(&mut self) -> io::Result<Vec<String>> {
        let mut chunk = Vec::new();
        let read = self.file.read_to_end(&mut chunk).await?;
        self.offset += read as u64;
        self.pending.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if std::mem::take(&mut self.skip_next) {
                continue;
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(lines)
    }
}

/// A running tail over one log file.
///
/// Watching lasts until [`LogTail::stop`] is called or the value is dropped.
pub struct LogTail {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl fmt::Debug for LogTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogTail")
            .field("path", &self.path)
            .field("watching", &self.is_watching())
            .finish()
    }
}

impl LogTail {
    /// Start tailing `path`, creating it (and its directories) if missing.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        path: impl Into<PathBuf>,
        sink: Arc<dyn EventSink<LogLine>>,
    ) -> Result<Self, SetupError> {
        let path = path.into();
        let file = open_or_create(&path).await?;

        let mut reader = LineReader::new(file);
        let skipped = reader.catch_up().await.map_err(|source| SetupError::Read {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), skipped, offset = reader.offset, "Caught up with existing log");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if is_content_change(&event.kind) => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Log watch error"),
            }
        })
        .map_err(|source| SetupError::Watch {
            path: path.clone(),
            source,
        })?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|source| SetupError::Watch {
                path: path.clone(),
                source,
            })?;

        let task = tokio::spawn(follow(reader, rx, sink, path.clone()));
        tracing::info!(path = %path.display(), "Started watching log file");

        Ok(Self {
            path,
            watcher: Some(watcher),
            task,
        })
    }

    /// The file being tailed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while change notifications are being processed.
    pub fn is_watching(&self) -> bool {
        self.watcher.is_some() && !self.task.is_finished()
    }

    /// Stop watching. Lines appended afterwards are not emitted.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            tracing::debug!(path = %self.path.display(), "Stopped watching log file");
        }
        self.task.abort();
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any | EventKind::Other
    )
}

async fn open_or_create(path: &Path) -> Result<File, SetupError> {
    loop {
        match File::open(path).await {
            Ok(file) => return Ok(file),
            // A missing file or a missing (or non-directory) parent both end
            // up here; creation reports the precise failure.
            Err(e) if e.kind() != io::ErrorKind::PermissionDenied => {
                if let Some(dir) = path.parent()
                    && !dir.as_os_str().is_empty()
                {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .map_err(|source| SetupError::CreateDir {
                            path: dir.to_path_buf(),
                            source,
                        })?;
                }
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|source| SetupError::CreateFile {
                        path: path.to_path_buf(),
                        source,
                    })?;
                tracing::debug!(path = %path.display(), "Created empty log file");
            }
            Err(source) => {
                return Err(SetupError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

async fn follow(
    mut reader: LineReader,
    mut changes: mpsc::UnboundedReceiver<()>,
    sink: Arc<dyn EventSink<LogLine>>,
    path: PathBuf,
) {
    while changes.recv().await.is_some() {
        // One drain covers every notification queued so far.
        while changes.try_recv().is_ok() {}

        match reader.drain().await {
            Ok(lines) => {
                for line in lines {
                    sink.emit(LogLine(line));
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to read log file"),
        }
    }
}
