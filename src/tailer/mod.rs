//! The tailer: owns per-file handles, consumes watcher events, drives
//! incremental reads, and garbage-collects stale handles.
//!
//! # Event processing
//!
//! A single task receives events from the watcher's stream and executes
//! them serially against the handle table, so events for one path are
//! handled in delivery order and lines from one file reach the sink in
//! file-byte order. No ordering holds across distinct paths.
//!
//! The per-event rules, with `H` the handle registered for the path:
//!
//! - **Create**, no `H`: open from the start and read, if the path matches
//!   a stored pattern; otherwise ignore.
//! - **Create**, `H` open: a rotation whose Delete was missed or reordered,
//!   unless the path still resolves to the same file (spurious create).
//!   Flush the dangling partial line, reopen from the start, read.
//! - **Create**, `H` closed: the path came back. Reopen from the start,
//!   flushing the partial first when it is a different file.
//! - **Update**, `H` open: read.
//! - **Update**, `H` closed: attempt the same reopen (a poll tick may beat
//!   the create notification); permission denied just waits for the next
//!   event.
//! - **Update**, no `H`: like Create with no `H`.
//! - **Delete**: close the file but keep the handle, its partial line and
//!   its read timestamp; a re-creation carries on from that state.
//!
//! Truncation is not an event: it is detected inside the read itself by
//! comparing the file size against the cursor.
//!
//! # Back-pressure
//!
//! The sink is a bounded channel. When it fills, reads block and the event
//! loop stops consuming, pacing the whole pipeline; lines are never dropped
//! to relieve pressure.

mod handle;
mod pattern;


use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use parking_lot::{Mutex, RwLock as SyncRwLock};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::types::{Event, EventKind, LogLine};
use crate::watcher::{WatchError, Watcher};
use handle::{HandleError, LogFile};

/// Default age of the last successful read beyond which `gc` evicts a
/// handle.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors that can reach a tailer's caller.
///
/// Per-event failures (a file vanishing between event and open, a
/// permission error on a pattern match) are logged and retried on later
/// events instead of surfacing here.
#[derive(Debug, Error)]
pub enum TailerError {
    /// IO error, notably from opening an explicitly tailed path.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A glob pattern failed to compile.
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// The watcher rejected a registration.
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    /// The builder was not given a line sink.
    #[error("no line sink was provided")]
    MissingSink,

    /// The builder was not given a watcher.
    #[error("no watcher was provided")]
    MissingWatcher,
}

/// Result type for tailer operations.
pub type Result<T> = std::result::Result<T, TailerError>;

/// Builder for [`Tailer`]. A sink and a watcher are required; everything
/// else has defaults.
pub struct TailerBuilder<W> {
    lines: Option<mpsc::Sender<LogLine>>,
    watcher: Option<W>,
    one_shot: bool,
    stale_threshold: Duration,
}

impl<W: Watcher> TailerBuilder<W> {
    pub fn new() -> Self {
        TailerBuilder {
            lines: None,
            watcher: None,
            one_shot: false,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    /// The channel complete lines are emitted to.
    pub fn lines(mut self, lines: mpsc::Sender<LogLine>) -> Self {
        self.lines = Some(lines);
        self
    }

    /// The watcher to consume filesystem events from.
    pub fn watcher(mut self, watcher: W) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Read each file once to EOF and stop following it, for batch use.
    pub fn one_shot(mut self, one_shot: bool) -> Self {
        self.one_shot = one_shot;
        self
    }

    /// Age of the last successful read beyond which `gc` evicts a handle.
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Builds the tailer and starts its event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Tailer<W>> {
        let lines = self.lines.ok_or(TailerError::MissingSink)?;
        let watcher = self.watcher.ok_or(TailerError::MissingWatcher)?;
        Ok(Tailer::start(
            lines,
            watcher,
            self.one_shot,
            self.stale_threshold,
        ))
    }
}

impl<W: Watcher> Default for TailerBuilder<W> {
    fn default() -> Self {
        TailerBuilder::new()
    }
}

/// Tails a set of log files, emitting complete lines to the sink it was
/// built with. See the module docs for the event-handling rules.
pub struct Tailer<W: Watcher> {
    inner: Arc<Inner<W>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<W: Watcher> std::fmt::Debug for Tailer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tailer")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

struct Inner<W> {
    /// Taken exactly once at shutdown so the sink closes exactly once.
    lines: Mutex<Option<mpsc::Sender<LogLine>>>,
    watcher: W,
    handles: RwLock<HashMap<PathBuf, LogFile>>,
    /// Stored patterns, keyed by their source text.
    patterns: SyncRwLock<HashMap<String, Pattern>>,
    one_shot: bool,
    stale_threshold: Duration,
    shutdown: CancellationToken,
}

impl<W: Watcher> Tailer<W> {
    pub fn builder() -> TailerBuilder<W> {
        TailerBuilder::new()
    }

    fn start(
        lines: mpsc::Sender<LogLine>,
        watcher: W,
        one_shot: bool,
        stale_threshold: Duration,
    ) -> Tailer<W> {
        let inner = Arc::new(Inner {
            lines: Mutex::new(Some(lines)),
            watcher,
            handles: RwLock::new(HashMap::new()),
            patterns: SyncRwLock::new(HashMap::new()),
            one_shot,
            stale_threshold,
            shutdown: CancellationToken::new(),
        });
        let events = inner.watcher.observe();
        let run_task = tokio::spawn(Arc::clone(&inner).run(events));
        Tailer {
            inner,
            run_task: Mutex::new(Some(run_task)),
            closed: AtomicBool::new(false),
        }
    }

    /// The watcher this tailer consumes events from.
    pub fn watcher(&self) -> &W {
        &self.inner.watcher
    }

    /// Starts tailing `path`, reading from its current end.
    ///
    /// The path is recorded as pattern-matchable and its parent directory
    /// watched before the open is attempted, so an open failure (notably
    /// permission denied) is returned to the caller yet stays recoverable
    /// through later Create or Update events.
    pub async fn tail_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let abs = std::path::absolute(path.as_ref())?;
        self.inner.tail_path(&abs).await
    }

    /// Stores `pattern`, tails every file currently matching it, and
    /// watches the pattern's base directory so files that appear later are
    /// picked up from their Create events. Returns the matched paths.
    ///
    /// Open failures on individual matches are logged and skipped; those
    /// paths stay recoverable through later events.
    pub async fn add_pattern(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        self.inner.add_pattern(pattern).await
    }

    /// Evicts every handle whose last successful read is older than the
    /// stale threshold, closing its file and removing its watch.
    pub async fn gc(&self) -> Result<()> {
        self.inner.gc().await
    }

    /// Shuts the tailer down: stops consuming events, closes every handle,
    /// and closes the sink. Idempotent; errors during teardown are logged,
    /// never returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        let run_task = self.run_task.lock().take();
        if let Some(task) = run_task {
            let _ = task.await;
        }
        let mut handles = self.inner.handles.write().await;
        for handle in handles.values_mut() {
            handle.close();
        }
        handles.clear();
        // Usually already taken by the event loop on its way out.
        drop(self.inner.lines.lock().take());
        info!("tailer closed");
    }
}

impl<W: Watcher> Inner<W> {
    /// A clone of the sink, or `None` once the tailer has shut down.
    fn lines(&self) -> Option<mpsc::Sender<LogLine>> {
        self.lines.lock().clone()
    }

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("tailer event loop finished");
        // Close the sink so downstream consumers observe end-of-stream.
        drop(self.lines.lock().take());
    }

    #[instrument(skip(self, event), fields(kind = %event.kind, path = %event.pathname.display()))]
    async fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Create => self.handle_create(&event.pathname).await,
            EventKind::Update => self.handle_update(&event.pathname).await,
            EventKind::Delete => self.handle_delete(&event.pathname).await,
        }
    }

    async fn handle_create(&self, path: &Path) {
        let Some(lines) = self.lines() else { return };
        let mut handles = self.handles.write().await;
        match handles.get_mut(path) {
            Some(handle) if handle.file.is_some() => {
                let same_file = match (handle.path_id(), handle.file_id) {
                    (Some(at_path), Some(open)) => at_path == open,
                    _ => false,
                };
                if same_file {
                    debug!(path = %path.display(), "spurious create for an unchanged file");
                    handle.seen_create = true;
                    self.read(handle, &lines).await;
                    return;
                }
                // The delete of a rotation was missed or is still in
                // flight; the dangling line of the old file ends here.
                debug!(path = %path.display(), "create for an open handle, assuming rotation");
                if let Err(err) = handle.flush_partial(&lines).await {
                    debug!(path = %path.display(), error = %err, "flush failed");
                }
                handle.close();
                handle.seen_create = true;
                self.reopen_and_read(handle, &lines).await;
            }
            Some(handle) => {
                handle.seen_create = true;
                self.reopen_and_read(handle, &lines).await;
            }
            None => {
                if !self.matches_pattern(path) {
                    trace!(path = %path.display(), "create for an unmatched path, ignoring");
                    return;
                }
                self.open_discovered(&mut handles, path, &lines, true).await;
            }
        }
    }

    async fn handle_update(&self, path: &Path) {
        let Some(lines) = self.lines() else { return };
        let mut handles = self.handles.write().await;
        match handles.get_mut(path) {
            Some(handle) if handle.file.is_some() => {
                self.read(handle, &lines).await;
            }
            Some(handle) => {
                // The path was deleted; an update means something is back
                // at it, often a poll tick that beat the create event.
                if !handle.seen_create {
                    debug!(path = %path.display(), "file reappeared without a create event");
                }
                self.reopen_and_read(handle, &lines).await;
            }
            None => {
                if !self.matches_pattern(path) {
                    trace!(path = %path.display(), "update for an untracked path, ignoring");
                    return;
                }
                self.open_discovered(&mut handles, path, &lines, false).await;
            }
        }
    }

    async fn handle_delete(&self, path: &Path) {
        let mut handles = self.handles.write().await;
        match handles.get_mut(path) {
            Some(handle) => {
                // The handle survives: the partial line, the pathname and
                // the read timestamp carry over to a re-creation.
                debug!(path = %path.display(), "closing deleted file, keeping its handle");
                handle.close();
                handle.seen_create = false;
            }
            None => {
                trace!(path = %path.display(), "delete for an untracked path, ignoring");
            }
        }
    }

    /// Reopens a handle's path from the start. When the file at the path is
    /// not the one the handle last had open, the partial buffer is flushed
    /// first so the old file's dangling line comes out before any new line.
    async fn reopen_and_read(&self, handle: &mut LogFile, lines: &mpsc::Sender<LogLine>) {
        match handle.reopen() {
            Ok(distinct) => {
                if distinct {
                    if let Err(err) = handle.flush_partial(lines).await {
                        debug!(path = %handle.pathname.display(), error = %err, "flush failed");
                    }
                } else {
                    debug!(path = %handle.pathname.display(), "same file reappeared, resuming");
                }
                self.read(handle, lines).await;
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                info!(
                    path = %handle.pathname.display(),
                    error = %err,
                    "cannot reopen yet, will retry on a later event"
                );
            }
            Err(err) => {
                debug!(path = %handle.pathname.display(), error = %err, "reopen failed");
            }
        }
    }

    /// Opens a path discovered through a watcher event (rather than
    /// explicit registration) from the start, and inserts its handle.
    async fn open_discovered(
        &self,
        handles: &mut HashMap<PathBuf, LogFile>,
        path: &Path,
        lines: &mpsc::Sender<LogLine>,
        via_create: bool,
    ) {
        match LogFile::open(path, false) {
            Ok(mut handle) => {
                handle.seen_create = via_create;
                if let Err(err) = self.watcher.add(path) {
                    debug!(path = %path.display(), error = %err, "could not watch discovered file");
                }
                info!(path = %path.display(), "tailing discovered file");
                self.read(&mut handle, lines).await;
                handles.insert(path.to_path_buf(), handle);
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                info!(
                    path = %path.display(),
                    error = %err,
                    "cannot open matched file yet, will retry on a later event"
                );
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "could not open matched file");
            }
        }
    }

    /// Reads a handle, honouring one-shot mode: there, the first read of a
    /// freshly opened file is also its last, so the partial is flushed and
    /// the file closed immediately after.
    async fn read(&self, handle: &mut LogFile, lines: &mpsc::Sender<LogLine>) {
        match handle.read(lines).await {
            Ok(_) => {}
            Err(HandleError::SinkClosed) => {
                debug!(path = %handle.pathname.display(), "sink closed during read");
                return;
            }
            Err(HandleError::Io(err)) => {
                warn!(
                    path = %handle.pathname.display(),
                    error = %err,
                    "read failed, will retry on the next event"
                );
            }
        }
        if self.one_shot && handle.file.is_some() {
            if let Err(err) = handle.flush_partial(lines).await {
                debug!(path = %handle.pathname.display(), error = %err, "flush failed");
            }
            handle.close();
        }
    }

    async fn tail_path(&self, abs: &Path) -> Result<()> {
        let Some(lines) = self.lines() else {
            return Ok(());
        };
        let mut handles = self.handles.write().await;
        if handles.contains_key(abs) {
            debug!(path = %abs.display(), "already tailing");
            return Ok(());
        }

        // Record the path as pattern-matchable and watch its directory
        // before attempting the open: if the open fails, a later Create or
        // Update event can still recover the path.
        self.store_literal_pattern(abs)?;
        if let Some(dir) = abs.parent() {
            self.watcher.add(dir)?;
        }

        let mut handle = LogFile::open(abs, !self.one_shot)?;
        self.watcher.add(abs)?;
        info!(path = %abs.display(), "tailing");
        self.read(&mut handle, &lines).await;
        handles.insert(abs.to_path_buf(), handle);
        Ok(())
    }

    async fn add_pattern(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let abs = std::path::absolute(Path::new(pattern))?;
        let pattern = abs.to_string_lossy().into_owned();
        self.store_pattern(&pattern)?;

        let mut matched = Vec::new();
        for entry in glob::glob(&pattern)? {
            match entry {
                Ok(path) => match self.tail_path(&path).await {
                    Ok(()) => matched.push(path),
                    Err(err) => {
                        info!(
                            path = %path.display(),
                            error = %err,
                            "cannot tail matched file yet, will retry on a later event"
                        );
                    }
                },
                Err(err) => {
                    debug!(error = %err, "skipping unreadable glob match");
                }
            }
        }

        let base = pattern::base_dir(&pattern);
        if !base.as_os_str().is_empty() {
            self.watcher.add(&base)?;
        }
        debug!(pattern = %pattern, matched = matched.len(), "pattern registered");
        Ok(matched)
    }

    async fn gc(&self) -> Result<()> {
        let now = SystemTime::now();
        let mut handles = self.handles.write().await;
        let stale: Vec<PathBuf> = handles
            .iter()
            .filter(|(_, handle)| {
                now.duration_since(handle.last_read)
                    .map_or(false, |age| age > self.stale_threshold)
            })
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            info!(path = %path.display(), "evicting stale handle");
            if let Some(mut handle) = handles.remove(&path) {
                handle.close();
            }
            if let Err(err) = self.watcher.remove(&path) {
                debug!(path = %path.display(), error = %err, "unwatch failed during gc");
            }
        }
        Ok(())
    }

    /// Records an explicitly tailed path for event-time matching, escaping
    /// it so any metacharacter bytes in the name match verbatim.
    fn store_literal_pattern(&self, path: &Path) -> Result<()> {
        let source = Pattern::escape(&path.to_string_lossy());
        let compiled = Pattern::new(&source)?;
        self.patterns.write().insert(source, compiled);
        Ok(())
    }

    fn store_pattern(&self, pattern: &str) -> Result<()> {
        let compiled = Pattern::new(pattern)?;
        self.patterns.write().insert(pattern.to_string(), compiled);
        Ok(())
    }

    fn matches_pattern(&self, path: &Path) -> bool {
        self.patterns
            .read()
            .values()
            .any(|pattern| pattern.matches_path(path))
    }
}
